use async_stream::stream;
use futures::Stream;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// Runs `futures` with at most `concurrency` in flight, admitting them in
/// order, and yields outputs as they complete.
///
/// Once `token` is cancelled no further futures are admitted; the ones
/// already running are driven to completion (they observe the token
/// themselves). Dropping the stream drops whatever is still running.
pub(crate) fn bounded<'a, Fut>(
    futures: Vec<Fut>,
    concurrency: usize,
    token: &'a CancellationToken,
) -> impl Stream<Item = Fut::Output> + 'a
where
    Fut: Future + 'a,
{
    let concurrency = concurrency.max(1);
    // `rustfmt` does not format macros that use braces. Wrap in parentheses!
    stream!({
        let mut queued = VecDeque::from(futures);
        let mut running = FuturesUnordered::new();
        loop {
            while running.len() < concurrency && !token.is_cancelled() {
                match queued.pop_front() {
                    Some(future) => running.push(future),
                    None => break,
                }
            }
            match running.next().await {
                Some(output) => yield output,
                None => break,
            }
        }
    })
}
