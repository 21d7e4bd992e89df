mod common;

use common::{Harness, blob, id, limits};
use stash_engine::error::ErrorKind;
use stash_engine::{FetchOutcome, SyncOptions};
use stash_remote::MockRemote;
use stash_storage::{ByteStore, Slot};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn pending_content_survives_every_eviction() {
    let h = Harness::new(limits(2), MockRemote::default().with_cacheable(["r1", "r2", "r3"])).await;
    for name in ["a", "b"] {
        h.engine.put_pending(&id(name), blob(name)).await.unwrap();
        h.engine.put_cached(&id(name), blob(name)).await.unwrap();
    }
    assert!(h.engine.evict_one().await.unwrap().is_none());
    assert_eq!(h.engine.evict_until_fits(0).await.unwrap(), 2);
    assert!(h.engine.put_cached(&id("c"), blob("c")).await.is_err());
    h.engine.refresh(1, &CancellationToken::new()).await.unwrap();
    for name in ["a", "b"] {
        assert_eq!(h.pending.get(&id(name)).await.unwrap(), Some(Slot::Present(blob(name))));
    }
    assert_eq!(h.cached_ids().await.len(), 2);
}

#[tokio::test]
async fn cache_never_exceeds_its_bound() {
    let names: Vec<String> = (0..12).map(|i| format!("remote-{i}")).collect();
    let remote = MockRemote::with_blobs(names.iter().map(|n| (n.as_str(), "text/plain", n.as_bytes().to_vec())))
        .with_cacheable(names.iter().map(String::as_str));
    let h = Harness::new(limits(3), remote).await;
    for i in 0..10 {
        h.engine.put_cached(&id(&format!("local-{i}")), blob("x")).await.unwrap();
        assert!(h.cached_ids().await.len() <= 3);
    }
    let _guard = h.engine.register(id("local-9"));
    for concurrency in [1, 4] {
        h.engine.refresh(concurrency, &CancellationToken::new()).await.unwrap();
        assert!(h.cached_ids().await.len() <= 3);
        assert!(h.cached_ids().await.contains(&id("local-9")));
    }
}

#[tokio::test]
async fn overflow_leaves_both_stores_unchanged() {
    let h = Harness::new(limits(2), MockRemote::default()).await;
    for name in ["a", "b"] {
        h.engine.put_cached(&id(name), blob(name)).await.unwrap();
        h.engine.put_pending(&id(name), blob(name)).await.unwrap();
    }
    let cached_before = h.cached_ids().await;
    let pending_before = h.pending_ids().await;

    let err = h.engine.put_cached(&id("c"), blob("c")).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::CacheOverflow(overflowed) if overflowed == &id("c")));
    assert_eq!(h.cached_ids().await, cached_before);
    assert_eq!(h.pending_ids().await, pending_before);
    assert_eq!(h.engine.snapshot().cached, cached_before);
}

#[tokio::test]
async fn verified_upload_is_promoted() {
    let h = Harness::new(limits(4), MockRemote::default()).await;
    let content = blob("fresh content");
    h.engine.put_pending(&id("x"), content.clone()).await.unwrap();
    let report = h.engine.sync_pending(1, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.promoted, vec![id("x")]);
    assert!(h.pending_ids().await.is_empty());
    assert_eq!(h.cache.get(&id("x")).await.unwrap(), Some(Slot::Present(content.clone())));
    assert_eq!(h.engine.get(&id("x")).await.unwrap(), Some(content));
    let snapshot = h.engine.snapshot();
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.cached, vec![id("x")]);
}

#[tokio::test]
async fn mismatched_upload_stays_pending() {
    let h = Harness::new(limits(4), MockRemote::default()).await;
    h.remote.corrupt_downloads("x").await;
    h.engine.put_pending(&id("x"), blob("precious")).await.unwrap();

    let err = h.engine.sync_pending(1, &CancellationToken::new()).await.unwrap_err();
    let ErrorKind::Partial(partial) = &*err else {
        panic!("expected an aggregate error, got {err:?}");
    };
    assert!(partial.succeeded.is_empty());
    assert_eq!(partial.failure(&id("x")).unwrap().kind, stash_engine::error::FailureKind::VerificationMismatch);
    assert_eq!(h.pending_ids().await, vec![id("x")]);
    assert!(h.cached_ids().await.is_empty());
    assert!(h.engine.snapshot().upload_errors.contains_key(&id("x")));

    // Error maps are clearable per id, independently of the aggregate.
    h.engine.clear_upload_error(&id("x"));
    assert!(h.engine.snapshot().upload_errors.is_empty());
}

#[tokio::test]
async fn remote_checksum_failure_on_recheck_is_a_mismatch() {
    let h = Harness::new(limits(4), MockRemote::default()).await;
    h.remote.fail_checksums("x").await;
    h.engine.put_pending(&id("x"), blob("precious")).await.unwrap();

    let err = h.engine.sync_pending(1, &CancellationToken::new()).await.unwrap_err();
    let ErrorKind::Partial(partial) = &*err else {
        panic!("expected an aggregate error, got {err:?}");
    };
    assert_eq!(partial.failure(&id("x")).unwrap().kind, stash_engine::error::FailureKind::VerificationMismatch);
    assert_eq!(h.pending_ids().await, vec![id("x")]);
    assert!(h.cached_ids().await.is_empty());
}

#[tokio::test]
async fn mounted_id_is_never_the_victim() {
    let h = Harness::new(limits(3), MockRemote::default()).await;
    for name in ["a", "b", "c"] {
        h.engine.put_cached(&id(name), blob(name)).await.unwrap();
    }
    let _guard = h.engine.register(id("b"));
    let mut evicted = Vec::new();
    while let Some(victim) = h.engine.evict_one().await.unwrap() {
        evicted.push(victim);
    }
    assert_eq!(evicted, vec![id("a"), id("c")]);
    assert_eq!(h.cached_ids().await, vec![id("b")]);
}

#[tokio::test]
async fn recent_ids_are_protected_after_unmount() {
    let h = Harness::new(
        stash_engine::Limits {
            max_cache: 2,
            max_recent: 1,
            ..stash_engine::Limits::default()
        },
        MockRemote::default(),
    )
    .await;
    h.engine.put_cached(&id("a"), blob("a")).await.unwrap();
    h.engine.put_cached(&id("b"), blob("b")).await.unwrap();
    h.engine.register(id("a")).release();
    h.engine.put_cached(&id("c"), blob("c")).await.unwrap();
    assert_eq!(h.cached_ids().await, vec![id("c"), id("a")]);
}

#[tokio::test]
async fn promotion_without_room_still_demotes() {
    let h = Harness::new(limits(1), MockRemote::default()).await;
    h.engine.put_cached(&id("m"), blob("m")).await.unwrap();
    let _guard = h.engine.register(id("m"));
    h.engine.put_pending(&id("x"), blob("x")).await.unwrap();
    let report = h.engine.sync_pending(1, &CancellationToken::new()).await.unwrap();
    assert!(report.promoted.is_empty());
    assert_eq!(report.uncached, vec![id("x")]);
    assert!(h.pending_ids().await.is_empty());
    assert_eq!(h.cached_ids().await, vec![id("m")]);
    assert!(h.remote.object("x").await.is_some());
}

#[tokio::test]
async fn refresh_classifies_outcomes() {
    let remote = MockRemote::with_blobs([("present", "image/png", vec![1, 2, 3])])
        .with_tombstones(["deleted"])
        .with_cacheable(["present", "deleted", "unknown"]);
    let h = Harness::new(limits(8), remote).await;
    let report = h.engine.refresh(2, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.with_outcome(FetchOutcome::Cached), vec![&id("present")]);
    assert_eq!(report.with_outcome(FetchOutcome::Tombstone), vec![&id("deleted")]);
    assert_eq!(report.with_outcome(FetchOutcome::Missing), vec![&id("unknown")]);
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.cached, vec![id("present")]);
    assert_eq!(snapshot.missing.into_iter().collect::<Vec<_>>(), vec![id("unknown")]);
}

#[tokio::test]
async fn provider_failure_is_aggregated_but_recent_still_refreshes() {
    let remote = MockRemote::with_blobs([("seen", "text/plain", b"seen".to_vec())]).with_cacheable(["seen"]);
    let h = Harness::new(
        stash_engine::Limits {
            max_cache: 4,
            max_recent: 2,
            ..stash_engine::Limits::default()
        },
        remote,
    )
    .await;
    h.remote.fail_cacheable().await;
    h.engine.register(id("seen")).release();
    let err = h.engine.refresh(1, &CancellationToken::new()).await.unwrap_err();
    let ErrorKind::Partial(partial) = &*err else {
        panic!("expected an aggregate error, got {err:?}");
    };
    assert_eq!(partial.succeeded, vec![id("seen")]);
    assert_eq!(partial.failures.len(), 1);
    assert_eq!(partial.failures[0].id, None);
    assert_eq!(h.cached_ids().await, vec![id("seen")]);
}

#[tokio::test]
async fn download_failures_populate_cache_errors() {
    let remote = MockRemote::with_blobs([("ok", "text/plain", b"ok".to_vec()), ("flaky", "text/plain", b"f".to_vec())])
        .with_cacheable(["flaky", "ok"]);
    let h = Harness::new(limits(8), remote).await;
    h.remote.fail_downloads("flaky").await;
    let err = h.engine.sync(SyncOptions::default()).await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::Partial(p) if p.failure(&id("flaky")).is_some()));
    let snapshot = h.engine.snapshot();
    assert!(snapshot.cache_errors.contains_key(&id("flaky")));
    assert_eq!(snapshot.cached, vec![id("ok")]);
}
