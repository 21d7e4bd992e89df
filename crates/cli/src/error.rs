//! CLI Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    /// A store or remote named in the configuration could not be opened.
    #[display("could not open {_0}")]
    Backend(#[error(not(source))] String),
    #[display("{_0}")]
    Engine(#[error(not(source))] &'static str),
    #[display("invalid id: {_0}")]
    InvalidId(#[error(not(source))] String),
    #[display("no content for {_0}")]
    NotFound(#[error(not(source))] String),
    #[display("i/o error on {_0}")]
    Io(#[error(not(source))] String),
}
