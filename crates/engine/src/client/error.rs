//! Client errors.
use thiserror::Error;

/// An error constructing or running the engine client.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A reactor error.
    #[error(transparent)]
    Reactor(#[from] crate::net::error::Error),
}
