//! Reactor errors.

use std::io;

use thiserror::Error;

/// An error occuring while running the reactor.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The control socket path could not be bound.
    #[error("control socket {path}: {source}")]
    Bind {
        path: std::path::PathBuf,
        source: io::Error,
    },

    /// A channel send or receive error.
    #[error("channel error: {0}")]
    Channel(Box<dyn std::error::Error + Send + Sync + 'static>),
}
