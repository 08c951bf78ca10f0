//! Engine handles are created from clients by users of the library,
//! to communicate with the running engine from outside its loop.
use async_trait::async_trait;
use flume as chan;
use thiserror::Error;

use crate::fsm::handler::Command;
use crate::fsm::servers::ServerConfig;
use crate::net::ServerId;

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with a running engine.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a raw command to the engine.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Add a server and start connecting it.
    async fn connect(&self, config: ServerConfig) -> Result<(), Error>;

    /// Disconnect one server, or all of them.
    async fn disconnect(&self, id: Option<ServerId>) -> Result<(), Error>;

    /// Force a reconnection of one server, or all of them.
    async fn reconnect(&self, id: Option<ServerId>) -> Result<(), Error>;

    /// List the configured server ids, in insertion order.
    async fn servers(&self) -> Result<Vec<ServerId>, Error>;

    /// Ask the engine to QUIT everywhere ahead of process exit.
    async fn shutdown(&self) -> Result<(), Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn connect(&self, config: ServerConfig) -> Result<(), Error>;
        async fn disconnect(&self, id: Option<ServerId>) -> Result<(), Error>;
        async fn reconnect(&self, id: Option<ServerId>) -> Result<(), Error>;
        async fn servers(&self) -> Result<Vec<ServerId>, Error>;
        async fn shutdown(&self) -> Result<(), Error>;
    }
}
