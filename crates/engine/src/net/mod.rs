//! Networking core types.
//!
//! The reactor multiplexes IRC server connections, the control-socket
//! listener and its accepted peers over a single `poll` loop. The
//! engine state machine drives all I/O through [`Io`] instructions and
//! is itself driven through the [`StateMachine`] callbacks.
use std::{borrow::Cow, fmt, io, sync::Arc};

use async_trait::async_trait;

pub use time::{LocalDuration, LocalTime};

pub mod error;
pub mod reactor;
pub mod socket;
pub mod time;

/// Identifier of a configured IRC server.
pub type ServerId = String;

/// Identifier of an accepted control-socket peer.
pub type PeerId = u64;

/// A source registered with the poll loop.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Source {
    /// An IRC server connection.
    Server(ServerId),
    /// The control-socket listener.
    Listener,
    /// An accepted control-socket peer.
    Peer(PeerId),
    /// The loop waker.
    Waker,
}

/// Output of a state transition of the state machine.
#[derive(Debug)]
pub enum Io<E, D> {
    /// Bytes ready to be sent to an IRC server.
    Write(ServerId, Vec<u8>),
    /// Bytes ready to be sent to a control peer.
    PeerWrite(PeerId, Vec<u8>),
    /// Open a transport to a server.
    Connect(ServerId, String, u16),
    /// Tear a server transport down.
    Disconnect(ServerId, D),
    /// Drop a control peer.
    DropPeer(PeerId),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
}

/// Why a server transport went away.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// Error while dialing the remote. Occurs before a connection was
    /// ever established.
    DialError(Arc<io::Error>),
    /// Error on an established connection.
    ConnectionError(Arc<io::Error>),
    /// The state machine itself asked for the disconnection.
    StateMachine(T),
}

impl<T> Disconnect<T> {
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialError(err) => write!(f, "{}", err),
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// A state machine drivable by the reactor.
///
/// The machine emits [`Io`] instructions to the reactor via its
/// [`Iterator`] implementation; the reactor feeds readiness results
/// back through these callbacks.
#[async_trait]
pub trait StateMachine: Iterator<Item = Io<Self::Ev, Self::DisconnectReason>> {
    /// Events emitted by the state machine, forwarded to the user
    /// thread by the reactor.
    type Ev: fmt::Debug + Send;
    /// Reason a server was disconnected by machine logic.
    type DisconnectReason: fmt::Debug + fmt::Display + Send;

    /// Called once before any other callback.
    async fn initialize(&mut self, _time: LocalTime) {}
    /// Raw bytes arrived from a server transport.
    async fn message_received(&mut self, id: &ServerId, bytes: Cow<'_, [u8]>);
    /// An outbound connection attempt is underway.
    fn attempted(&mut self, id: &ServerId);
    /// A server transport is established.
    fn connected(&mut self, id: &ServerId);
    /// A server transport went away, for any reason.
    async fn disconnected(&mut self, id: &ServerId, reason: Disconnect<Self::DisconnectReason>);
    /// A control peer was accepted.
    fn peer_connected(&mut self, peer: PeerId);
    /// Raw bytes arrived from a control peer.
    async fn peer_bytes_received(&mut self, peer: PeerId, bytes: Cow<'_, [u8]>);
    /// A control peer hung up or was dropped.
    fn peer_disconnected(&mut self, peer: PeerId);
    /// Clock update; called on every loop iteration.
    fn tick(&mut self, now: LocalTime);
    /// A timer set with [`Io::SetTimer`] has expired.
    async fn timer_expired(&mut self);
}

/// A [`StateMachine`] that additionally accepts external commands,
/// delivered through the reactor's command channel and waker.
#[async_trait]
pub trait Service: StateMachine {
    /// Commands handled by the service.
    type Command: Send;

    /// An external command has been received.
    async fn command_received(&mut self, cmd: Self::Command);
}

/// Wakes the poll loop from another thread, typically after sending a
/// command on the service's channel.
pub trait Waker: Send + Sync + Clone {
    fn wake(&self) -> io::Result<()>;
}
