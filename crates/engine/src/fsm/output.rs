//! State machine output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each sub-component, eg. the server manager or the control peer
//! registry, is given a copy of this outbox with specific capabilities,
//! eg. transport connection, timers, line transmission, to communicate
//! with the reactor.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::fsm::event::Event;
use crate::fsm::handler::DisconnectReason;
use crate::net::{LocalDuration, PeerId, ServerId};

/// Output of a state transition of the engine state machine.
pub type Io = crate::net::Io<Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to open server transports.
pub trait Connect {
    /// Dial a server.
    fn connect(&self, id: &ServerId, host: &str, port: u16);
}

/// Ability to tear server transports down.
pub trait Disconnect {
    /// Close a server transport.
    fn disconnect(&self, id: &ServerId, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// Ability to put whole IRC lines on a server transport.
///
/// Callers are expected to have gone through the rate-limited queue
/// first; this writes through to the reactor.
pub trait Transmit {
    /// Send one line, CR-LF appended.
    fn transmit(&self, id: &ServerId, line: &str);
}

/// Holds state machine outputs and pending I/O.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().expect("outbox lock poisoned").pop_front()
    }
}

impl Outbox {
    /// Push an output to the channel.
    pub fn push(&self, output: Io) {
        self.outbound
            .lock()
            .expect("outbox lock poisoned")
            .push_back(output);
    }

    /// Push an event to the channel.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }

    /// Send one response line to a control peer, LF appended.
    pub fn peer_line(&self, peer: PeerId, line: &str) {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        self.push(Io::PeerWrite(peer, bytes));
    }

    /// Drop a control peer.
    pub fn drop_peer(&self, peer: PeerId) {
        self.push(Io::DropPeer(peer));
    }
}

impl Transmit for Outbox {
    fn transmit(&self, id: &ServerId, line: &str) {
        debug!(target: "fsm", "{}: Sending {:?}", id, line);

        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");

        self.push(Io::Write(id.clone(), bytes));
    }
}

impl Connect for Outbox {
    fn connect(&self, id: &ServerId, host: &str, port: u16) {
        debug!(target: "fsm", "{}: Connecting to {}:{}", id, host, port);

        self.push(Io::Connect(id.clone(), host.to_owned(), port));
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, id: &ServerId, reason: DisconnectReason) {
        debug!(target: "fsm", "{}: Disconnecting: {}", id, reason);

        self.push(Io::Disconnect(id.clone(), reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}
