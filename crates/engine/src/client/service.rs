//! Client service. Wraps the engine state machine and handles line
//! decoding for server transports and control peers.
use std::borrow::Cow;
use std::collections::HashMap;

use async_trait::async_trait;
use tracing::warn;

use tern_proto::Message;

use crate::client::stream::Decoder;
use crate::common::time::TickClock;
use crate::fsm;
use crate::fsm::event::Event;
use crate::net::{Disconnect, Io, LocalTime, PeerId, ServerId, StateMachine};

/// Read buffer sizing hint for a fresh connection.
const INBOX_CAPACITY: usize = 1024;

/// The engine, drivable by the reactor.
pub struct Service<C> {
    inboxes: HashMap<ServerId, Decoder>,
    peer_inboxes: HashMap<PeerId, Decoder>,
    machine: fsm::handler::StateMachine<C>,
}

impl<C: TickClock> Service<C> {
    pub fn new(config: fsm::handler::Config, clock: C, rng: fastrand::Rng) -> Self {
        Self {
            inboxes: HashMap::new(),
            peer_inboxes: HashMap::new(),
            machine: fsm::handler::StateMachine::new(config, clock, rng),
        }
    }
}

#[async_trait]
impl<C: TickClock + Send> StateMachine for Service<C> {
    type Ev = Event;
    type DisconnectReason = fsm::handler::DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time);
    }

    async fn message_received(&mut self, id: &ServerId, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(id) else {
            warn!(target: "client", "{}: Bytes from unknown server dropped", id);
            return;
        };
        inbox.input(&bytes);

        loop {
            let Some(line) = self.inboxes.get_mut(id).and_then(Decoder::decode_next) else {
                break;
            };
            match Message::parse(&line) {
                Ok(msg) => self.machine.irc_message(id, msg),
                Err(err) => {
                    // A garbled line is the server's problem, not a
                    // reason to drop the link.
                    warn!(target: "client", "{}: Discarding malformed line: {}", id, err);
                }
            }
        }
    }

    fn attempted(&mut self, id: &ServerId) {
        self.machine.transport_attempted(id);
    }

    fn connected(&mut self, id: &ServerId) {
        self.inboxes
            .insert(id.clone(), Decoder::new(INBOX_CAPACITY));
        self.machine.transport_connected(id);
    }

    async fn disconnected(&mut self, id: &ServerId, reason: Disconnect<Self::DisconnectReason>) {
        self.inboxes.remove(id);
        self.machine.transport_disconnected(id, reason);
    }

    fn peer_connected(&mut self, peer: PeerId) {
        self.peer_inboxes.insert(peer, Decoder::new(INBOX_CAPACITY));
        self.machine.peer_connected(peer);
    }

    async fn peer_bytes_received(&mut self, peer: PeerId, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.peer_inboxes.get_mut(&peer) else {
            return;
        };
        inbox.input(&bytes);

        while let Some(line) = self
            .peer_inboxes
            .get_mut(&peer)
            .and_then(Decoder::decode_next)
        {
            self.machine.control_line(peer, &line);
        }
    }

    fn peer_disconnected(&mut self, peer: PeerId) {
        self.peer_inboxes.remove(&peer);
        self.machine.peer_disconnected(peer);
    }

    fn tick(&mut self, now: LocalTime) {
        self.machine.tick(now);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired();
    }
}

#[async_trait]
impl<C: TickClock + Send> crate::net::Service for Service<C> {
    type Command = fsm::handler::Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd);
    }
}

impl<C: TickClock> Iterator for Service<C> {
    type Item = Io<Event, fsm::handler::DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        self.machine.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::RefClock;
    use crate::fsm::servers::ServerConfig;

    fn service() -> Service<RefClock> {
        let clock = RefClock::from(LocalTime::from_secs(1_000));
        let mut service = Service::new(
            fsm::handler::Config::default(),
            clock,
            fastrand::Rng::with_seed(3),
        );

        let id = "irc".to_owned();
        service
            .machine
            .servers
            .add(ServerConfig::new("irc", "irc.example.org", 6667, "bot", "bot", "b"))
            .unwrap();
        service.connected(&id);
        service
    }

    fn written(service: &mut Service<RefClock>) -> Vec<String> {
        service
            .by_ref()
            .filter_map(|io| match io {
                Io::Write(_, bytes) => {
                    Some(String::from_utf8_lossy(&bytes).trim_end().to_owned())
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn bytes_become_lines_become_replies() {
        let mut service = service();
        written(&mut service);

        // Split mid-line across two reads, CR-LF framing.
        service
            .message_received(&"irc".to_owned(), Cow::Borrowed(b"PING :ab"))
            .await;
        assert!(written(&mut service).is_empty());

        service
            .message_received(&"irc".to_owned(), Cow::Borrowed(b"c\r\n"))
            .await;
        assert_eq!(written(&mut service), vec!["PONG abc"]);
    }

    #[tokio::test]
    async fn malformed_line_is_dropped_connection_survives() {
        let mut service = service();
        written(&mut service);

        service
            .message_received(
                &"irc".to_owned(),
                Cow::Borrowed(b"123456 bogus\r\nPING :ok\r\n"),
            )
            .await;

        assert_eq!(written(&mut service), vec!["PONG ok"]);
    }

    #[tokio::test]
    async fn control_lines_reach_the_verb_table() {
        let mut service = service();
        written(&mut service);

        service.peer_connected(1);
        service
            .peer_bytes_received(1, Cow::Borrowed(b"SERVER-LIST\n"))
            .await;

        let replies: Vec<String> = service
            .by_ref()
            .filter_map(|io| match io {
                Io::PeerWrite(1, bytes) => {
                    Some(String::from_utf8_lossy(&bytes).trim_end().to_owned())
                }
                _ => None,
            })
            .collect();

        assert_eq!(
            replies,
            vec![crate::fsm::handler::GREETING.to_owned(), "OK irc".to_owned()]
        );
    }
}
