//! Per-network connection lifecycle and channel tracking.
use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;
use tracing::{debug, info, warn};

use tern_proto::{ctcp, nick_of, numeric, Isupport, Message};

use crate::common::time::Clock;
use crate::fsm::event::{Event, Whois};
use crate::fsm::handler::DisconnectReason;
use crate::fsm::output::{Connect, Disconnect, SetTimer, Transmit};
use crate::fsm::queue::SendQueue;
use crate::net::{Disconnect as NetDisconnect, LocalDuration, LocalTime, ServerId};

/// Time to establish a transport and to complete registration.
pub const CONNECT_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Idle time after which we ping the server ourselves.
pub const KEEPALIVE_TIMEOUT: LocalDuration = LocalDuration::from_secs(300);
/// Time to wait for the reply to our keepalive ping.
pub const PONG_TIMEOUT: LocalDuration = LocalDuration::from_secs(60);
/// First reconnection delay; doubled on every consecutive failure.
pub const RECONNECT_BASE: LocalDuration = LocalDuration::from_secs(2);
/// Ceiling for the reconnection delay.
pub const RECONNECT_CAP: LocalDuration = LocalDuration::from_secs(30);
/// Outbound lines per second, unless configured otherwise.
pub const DEFAULT_RATE_LIMIT: u32 = 2;

/// An error acting on the server set.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServerError {
    #[error("server {0} not found")]
    NotFound(String),
    #[error("server {0} already exists")]
    Exists(String),
}

/// A channel to join once registered.
#[derive(Debug, Clone)]
pub struct AutoJoin {
    pub name: String,
    pub password: Option<String>,
}

/// Static description of one IRC network.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
    /// The transport is handed to us as a byte stream either way; the
    /// flag is carried for reporting and for the `+port` wire syntax.
    pub tls: bool,
    pub password: Option<String>,
    pub nickname: String,
    pub username: String,
    pub realname: String,
    /// Leading character that addresses plugins in channel messages.
    pub prefix: char,
    pub channels: Vec<AutoJoin>,
    /// CTCP keyword replies (keyword upper-cased).
    pub ctcp: HashMap<String, String>,
    pub auto_rejoin: bool,
    pub join_invite: bool,
    pub rate_limit: u32,
    pub reconnect_base: LocalDuration,
    pub reconnect_cap: LocalDuration,
    /// Give up after this many consecutive failures; `None` retries
    /// forever.
    pub reconnect_tries: Option<u32>,
    pub connect_timeout: LocalDuration,
    pub keepalive_timeout: LocalDuration,
    pub pong_timeout: LocalDuration,
}

impl ServerConfig {
    pub fn new(
        id: impl Into<ServerId>,
        host: impl Into<String>,
        port: u16,
        nickname: impl Into<String>,
        username: impl Into<String>,
        realname: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            tls: false,
            password: None,
            nickname: nickname.into(),
            username: username.into(),
            realname: realname.into(),
            prefix: '!',
            channels: Vec::new(),
            ctcp: HashMap::new(),
            auto_rejoin: false,
            join_invite: false,
            rate_limit: DEFAULT_RATE_LIMIT,
            reconnect_base: RECONNECT_BASE,
            reconnect_cap: RECONNECT_CAP,
            reconnect_tries: None,
            connect_timeout: CONNECT_TIMEOUT,
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            pong_timeout: PONG_TIMEOUT,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting { since: LocalTime },
    Identifying { since: LocalTime },
    Connected,
    Disconnecting,
    Reconnecting { retry_at: LocalTime },
}

/// A joined (or requested) channel.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    pub topic: Option<String>,
    /// Nickname to mode-mask, in PREFIX table bit order.
    pub users: BTreeMap<String, u32>,
    /// Whether the server acknowledged our JOIN.
    pub joined: bool,
    pub password: Option<String>,
}

/// Runtime state of one network connection.
#[derive(Debug)]
pub struct Server {
    pub config: ServerConfig,
    pub state: State,
    /// Current nickname; drifts on NICK and on 433 fallbacks.
    pub nickname: String,
    pub isupport: Isupport,
    pub channels: BTreeMap<String, Channel>,
    queue: SendQueue,
    names: HashMap<String, BTreeSet<String>>,
    whois: Option<Whois>,
    last_activity: LocalTime,
    ping_pending: Option<LocalTime>,
    retries: u32,
}

impl Server {
    fn new(config: ServerConfig, now: LocalTime) -> Self {
        Self {
            nickname: config.nickname.clone(),
            queue: SendQueue::new(config.rate_limit),
            state: State::Disconnected,
            isupport: Isupport::default(),
            channels: BTreeMap::new(),
            names: HashMap::new(),
            whois: None,
            last_activity: now,
            ping_pending: None,
            retries: 0,
            config,
        }
    }

    /// Whether an origin names ourselves, user/host part ignored.
    pub fn is_self(&self, origin: &str) -> bool {
        nick_of(origin).eq_ignore_ascii_case(&self.nickname)
    }

    /// Lines queued and not yet released by the rate limiter.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn reset_link_state(&mut self) {
        self.channels.clear();
        self.names.clear();
        self.whois = None;
        self.ping_pending = None;
        self.queue.clear();
        self.isupport = Isupport::default();
        self.nickname = self.config.nickname.clone();
    }
}

/// Owns every [`Server`] and drives their lifecycles against the
/// reactor through the outbox capabilities.
pub struct ServerManager<U, C> {
    order: Vec<ServerId>,
    servers: HashMap<ServerId, Server>,
    upstream: U,
    clock: C,
    rng: fastrand::Rng,
}

impl<U: Transmit + SetTimer + Connect + Disconnect, C: Clock> ServerManager<U, C> {
    pub fn new(upstream: U, clock: C, rng: fastrand::Rng) -> Self {
        Self {
            order: Vec::new(),
            servers: HashMap::new(),
            upstream,
            clock,
            rng,
        }
    }

    /// Register a server and start connecting it.
    pub fn add(&mut self, config: ServerConfig) -> Result<(), ServerError> {
        let id = config.id.clone();

        if self.servers.contains_key(&id) {
            return Err(ServerError::Exists(id));
        }

        let now = self.clock.local_time();
        self.order.push(id.clone());
        self.servers.insert(id.clone(), Server::new(config, now));
        self.start_connect(&id);

        Ok(())
    }

    /// Send QUIT, close the transport and drop the record entirely.
    pub fn remove(&mut self, id: &ServerId) -> Result<(), ServerError> {
        self.quit(id)?;
        self.order.retain(|known| known != id);
        self.servers.remove(id);

        Ok(())
    }

    /// Server ids, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &ServerId> {
        self.order.iter()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.servers.contains_key(id)
    }

    pub fn get(&self, id: &ServerId) -> Result<&Server, ServerError> {
        self.servers
            .get(id)
            .ok_or_else(|| ServerError::NotFound(id.clone()))
    }

    fn get_mut(&mut self, id: &ServerId) -> Result<&mut Server, ServerError> {
        self.servers
            .get_mut(id)
            .ok_or_else(|| ServerError::NotFound(id.clone()))
    }

    /// Graceful QUIT: flush whatever is queued, say goodbye, close.
    pub fn quit(&mut self, id: &ServerId) -> Result<(), ServerError> {
        let server = self
            .servers
            .get_mut(id)
            .ok_or_else(|| ServerError::NotFound(id.clone()))?;

        let live = !matches!(server.state, State::Disconnected | State::Reconnecting { .. });
        if live {
            for line in server.queue.drain_all() {
                self.upstream.transmit(id, &line);
            }
            self.upstream
                .transmit(id, &Message::new("QUIT", vec!["tern stopping".into()]).encode());
            server.state = State::Disconnecting;
            self.upstream.disconnect(id, DisconnectReason::Quit);
        } else {
            server.state = State::Disconnected;
        }

        Ok(())
    }

    /// Operator-requested reconnection; resets the retry counter.
    pub fn reconnect(&mut self, id: &ServerId) -> Result<(), ServerError> {
        let server = self.get_mut(id)?;
        server.retries = 0;
        let state = server.state;

        match state {
            State::Disconnected | State::Reconnecting { .. } => {
                server.reset_link_state();
                self.start_connect(id);
            }
            _ => {
                // The transport teardown comes back through
                // `transport_disconnected`, which reconnects at once
                // for this reason.
                self.upstream.disconnect(id, DisconnectReason::Reconnect);
            }
        }

        Ok(())
    }

    fn start_connect(&mut self, id: &ServerId) {
        let now = self.clock.local_time();
        let Ok(server) = self.get_mut(id) else { return };

        server.state = State::Connecting { since: now };
        let (host, port, timeout) = (
            server.config.host.clone(),
            server.config.port,
            server.config.connect_timeout,
        );

        self.upstream.connect(id, &host, port);
        self.upstream.set_timer(timeout);
    }

    /// The reactor began dialing.
    pub fn transport_attempted(&mut self, id: &ServerId) {
        debug_assert!(self
            .servers
            .get(id)
            .is_some_and(|s| matches!(s.state, State::Connecting { .. })));
    }

    /// The transport is up; identify ourselves.
    pub fn transport_connected(&mut self, id: &ServerId) {
        let now = self.clock.local_time();
        let Ok(server) = self.get_mut(id) else { return };

        info!(target: "fsm", "{}: Transport established, identifying as {}", id, server.config.nickname);

        server.state = State::Identifying { since: now };
        server.last_activity = now;

        if let Some(password) = server.config.password.clone() {
            server.queue.push(Message::new("PASS", vec![password]).encode());
        }
        let nickname = server.nickname.clone();
        let username = server.config.username.clone();
        let realname = server.config.realname.clone();
        server.queue.push(Message::new("NICK", vec![nickname]).encode());
        server.queue.push(
            Message::new("USER", vec![username, "0".into(), "*".into(), realname]).encode(),
        );

        self.drain_one(id);
    }

    /// The transport went away, for any reason.
    pub fn transport_disconnected(
        &mut self,
        id: &ServerId,
        reason: NetDisconnect<DisconnectReason>,
        events: &mut Vec<Event>,
    ) {
        let now = self.clock.local_time();
        let Ok(server) = self.get_mut(id) else {
            // Already removed by an operator command.
            return;
        };

        debug!(target: "fsm", "{}: Transport lost: {}", id, reason);

        let was_registered = matches!(server.state, State::Connected);
        let orderly = matches!(server.state, State::Disconnecting);
        server.reset_link_state();

        if was_registered || orderly {
            events.push(Event::Disconnect { server: id.clone() });
        }

        if orderly {
            server.state = State::Disconnected;
            return;
        }
        if matches!(reason, NetDisconnect::StateMachine(DisconnectReason::Reconnect)) {
            self.start_connect(id);
            return;
        }

        if let Some(max) = server.config.reconnect_tries {
            if server.retries >= max {
                warn!(target: "fsm", "{}: Giving up after {} attempts", id, server.retries);
                server.state = State::Disconnected;
                return;
            }
        }

        let delay = (server.config.reconnect_base * 2u64.saturating_pow(server.retries))
            .clamp(server.config.reconnect_base, server.config.reconnect_cap);
        server.retries += 1;
        server.state = State::Reconnecting {
            retry_at: now + delay,
        };

        debug!(target: "fsm", "{}: Retrying in {}", id, delay);
        self.upstream.set_timer(delay);
    }

    /// Handle one parsed inbound line.
    pub fn message_received(&mut self, id: &ServerId, msg: Message, events: &mut Vec<Event>) {
        let now = self.clock.local_time();
        let Ok(server) = self.get_mut(id) else {
            debug!(target: "fsm", "{}: Line from unknown server dropped", id);
            return;
        };

        server.last_activity = now;

        if let Some(numeric) = msg.numeric() {
            self.numeric_received(id, numeric, &msg, events);
            self.drain_one(id);
            return;
        }

        let origin = msg
            .prefix
            .as_ref()
            .map(|p| p.nick.clone())
            .unwrap_or_default();

        match msg.command.as_str() {
            "PING" => {
                let token = msg.param(0).to_owned();
                let Ok(server) = self.get_mut(id) else { return };
                server
                    .queue
                    .push_urgent(Message::new("PONG", vec![token]).encode());
            }
            "PONG" => {
                if let Ok(server) = self.get_mut(id) {
                    server.ping_pending = None;
                }
            }
            "PRIVMSG" => self.privmsg_received(id, &origin, &msg, events),
            "NOTICE" => {
                // The target parameter carries no information a plugin
                // wants; it is dropped.
                events.push(Event::Notice {
                    server: id.clone(),
                    origin,
                    message: msg.param(1).to_owned(),
                });
            }
            "JOIN" => {
                let channel = msg.param(0).to_owned();
                let Ok(server) = self.get_mut(id) else { return };

                if server.is_self(&origin) {
                    server.channels.entry(channel.clone()).or_default().joined = true;
                } else {
                    server
                        .channels
                        .entry(channel.clone())
                        .or_default()
                        .users
                        .insert(origin.clone(), 0);
                }
                events.push(Event::Join {
                    server: id.clone(),
                    origin,
                    channel,
                });
            }
            "PART" => {
                let channel = msg.param(0).to_owned();
                let reason = msg.param(1).to_owned();
                let Ok(server) = self.get_mut(id) else { return };

                if server.is_self(&origin) {
                    server.channels.remove(&channel);
                } else if let Some(chan) = server.channels.get_mut(&channel) {
                    chan.users.remove(&origin);
                }
                events.push(Event::Part {
                    server: id.clone(),
                    origin,
                    channel,
                    reason,
                });
            }
            "KICK" => self.kick_received(id, &origin, &msg, events),
            "QUIT" => {
                // Not surfaced as an event; membership upkeep only.
                let Ok(server) = self.get_mut(id) else { return };
                for chan in server.channels.values_mut() {
                    chan.users.remove(&origin);
                }
            }
            "NICK" => {
                let nickname = msg.param(0).to_owned();
                let Ok(server) = self.get_mut(id) else { return };

                if server.is_self(&origin) {
                    server.nickname = nickname.clone();
                }
                for chan in server.channels.values_mut() {
                    if let Some(mask) = chan.users.remove(&origin) {
                        chan.users.insert(nickname.clone(), mask);
                    }
                }
                events.push(Event::Nick {
                    server: id.clone(),
                    origin,
                    nickname,
                });
            }
            "MODE" => self.mode_received(id, &origin, &msg, events),
            "TOPIC" => {
                let channel = msg.param(0).to_owned();
                let topic = msg.param(1).to_owned();
                let Ok(server) = self.get_mut(id) else { return };

                if let Some(chan) = server.channels.get_mut(&channel) {
                    chan.topic = Some(topic.clone());
                }
                events.push(Event::Topic {
                    server: id.clone(),
                    origin,
                    channel,
                    topic,
                });
            }
            "INVITE" => {
                let target = msg.param(0).to_owned();
                let channel = msg.param(1).to_owned();
                let Ok(server) = self.get_mut(id) else { return };

                if server.config.join_invite && server.is_self(&target) {
                    info!(target: "fsm", "{}: Invited to {}, joining", id, channel);
                    self.join(id, &channel, None).ok();
                }
                events.push(Event::Invite {
                    server: id.clone(),
                    origin,
                    channel,
                    target,
                });
            }
            _ => {
                // Anything else is server noise we have no use for.
            }
        }

        self.drain_one(id);
    }

    fn numeric_received(
        &mut self,
        id: &ServerId,
        numeric: u16,
        msg: &Message,
        events: &mut Vec<Event>,
    ) {
        let Ok(server) = self.get_mut(id) else { return };

        match numeric {
            numeric::RPL_WELCOME => {
                info!(target: "fsm", "{}: Registered as {}", id, msg.param(0));

                server.state = State::Connected;
                server.retries = 0;
                if !msg.param(0).is_empty() {
                    server.nickname = msg.param(0).to_owned();
                }
                events.push(Event::Connect { server: id.clone() });

                for auto in server.config.channels.clone() {
                    info!(target: "fsm", "{}: Auto joining {}", id, auto.name);
                    self.join(id, &auto.name, auto.password.as_deref()).ok();
                }
            }
            numeric::RPL_ISUPPORT => {
                server.isupport.apply(&msg.params);
            }
            numeric::ERR_NICKNAMEINUSE => {
                if matches!(server.state, State::Identifying { .. }) {
                    server.nickname.push('_');
                    let nickname = server.nickname.clone();

                    warn!(target: "fsm", "{}: Nickname taken, trying {}", id, nickname);
                    server.queue.push(Message::new("NICK", vec![nickname]).encode());
                }
            }
            numeric::RPL_NAMREPLY => {
                // <client> <symbol> <channel> :<prefixed nicks>
                if msg.params.len() < 3 {
                    return;
                }
                let channel = msg.params[msg.params.len() - 2].clone();
                let listing = msg.params[msg.params.len() - 1].clone();

                for entry in listing.split_ascii_whitespace() {
                    let mask = server.isupport.prefix.mask_of_symbols(entry);
                    let nick = server.isupport.prefix.strip(entry).to_owned();

                    if let Some(chan) = server.channels.get_mut(&channel) {
                        chan.users.insert(nick.clone(), mask);
                    }
                    server.names.entry(channel.clone()).or_default().insert(nick);
                }
            }
            numeric::RPL_ENDOFNAMES => {
                let channel = msg.param(1).to_owned();
                if let Some(nicknames) = server.names.remove(&channel) {
                    events.push(Event::Names {
                        server: id.clone(),
                        channel,
                        nicknames: nicknames.into_iter().collect(),
                    });
                }
            }
            numeric::RPL_WHOISUSER => {
                server.whois = Some(Whois {
                    nick: msg.param(1).to_owned(),
                    user: msg.param(2).to_owned(),
                    host: msg.param(3).to_owned(),
                    realname: msg.param(5).to_owned(),
                    ..Whois::default()
                });
            }
            numeric::RPL_WHOISSERVER => {
                if let Some(whois) = &mut server.whois {
                    whois.server = msg.param(2).to_owned();
                }
            }
            numeric::RPL_WHOISIDLE => {
                if let Some(whois) = &mut server.whois {
                    whois.idle = msg.param(2).parse().unwrap_or(0);
                }
            }
            numeric::RPL_WHOISCHANNELS => {
                if let Some(whois) = &mut server.whois {
                    whois
                        .channels
                        .extend(msg.param(2).split_ascii_whitespace().map(str::to_owned));
                }
            }
            numeric::RPL_ENDOFWHOIS => {
                if let Some(whois) = server.whois.take() {
                    events.push(Event::Whois {
                        server: id.clone(),
                        whois,
                    });
                }
            }
            _ => {}
        }
    }

    fn privmsg_received(
        &mut self,
        id: &ServerId,
        origin: &str,
        msg: &Message,
        events: &mut Vec<Event>,
    ) {
        let channel = msg.param(0).to_owned();
        let text = msg.param(1);

        match ctcp::parse(text) {
            Some((keyword, args)) if keyword == ctcp::ACTION => {
                events.push(Event::Me {
                    server: id.clone(),
                    origin: origin.to_owned(),
                    channel,
                    message: args.to_owned(),
                });
            }
            Some((keyword, _)) => {
                // A CTCP request to us; answer from the configured
                // reply table, silently ignore the rest.
                let Ok(server) = self.get_mut(id) else { return };
                if let Some(reply) = server.config.ctcp.get(&keyword).cloned() {
                    debug!(target: "fsm", "{}: Replying to CTCP {} from {}", id, keyword, origin);
                    server.queue.push(
                        Message::new(
                            "NOTICE",
                            vec![origin.to_owned(), ctcp::quote(&keyword, &reply)],
                        )
                        .encode(),
                    );
                }
            }
            None => {
                events.push(Event::Message {
                    server: id.clone(),
                    origin: origin.to_owned(),
                    channel,
                    message: text.to_owned(),
                });
            }
        }
    }

    fn kick_received(
        &mut self,
        id: &ServerId,
        origin: &str,
        msg: &Message,
        events: &mut Vec<Event>,
    ) {
        let channel = msg.param(0).to_owned();
        let target = msg.param(1).to_owned();
        let reason = msg.param(2).to_owned();
        let Ok(server) = self.get_mut(id) else { return };

        if server.is_self(&target) {
            let password = server
                .channels
                .remove(&channel)
                .and_then(|chan| chan.password);

            if server.config.auto_rejoin {
                info!(target: "fsm", "{}: Kicked from {}, rejoining", id, channel);
                self.join(id, &channel, password.as_deref()).ok();
            }
        } else if let Some(chan) = server.channels.get_mut(&channel) {
            chan.users.remove(&target);
        }

        events.push(Event::Kick {
            server: id.clone(),
            origin: origin.to_owned(),
            channel,
            target,
            reason,
        });
    }

    fn mode_received(
        &mut self,
        id: &ServerId,
        origin: &str,
        msg: &Message,
        events: &mut Vec<Event>,
    ) {
        let target = msg.param(0).to_owned();
        let mode = msg.param(1).to_owned();
        let args: Vec<String> = msg.params.iter().skip(2).cloned().collect();
        let Ok(server) = self.get_mut(id) else { return };

        if server.isupport.is_channel(&target) {
            if let Some(chan) = server.channels.get_mut(&target) {
                let mut adding = true;
                let mut arg = args.iter();

                for c in mode.chars() {
                    match c {
                        '+' => adding = true,
                        '-' => adding = false,
                        c => {
                            // Only membership modes are tracked; they
                            // are exactly the ones taking a nick
                            // argument here.
                            if let Some(bit) = server.isupport.prefix.mask_of(c) {
                                if let Some(nick) = arg.next() {
                                    if let Some(mask) = chan.users.get_mut(nick) {
                                        if adding {
                                            *mask |= bit;
                                        } else {
                                            *mask &= !bit;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        events.push(Event::Mode {
            server: id.clone(),
            origin: origin.to_owned(),
            channel: target,
            mode,
            args,
        });
    }

    /// Periodic upkeep: reconnections, timeouts, keepalive, queues.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();
        let ids: Vec<ServerId> = self.order.clone();

        for id in &ids {
            let Some(server) = self.servers.get_mut(id) else {
                continue;
            };
            let state = server.state;

            match state {
                State::Reconnecting { retry_at } if now >= retry_at => {
                    self.start_connect(id);
                }
                State::Connecting { since } | State::Identifying { since } => {
                    if now - since >= server.config.connect_timeout {
                        self.upstream
                            .disconnect(id, DisconnectReason::Timeout("connect"));
                    }
                }
                State::Connected => {
                    let keepalive = server.config.keepalive_timeout;
                    let pong_wait = server.config.pong_timeout;

                    if let Some(sent_at) = server.ping_pending {
                        if now - sent_at >= pong_wait {
                            warn!(target: "fsm", "{}: No pong in {}, assuming dead", id, pong_wait);
                            self.upstream
                                .disconnect(id, DisconnectReason::Timeout("ping"));
                        }
                    } else if now - server.last_activity >= keepalive {
                        let token = format!("tern-{:08x}", self.rng.u32(..));

                        server.ping_pending = Some(now);
                        server.queue.push(Message::new("PING", vec![token]).encode());
                        self.upstream.set_timer(pong_wait);
                    }
                }
                _ => {}
            }
        }

        self.drain_queues();
    }

    /// Release whatever the rate limiter allows on every queue.
    pub fn drain_queues(&mut self) {
        let ids: Vec<ServerId> = self.order.clone();
        for id in &ids {
            self.drain_one(id);
        }
    }

    fn drain_one(&mut self, id: &ServerId) {
        let now = self.clock.local_time();
        let Some(server) = self.servers.get_mut(id) else {
            return;
        };

        if matches!(server.state, State::Disconnected | State::Reconnecting { .. }) {
            return;
        }

        for line in server.queue.drain(now) {
            self.upstream.transmit(id, &line);
        }
        if let Some(delay) = server.queue.next_ready(now) {
            self.upstream.set_timer(delay);
        }
    }

    /// Enqueue one raw command line on a server's queue.
    fn enqueue(&mut self, id: &ServerId, msg: Message) -> Result<(), ServerError> {
        self.get_mut(id)?.queue.push(msg.encode());
        self.drain_one(id);
        Ok(())
    }

    pub fn message(&mut self, id: &ServerId, target: &str, text: &str) -> Result<(), ServerError> {
        self.enqueue(id, Message::new("PRIVMSG", vec![target.into(), text.into()]))
    }

    pub fn notice(&mut self, id: &ServerId, target: &str, text: &str) -> Result<(), ServerError> {
        self.enqueue(id, Message::new("NOTICE", vec![target.into(), text.into()]))
    }

    /// CTCP ACTION.
    pub fn me(&mut self, id: &ServerId, target: &str, text: &str) -> Result<(), ServerError> {
        self.enqueue(
            id,
            Message::new("PRIVMSG", vec![target.into(), ctcp::quote(ctcp::ACTION, text)]),
        )
    }

    pub fn join(
        &mut self,
        id: &ServerId,
        channel: &str,
        password: Option<&str>,
    ) -> Result<(), ServerError> {
        let server = self.get_mut(id)?;
        let entry = server.channels.entry(channel.to_owned()).or_default();
        entry.password = password.map(str::to_owned);

        let mut params = vec![channel.to_owned()];
        params.extend(password.map(str::to_owned));
        self.enqueue(id, Message::new("JOIN", params))
    }

    pub fn part(
        &mut self,
        id: &ServerId,
        channel: &str,
        reason: Option<&str>,
    ) -> Result<(), ServerError> {
        let mut params = vec![channel.to_owned()];
        params.extend(reason.map(str::to_owned));
        self.enqueue(id, Message::new("PART", params))
    }

    pub fn kick(
        &mut self,
        id: &ServerId,
        channel: &str,
        target: &str,
        reason: Option<&str>,
    ) -> Result<(), ServerError> {
        let mut params = vec![channel.to_owned(), target.to_owned()];
        params.extend(reason.map(str::to_owned));
        self.enqueue(id, Message::new("KICK", params))
    }

    pub fn mode(
        &mut self,
        id: &ServerId,
        channel: &str,
        mode: &str,
        args: Option<&str>,
    ) -> Result<(), ServerError> {
        let mut params = vec![channel.to_owned(), mode.to_owned()];
        params.extend(args.map(str::to_owned));
        self.enqueue(id, Message::new("MODE", params))
    }

    pub fn topic(&mut self, id: &ServerId, channel: &str, topic: &str) -> Result<(), ServerError> {
        self.enqueue(id, Message::new("TOPIC", vec![channel.into(), topic.into()]))
    }

    pub fn invite(
        &mut self,
        id: &ServerId,
        channel: &str,
        target: &str,
    ) -> Result<(), ServerError> {
        // INVITE takes the nickname first on the wire.
        self.enqueue(id, Message::new("INVITE", vec![target.into(), channel.into()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::RefClock;
    use crate::fsm::output::{Io, Outbox};

    fn testee() -> (ServerManager<Outbox, RefClock>, Outbox, RefClock) {
        let outbox = Outbox::default();
        let clock = RefClock::from(LocalTime::from_secs(1_000));
        let rng = fastrand::Rng::with_seed(42);

        (
            ServerManager::new(outbox.clone(), clock.clone(), rng),
            outbox,
            clock,
        )
    }

    fn config(id: &str) -> ServerConfig {
        ServerConfig::new(id, "irc.example.org", 6667, "bot", "bot", "tern bot")
    }

    /// Written lines, in order; other outputs discarded.
    fn sent(outbox: &mut Outbox) -> Vec<String> {
        let mut lines = Vec::new();
        for io in outbox.by_ref() {
            if let Io::Write(_, bytes) = io {
                lines.push(String::from_utf8(bytes).unwrap().trim_end().to_owned());
            }
        }
        lines
    }

    fn feed(
        mgr: &mut ServerManager<Outbox, RefClock>,
        id: &str,
        line: &str,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        let msg = Message::parse(line).unwrap();
        mgr.message_received(&id.to_owned(), msg, &mut events);
        events
    }

    /// Bring a just-added server into the registered state, discarding
    /// the handshake output and letting the rate window clear.
    fn register(
        mgr: &mut ServerManager<Outbox, RefClock>,
        outbox: &mut Outbox,
        clock: &RefClock,
        id: &str,
    ) {
        mgr.transport_connected(&id.to_owned());
        feed(mgr, id, ":srv 001 bot :Welcome");
        sent(outbox);
        clock.set(clock.local_time() + LocalDuration::from_secs(5));
    }

    #[test]
    fn add_dials_and_identifies() {
        let (mut mgr, mut outbox, _) = testee();
        let mut cfg = config("irc");
        cfg.password = Some("hunter2".into());

        mgr.add(cfg).unwrap();

        let mut connects = 0;
        for io in outbox.by_ref() {
            if let Io::Connect(id, host, port) = io {
                assert_eq!((id.as_str(), host.as_str(), port), ("irc", "irc.example.org", 6667));
                connects += 1;
            }
        }
        assert_eq!(connects, 1);

        mgr.transport_connected(&"irc".to_owned());
        assert_eq!(
            sent(&mut outbox),
            vec!["PASS hunter2", "NICK bot"],
            "third line is rate limited into the next window",
        );
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let (mut mgr, _, _) = testee();

        mgr.add(config("irc")).unwrap();
        assert_eq!(
            mgr.add(config("irc")),
            Err(ServerError::Exists("irc".into()))
        );
    }

    #[test]
    fn welcome_emits_connect_and_auto_joins() {
        let (mut mgr, mut outbox, clock) = testee();
        let mut cfg = config("irc");
        cfg.rate_limit = 10;
        cfg.channels = vec![
            AutoJoin {
                name: "#room".into(),
                password: None,
            },
            AutoJoin {
                name: "#ops".into(),
                password: Some("sekrit".into()),
            },
        ];

        mgr.add(cfg).unwrap();
        mgr.transport_connected(&"irc".to_owned());
        sent(&mut outbox);
        clock.set(LocalTime::from_secs(1_002));

        let events = feed(&mut mgr, "irc", ":srv 001 bot :Welcome to IRC");

        assert_eq!(
            events,
            vec![Event::Connect {
                server: "irc".into()
            }]
        );
        assert_eq!(sent(&mut outbox), vec!["JOIN #room", "JOIN #ops sekrit"]);
    }

    #[test]
    fn one_event_per_line_and_none_for_internal_lines() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        assert_eq!(feed(&mut mgr, "irc", "PING :abc").len(), 0);
        assert_eq!(
            feed(&mut mgr, "irc", ":srv 353 bot = #room :alice bob").len(),
            0
        );
        assert_eq!(
            feed(&mut mgr, "irc", ":alice!u@h PRIVMSG #room :hi").len(),
            1
        );
    }

    #[test]
    fn ping_is_answered_ahead_of_the_queue() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        // Exhaust the window first.
        mgr.message(&"irc".to_owned(), "#room", "one").unwrap();
        mgr.message(&"irc".to_owned(), "#room", "two").unwrap();
        mgr.message(&"irc".to_owned(), "#room", "three").unwrap();
        assert_eq!(sent(&mut outbox).len(), 2);

        feed(&mut mgr, "irc", "PING :abc123");

        assert_eq!(sent(&mut outbox), vec!["PONG abc123"]);
    }

    #[test]
    fn names_pages_fold_into_one_event() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");
        feed(&mut mgr, "irc", ":bot!b@h JOIN #room");

        assert!(feed(&mut mgr, "irc", ":srv 353 bot = #room :@op alice").is_empty());
        assert!(feed(&mut mgr, "irc", ":srv 353 bot = #room :+bob alice").is_empty());

        let events = feed(&mut mgr, "irc", ":srv 366 bot #room :End of /NAMES list");

        assert_eq!(
            events,
            vec![Event::Names {
                server: "irc".into(),
                channel: "#room".into(),
                nicknames: vec!["alice".into(), "bob".into(), "op".into()],
            }]
        );

        // Modes learned from the prefixes stick to the membership map.
        let server = mgr.get(&"irc".to_owned()).unwrap();
        let room = &server.channels["#room"];
        assert_eq!(room.users["op"], 0b01);
        assert_eq!(room.users["bob"], 0b10);
    }

    #[test]
    fn whois_accumulates_until_terminator() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        assert!(feed(&mut mgr, "irc", ":srv 311 bot alice ident example.org * :Alice A.").is_empty());
        assert!(feed(&mut mgr, "irc", ":srv 312 bot alice irc.example.org :A server").is_empty());
        assert!(feed(&mut mgr, "irc", ":srv 319 bot alice :@#room +#other").is_empty());

        let events = feed(&mut mgr, "irc", ":srv 318 bot alice :End of /WHOIS list");

        assert_eq!(events.len(), 1);
        let Event::Whois { whois, .. } = &events[0] else {
            panic!("expected whois event");
        };
        assert_eq!(whois.nick, "alice");
        assert_eq!(whois.user, "ident");
        assert_eq!(whois.realname, "Alice A.");
        assert_eq!(whois.server, "irc.example.org");
        assert_eq!(whois.channels, vec!["@#room", "+#other"]);
    }

    #[test]
    fn auto_rejoin_after_kick() {
        let (mut mgr, mut outbox, clock) = testee();
        let mut cfg = config("irc");
        cfg.auto_rejoin = true;
        mgr.add(cfg).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");
        feed(&mut mgr, "irc", ":bot!b@h JOIN #room");
        sent(&mut outbox);

        let events = feed(&mut mgr, "irc", ":op!o@o KICK #room bot :bye");

        // Exactly one JOIN goes out, and the kick is still surfaced.
        assert_eq!(sent(&mut outbox), vec!["JOIN #room"]);
        assert_eq!(
            events,
            vec![Event::Kick {
                server: "irc".into(),
                origin: "op".into(),
                channel: "#room".into(),
                target: "bot".into(),
                reason: "bye".into(),
            }]
        );
    }

    #[test]
    fn kick_without_the_flag_does_not_rejoin() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");
        feed(&mut mgr, "irc", ":bot!b@h JOIN #room");
        sent(&mut outbox);

        feed(&mut mgr, "irc", ":op!o@o KICK #room bot :bye");

        assert!(sent(&mut outbox).is_empty());
        assert!(!mgr.get(&"irc".to_owned()).unwrap().channels.contains_key("#room"));
    }

    #[test]
    fn invite_joins_when_configured() {
        let (mut mgr, mut outbox, clock) = testee();
        let mut cfg = config("irc");
        cfg.join_invite = true;
        mgr.add(cfg).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        let events = feed(&mut mgr, "irc", ":alice!u@h INVITE bot :#hideout");

        assert_eq!(sent(&mut outbox), vec!["JOIN #hideout"]);
        assert_eq!(
            events,
            vec![Event::Invite {
                server: "irc".into(),
                origin: "alice".into(),
                channel: "#hideout".into(),
                target: "bot".into(),
            }]
        );
    }

    #[test]
    fn nick_drift_updates_self_identity() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        feed(&mut mgr, "irc", ":bot!b@h NICK :bot2");

        let server = mgr.get(&"irc".to_owned()).unwrap();
        assert!(server.is_self("bot2!b@h"));
        assert!(!server.is_self("bot"));
    }

    #[test]
    fn nickname_in_use_appends_underscore() {
        let (mut mgr, mut outbox, _) = testee();
        let mut cfg = config("irc");
        cfg.rate_limit = 10;
        mgr.add(cfg).unwrap();
        mgr.transport_connected(&"irc".to_owned());
        sent(&mut outbox);

        feed(&mut mgr, "irc", ":srv 433 * bot :Nickname is already in use");

        assert_eq!(sent(&mut outbox), vec!["NICK bot_"]);
    }

    #[test]
    fn ctcp_version_gets_the_configured_reply() {
        let (mut mgr, mut outbox, clock) = testee();
        let mut cfg = config("irc");
        cfg.ctcp.insert("VERSION".into(), "tern 0.2".into());
        mgr.add(cfg).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        let events = feed(&mut mgr, "irc", ":alice!u@h PRIVMSG bot :\u{1}VERSION\u{1}");

        assert!(events.is_empty());
        assert_eq!(
            sent(&mut outbox),
            vec!["NOTICE alice :\u{1}VERSION tern 0.2\u{1}"]
        );
    }

    #[test]
    fn ctcp_action_becomes_me_event() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        let events = feed(&mut mgr, "irc", ":alice!u@h PRIVMSG #room :\u{1}ACTION waves\u{1}");

        assert_eq!(
            events,
            vec![Event::Me {
                server: "irc".into(),
                origin: "alice".into(),
                channel: "#room".into(),
                message: "waves".into(),
            }]
        );
    }

    #[test]
    fn reconnect_backoff_doubles_and_resets() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        sent(&mut outbox);
        let id = "irc".to_owned();
        let mut events = Vec::new();

        let failure = || {
            NetDisconnect::<DisconnectReason>::ConnectionError(std::sync::Arc::new(
                std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            ))
        };

        for expected in [2u64, 4, 8] {
            let now = clock.local_time();
            mgr.transport_disconnected(&id, failure(), &mut events);

            let State::Reconnecting { retry_at } = mgr.get(&id).unwrap().state else {
                panic!("expected reconnecting state");
            };
            assert_eq!(retry_at - now, LocalDuration::from_secs(expected));

            // Fire the retry and pretend the dial failed again later.
            clock.set(retry_at);
            mgr.received_wake();
        }

        // A successful registration resets the counter.
        mgr.transport_connected(&id);
        feed(&mut mgr, "irc", ":srv 001 bot :Welcome");
        let now = clock.local_time();
        mgr.transport_disconnected(&id, failure(), &mut events);

        let State::Reconnecting { retry_at } = mgr.get(&id).unwrap().state else {
            panic!("expected reconnecting state");
        };
        assert_eq!(retry_at - now, LocalDuration::from_secs(2));
    }

    #[test]
    fn backoff_is_capped() {
        let (mut mgr, mut outbox, clock) = testee();
        let mut cfg = config("irc");
        cfg.reconnect_cap = LocalDuration::from_secs(30);
        mgr.add(cfg).unwrap();
        sent(&mut outbox);
        let id = "irc".to_owned();
        let mut events = Vec::new();

        for _ in 0..10 {
            mgr.transport_disconnected(
                &id,
                NetDisconnect::ConnectionError(std::sync::Arc::new(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                ))),
                &mut events,
            );
            let State::Reconnecting { retry_at } = mgr.get(&id).unwrap().state else {
                panic!("expected reconnecting state");
            };
            assert!(retry_at - clock.local_time() <= LocalDuration::from_secs(30));
            clock.set(retry_at);
            mgr.received_wake();
        }
    }

    #[test]
    fn retry_cap_leaves_server_disconnected() {
        let (mut mgr, mut outbox, clock) = testee();
        let mut cfg = config("irc");
        cfg.reconnect_tries = Some(1);
        mgr.add(cfg).unwrap();
        sent(&mut outbox);
        let id = "irc".to_owned();
        let mut events = Vec::new();
        let failure = || {
            NetDisconnect::<DisconnectReason>::ConnectionError(std::sync::Arc::new(
                std::io::Error::from(std::io::ErrorKind::ConnectionReset),
            ))
        };

        mgr.transport_disconnected(&id, failure(), &mut events);
        let State::Reconnecting { retry_at } = mgr.get(&id).unwrap().state else {
            panic!("expected reconnecting state");
        };
        clock.set(retry_at);
        mgr.received_wake();
        mgr.transport_disconnected(&id, failure(), &mut events);

        assert_eq!(mgr.get(&id).unwrap().state, State::Disconnected);

        // The operator can still bring it back.
        mgr.reconnect(&id).unwrap();
        assert!(matches!(
            mgr.get(&id).unwrap().state,
            State::Connecting { .. }
        ));
    }

    #[test]
    fn keepalive_pings_then_gives_up() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        clock.set(LocalTime::from_secs(1_000) + KEEPALIVE_TIMEOUT);
        mgr.received_wake();

        let pings = sent(&mut outbox);
        assert_eq!(pings.len(), 1);
        assert!(pings[0].starts_with("PING "));

        // No pong: the link is declared dead after the pong window.
        clock.set(LocalTime::from_secs(1_000) + KEEPALIVE_TIMEOUT + PONG_TIMEOUT);
        mgr.received_wake();

        let disconnected = outbox.by_ref().any(|io| matches!(io, Io::Disconnect(..)));
        assert!(disconnected);
    }

    #[test]
    fn pong_clears_the_keepalive() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        clock.set(LocalTime::from_secs(1_000) + KEEPALIVE_TIMEOUT);
        mgr.received_wake();
        sent(&mut outbox);

        feed(&mut mgr, "irc", ":srv PONG srv :tern-12345678");

        clock.set(LocalTime::from_secs(1_000) + KEEPALIVE_TIMEOUT + PONG_TIMEOUT);
        mgr.received_wake();

        let disconnected = outbox.by_ref().any(|io| matches!(io, Io::Disconnect(..)));
        assert!(!disconnected);
    }

    #[test]
    fn removal_forgets_the_server() {
        let (mut mgr, mut outbox, clock) = testee();
        mgr.add(config("irc")).unwrap();
        register(&mut mgr, &mut outbox, &clock, "irc");

        mgr.remove(&"irc".to_owned()).unwrap();

        assert!(!mgr.contains(&"irc".to_owned()));
        assert_eq!(
            mgr.message(&"irc".to_owned(), "#room", "hi"),
            Err(ServerError::NotFound("irc".into()))
        );

        // The goodbye went out before the transport was closed.
        let lines = sent(&mut outbox);
        assert!(lines.iter().any(|l| l.starts_with("QUIT")));
    }

    #[test]
    fn insertion_order_is_stable() {
        let (mut mgr, _, _) = testee();
        mgr.add(config("irc")).unwrap();
        mgr.add(config("freenode")).unwrap();

        let ids: Vec<&str> = mgr.ids().map(String::as_str).collect();
        assert_eq!(ids, vec!["irc", "freenode"]);
    }
}
