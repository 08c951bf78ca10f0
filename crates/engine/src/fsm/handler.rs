//! Engine state machine: composes the server manager, rule chain,
//! plugin host, hooks and control peers, and dispatches events across
//! them.
use std::fmt;
use std::path::PathBuf;

use flume as chan;
use tracing::{debug, warn};

use tern_proto::Message;

use crate::common::time::{Clock, TickClock};
use crate::fsm::control::Peers;
use crate::fsm::event::Event;
use crate::fsm::hooks::{Hook, HookSet};
use crate::fsm::output::{self, Outbox, SetTimer as _};
use crate::fsm::plugins::{Action, Loader, MapKind, PluginHost, PluginId};
use crate::fsm::rules::{Rule, RuleAction, RuleChain};
use crate::fsm::servers::{ServerConfig, ServerManager};
use crate::net::{Disconnect, LocalTime, PeerId, ServerId};

/// Greeting sent to every accepted control peer. The leading word and
/// version shape are a stable part of the wire protocol.
pub const GREETING: &str = concat!("IRCCD ", env!("CARGO_PKG_VERSION"));

/// Why the engine closed a server transport.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// A configured deadline passed.
    Timeout(&'static str),
    /// Orderly QUIT.
    Quit,
    /// Operator asked for an immediate reconnection.
    Reconnect,
    /// Operator asked for the transport to go away.
    Command,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(what) => write!(f, "{} timed out", what),
            Self::Quit => write!(f, "quit"),
            Self::Reconnect => write!(f, "reconnecting"),
            Self::Command => write!(f, "received external command"),
        }
    }
}

/// A plugin named in the configuration file.
pub struct PluginSpec {
    pub id: PluginId,
    pub options: Vec<(String, String)>,
    pub templates: Vec<(String, String)>,
    pub paths: Vec<(String, String)>,
}

impl PluginSpec {
    pub fn new(id: impl Into<PluginId>) -> Self {
        Self {
            id: id.into(),
            options: Vec::new(),
            templates: Vec::new(),
            paths: Vec::new(),
        }
    }
}

/// Engine configuration, as handed over by the configuration layer.
#[derive(Default)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    pub rules: Vec<Rule>,
    pub hooks: Vec<Hook>,
    pub plugins: Vec<PluginSpec>,
    pub loaders: Vec<Box<dyn Loader>>,
    pub search_paths: Vec<PathBuf>,
}

/// A command or request sent to the engine from outside the loop.
pub enum Command {
    /// Add a server and start connecting it.
    Connect(Box<ServerConfig>),
    /// Disconnect and forget one server, or all of them.
    Disconnect(Option<ServerId>),
    /// Force a reconnection.
    Reconnect(Option<ServerId>),
    /// List server ids.
    GetServers(chan::Sender<Vec<ServerId>>),
    /// QUIT everywhere, in preparation for process exit.
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(config) => write!(f, "Connect({})", config.id),
            Self::Disconnect(id) => write!(f, "Disconnect({:?})", id),
            Self::Reconnect(id) => write!(f, "Reconnect({:?})", id),
            Self::GetServers(_) => write!(f, "GetServers"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The engine proper. Owns all top-level records; everything below
/// refers to servers and plugins by id only.
pub struct StateMachine<C> {
    pub(crate) servers: ServerManager<Outbox, C>,
    pub(crate) rules: RuleChain,
    pub(crate) plugins: PluginHost,
    pub(crate) hooks: HookSet,
    pub(crate) peers: Peers,
    pub(crate) outbox: Outbox,
    clock: C,
    actions: Vec<Action>,
    boot_servers: Vec<ServerConfig>,
    boot_plugins: Vec<PluginSpec>,
}

impl<C: Clock> Iterator for StateMachine<C> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

impl<C: TickClock> StateMachine<C> {
    pub fn new(config: Config, clock: C, rng: fastrand::Rng) -> Self {
        let outbox = Outbox::default();

        Self {
            servers: ServerManager::new(outbox.clone(), clock.clone(), rng),
            rules: RuleChain::new(config.rules),
            plugins: PluginHost::new(config.loaders, config.search_paths),
            hooks: HookSet::new(config.hooks),
            peers: Peers::default(),
            outbox,
            clock,
            actions: Vec::new(),
            boot_servers: config.servers,
            boot_plugins: config.plugins,
        }
    }

    /// Load configured plugins and start configured servers. Called
    /// once by the reactor before the first poll.
    pub fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);

        for spec in std::mem::take(&mut self.boot_plugins) {
            if let Err(err) = self.plugins.load(&spec.id, &mut self.actions) {
                warn!(target: "fsm", "{}: Not loaded: {}", spec.id, err);
                continue;
            }
            if let Ok(plugin) = self.plugins.get_mut(&spec.id) {
                for (key, value) in &spec.options {
                    plugin.set(MapKind::Options, key, value);
                }
                for (key, value) in &spec.templates {
                    plugin.set(MapKind::Templates, key, value);
                }
                for (key, value) in &spec.paths {
                    plugin.set(MapKind::Paths, key, value);
                }
            }
        }

        for config in std::mem::take(&mut self.boot_servers) {
            let id = config.id.clone();
            if let Err(err) = self.servers.add(config) {
                warn!(target: "fsm", "{}: Not started: {}", id, err);
            }
        }

        self.apply_actions();
        self.flush();
    }

    /// One parsed line arrived from a server.
    pub fn irc_message(&mut self, id: &ServerId, msg: Message) {
        let mut events = Vec::new();
        self.servers.message_received(id, msg, &mut events);

        for event in events {
            self.dispatch(event);
        }
        self.flush();
    }

    pub fn transport_attempted(&mut self, id: &ServerId) {
        self.servers.transport_attempted(id);
    }

    pub fn transport_connected(&mut self, id: &ServerId) {
        self.servers.transport_connected(id);
        self.flush();
    }

    pub fn transport_disconnected(&mut self, id: &ServerId, reason: Disconnect<DisconnectReason>) {
        let mut events = Vec::new();
        self.servers.transport_disconnected(id, reason, &mut events);

        for event in events {
            self.dispatch(event);
        }
        self.flush();
    }

    /// A control peer was accepted; greet it.
    pub fn peer_connected(&mut self, peer: PeerId) {
        self.peers.insert(peer);
        self.outbox.peer_line(peer, GREETING);
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        self.peers.remove(peer);
    }

    pub fn tick(&mut self, now: LocalTime) {
        self.clock.set(now);
    }

    /// A reactor timer fired: connection upkeep and plugin timers.
    pub fn timer_expired(&mut self) {
        self.servers.received_wake();

        let now = self.clock.local_time();
        self.plugins.fire_due_timers(now, &mut self.actions);

        self.apply_actions();
        self.flush();
    }

    /// An external command arrived through the client handle.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "fsm", "Received command: {:?}", cmd);

        match cmd {
            Command::Connect(config) => {
                let id = config.id.clone();
                if let Err(err) = self.servers.add(*config) {
                    warn!(target: "fsm", "{}: Not started: {}", id, err);
                }
            }
            Command::Disconnect(Some(id)) => self.remove_server(&id),
            Command::Disconnect(None) => {
                for id in self.server_ids() {
                    self.remove_server(&id);
                }
            }
            Command::Reconnect(Some(id)) => {
                self.servers.reconnect(&id).ok();
            }
            Command::Reconnect(None) => {
                for id in self.server_ids() {
                    self.servers.reconnect(&id).ok();
                }
            }
            Command::GetServers(reply) => {
                reply.send(self.server_ids()).ok();
            }
            Command::Shutdown => self.shutdown(),
        }
        self.flush();
    }

    /// QUIT on every server; transports close once the goodbyes are
    /// written.
    pub fn shutdown(&mut self) {
        for id in self.server_ids() {
            self.servers.quit(&id).ok();
        }
    }

    pub(crate) fn server_ids(&self) -> Vec<ServerId> {
        self.servers.ids().cloned().collect()
    }

    /// Disconnect a server and drop its record; watchers still see the
    /// disconnect.
    pub(crate) fn remove_server(&mut self, id: &ServerId) {
        if self.servers.remove(id).is_ok() {
            self.dispatch(Event::Disconnect { server: id.clone() });
        }
    }

    /// Route one event: observers first, then hooks, then plugins
    /// behind the rule chain.
    pub(crate) fn dispatch(&mut self, event: Event) {
        debug!(target: "fsm", "Dispatching {:?}", event);

        self.outbox.event(event.clone());

        // Watchers are never filtered by rules.
        let record = event.to_line();
        for peer in self.peers.watching() {
            self.outbox.peer_line(peer, &record);
        }

        self.hooks.dispatch(&event);

        // A message that addresses a plugin by command prefix turns
        // into a Command event for that plugin alone; everyone else
        // still sees the plain message.
        let command = self.synthesize_command(&event);

        for pid in self.plugins.ids().cloned().collect::<Vec<PluginId>>() {
            let deliver = match &command {
                Some((target, command)) if *target == pid => command,
                _ => &event,
            };

            let decision = self.rules.evaluate(
                deliver.server(),
                deliver.channel(),
                deliver.origin(),
                Some(pid.as_str()),
                deliver.kind().name(),
            );
            if decision == RuleAction::Accept {
                self.plugins.fire_event(&pid, deliver, &mut self.actions);
            }
        }

        self.apply_actions();
    }

    fn synthesize_command(&self, event: &Event) -> Option<(PluginId, Event)> {
        let Event::Message {
            server,
            origin,
            channel,
            message,
        } = event
        else {
            return None;
        };

        let prefix = self.servers.get(server).ok()?.config.prefix;
        let rest = message.strip_prefix(prefix)?;
        let (id, body) = match rest.split_once(char::is_whitespace) {
            Some((id, body)) => (id, body.trim_start()),
            None => (rest, ""),
        };

        if id.is_empty() || !self.plugins.contains(id) {
            return None;
        }

        Some((
            id.to_owned(),
            Event::Command {
                server: server.clone(),
                origin: origin.clone(),
                channel: channel.clone(),
                plugin: id.to_owned(),
                body: body.to_owned(),
            },
        ))
    }

    /// Load a plugin on behalf of the control surface.
    pub(crate) fn plugin_load(&mut self, id: &str) -> Result<(), crate::fsm::plugins::PluginError> {
        let result = self.plugins.load(id, &mut self.actions);
        self.apply_actions();
        result
    }

    pub(crate) fn plugin_unload(
        &mut self,
        id: &str,
    ) -> Result<(), crate::fsm::plugins::PluginError> {
        let result = self.plugins.unload(id, &mut self.actions);
        self.apply_actions();
        result
    }

    pub(crate) fn plugin_reload(
        &mut self,
        id: &str,
    ) -> Result<(), crate::fsm::plugins::PluginError> {
        let result = self.plugins.reload(id, &mut self.actions);
        self.apply_actions();
        result
    }

    /// Apply everything callbacks asked for, including whatever new
    /// requests those applications generate.
    fn apply_actions(&mut self) {
        let mut queue = std::mem::take(&mut self.actions);

        while !queue.is_empty() {
            for action in queue.drain(..) {
                self.apply(action);
            }
            queue = std::mem::take(&mut self.actions);
        }
    }

    fn apply(&mut self, action: Action) {
        let result = match action {
            Action::Message {
                server,
                target,
                text,
            } => self.servers.message(&server, &target, &text),
            Action::Notice {
                server,
                target,
                text,
            } => self.servers.notice(&server, &target, &text),
            Action::Me {
                server,
                target,
                text,
            } => self.servers.me(&server, &target, &text),
            Action::Join {
                server,
                channel,
                password,
            } => self.servers.join(&server, &channel, password.as_deref()),
            Action::Part {
                server,
                channel,
                reason,
            } => self.servers.part(&server, &channel, reason.as_deref()),
            Action::Kick {
                server,
                channel,
                target,
                reason,
            } => self
                .servers
                .kick(&server, &channel, &target, reason.as_deref()),
            Action::Mode {
                server,
                channel,
                mode,
                args,
            } => self.servers.mode(&server, &channel, &mode, args.as_deref()),
            Action::Topic {
                server,
                channel,
                topic,
            } => self.servers.topic(&server, &channel, &topic),
            Action::Invite {
                server,
                channel,
                target,
            } => self.servers.invite(&server, &channel, &target),
            Action::StartTimer {
                plugin,
                timer,
                kind,
                delay,
            } => {
                let now = self.clock.local_time();
                self.plugins.start_timer(&plugin, timer, kind, delay, now);
                self.outbox.set_timer(delay);
                Ok(())
            }
            Action::StopTimer { plugin, timer } => {
                self.plugins.stop_timer(&plugin, timer);
                Ok(())
            }
            Action::LoadPlugin(id) => {
                if let Err(err) = self.plugins.load(&id, &mut self.actions) {
                    warn!(target: "fsm", "{}: Not loaded: {}", id, err);
                }
                Ok(())
            }
            Action::UnloadPlugin(id) => {
                if let Err(err) = self.plugins.unload(&id, &mut self.actions) {
                    warn!(target: "fsm", "{}: Not unloaded: {}", id, err);
                }
                Ok(())
            }
            Action::ReloadPlugin(id) => {
                self.plugins.reload(&id, &mut self.actions).ok();
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!(target: "fsm", "Plugin request dropped: {}", err);
        }
    }

    /// Re-arm the wakeup for the earliest pending plugin timer.
    pub(crate) fn flush(&mut self) {
        let now = self.clock.local_time();
        if let Some(delay) = self.plugins.next_timer_due(now) {
            self.outbox.set_timer(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::common::time::RefClock;
    use crate::fsm::output::Io;
    use crate::fsm::plugins::{Context, Metadata, Plugin, PluginData};
    use crate::fsm::rules::Rule;

    /// Replies to every message with an `ECHO: ` prefix.
    #[derive(Default)]
    struct Echo {
        data: PluginData,
    }

    impl Plugin for Echo {
        fn metadata(&self) -> &Metadata {
            &self.data.metadata
        }
        fn get(&self, map: MapKind, key: &str) -> Option<String> {
            self.data.get(map, key)
        }
        fn set(&mut self, map: MapKind, key: &str, value: &str) {
            self.data.set(map, key, value);
        }
        fn keys(&self, map: MapKind) -> Vec<String> {
            self.data.keys(map)
        }

        fn on_event(&mut self, ctx: &mut Context<'_>, event: &Event) {
            if let Event::Message {
                server,
                channel,
                message,
                ..
            } = event
            {
                ctx.message(server, channel, &format!("ECHO: {}", message));
            }
        }
    }

    /// Records every delivered event.
    #[derive(Default)]
    struct Recorder {
        data: PluginData,
        seen: Arc<Mutex<Vec<Event>>>,
        unload_self: bool,
    }

    impl Plugin for Recorder {
        fn metadata(&self) -> &Metadata {
            &self.data.metadata
        }
        fn get(&self, map: MapKind, key: &str) -> Option<String> {
            self.data.get(map, key)
        }
        fn set(&mut self, map: MapKind, key: &str, value: &str) {
            self.data.set(map, key, value);
        }
        fn keys(&self, map: MapKind) -> Vec<String> {
            self.data.keys(map)
        }

        fn on_event(&mut self, ctx: &mut Context<'_>, event: &Event) {
            self.seen.lock().unwrap().push(event.clone());
            if self.unload_self && matches!(event, Event::Message { .. }) {
                let id = ctx.plugin().to_owned();
                ctx.unload_plugin(&id);
            }
        }
    }

    /// Sends ten messages back for every one received.
    #[derive(Default)]
    struct Flood {
        data: PluginData,
    }

    impl Plugin for Flood {
        fn metadata(&self) -> &Metadata {
            &self.data.metadata
        }
        fn get(&self, map: MapKind, key: &str) -> Option<String> {
            self.data.get(map, key)
        }
        fn set(&mut self, map: MapKind, key: &str, value: &str) {
            self.data.set(map, key, value);
        }
        fn keys(&self, map: MapKind) -> Vec<String> {
            self.data.keys(map)
        }

        fn on_event(&mut self, ctx: &mut Context<'_>, event: &Event) {
            if let Event::Message {
                server, channel, ..
            } = event
            {
                for i in 0..10 {
                    ctx.message(server, channel, &format!("flood {}", i));
                }
            }
        }
    }

    fn machine() -> (StateMachine<RefClock>, RefClock) {
        let clock = RefClock::from(LocalTime::from_secs(1_000));
        let machine = StateMachine::new(
            Config::default(),
            clock.clone(),
            fastrand::Rng::with_seed(7),
        );
        (machine, clock)
    }

    fn insert_plugin(machine: &mut StateMachine<RefClock>, id: &str, plugin: Box<dyn Plugin>) {
        let mut actions = Vec::new();
        machine.plugins.insert(id, plugin, &mut actions).unwrap();
        assert!(actions.is_empty());
    }

    /// Add a registered server with a generous rate limit.
    fn boot_server(machine: &mut StateMachine<RefClock>, clock: &RefClock, id: &str, rate: u32) {
        let mut config =
            crate::fsm::servers::ServerConfig::new(id, "irc.example.org", 6667, "bot", "bot", "b");
        config.rate_limit = rate;
        machine.servers.add(config).unwrap();
        machine.transport_connected(&id.to_owned());
        machine.irc_message(
            &id.to_owned(),
            Message::parse(":srv 001 bot :Welcome").unwrap(),
        );
        drain(machine);
        clock.set(clock.local_time() + crate::net::LocalDuration::from_secs(5));
    }

    fn drain(machine: &mut StateMachine<RefClock>) -> Vec<Io> {
        machine.by_ref().collect()
    }

    fn written(outputs: &[Io]) -> Vec<String> {
        outputs
            .iter()
            .filter_map(|io| match io {
                Io::Write(_, bytes) => {
                    Some(String::from_utf8_lossy(bytes).trim_end().to_owned())
                }
                _ => None,
            })
            .collect()
    }

    fn peer_lines(outputs: &[Io], peer: PeerId) -> Vec<String> {
        outputs
            .iter()
            .filter_map(|io| match io {
                Io::PeerWrite(p, bytes) if *p == peer => {
                    Some(String::from_utf8_lossy(bytes).trim_end().to_owned())
                }
                _ => None,
            })
            .collect()
    }

    fn feed(machine: &mut StateMachine<RefClock>, id: &str, line: &str) {
        machine.irc_message(&id.to_owned(), Message::parse(line).unwrap());
    }

    #[test]
    fn echo_plugin_happy_path() {
        let (mut machine, clock) = machine();
        insert_plugin(&mut machine, "echo", Box::<Echo>::default());
        boot_server(&mut machine, &clock, "irc", 10);

        machine.peer_connected(1);
        machine.control_line(1, "WATCH");
        drain(&mut machine);

        feed(&mut machine, "irc", ":alice!u@h PRIVMSG #room :hello");

        let outputs = drain(&mut machine);
        assert_eq!(written(&outputs), vec!["PRIVMSG #room :ECHO: hello"]);
        assert_eq!(
            peer_lines(&outputs, 1),
            vec!["message irc alice #room hello"]
        );
    }

    #[test]
    fn command_event_replaces_message_for_the_target() {
        let (mut machine, clock) = machine();
        let weather_seen = Arc::new(Mutex::new(Vec::new()));
        let other_seen = Arc::new(Mutex::new(Vec::new()));

        insert_plugin(
            &mut machine,
            "weather",
            Box::new(Recorder {
                seen: weather_seen.clone(),
                ..Recorder::default()
            }),
        );
        insert_plugin(
            &mut machine,
            "other",
            Box::new(Recorder {
                seen: other_seen.clone(),
                ..Recorder::default()
            }),
        );
        boot_server(&mut machine, &clock, "irc", 10);

        feed(&mut machine, "irc", ":bob!u@h PRIVMSG #room :!weather paris");

        let weather: Vec<Event> = weather_seen.lock().unwrap().clone();
        let weather_message_like: Vec<&Event> = weather
            .iter()
            .filter(|e| matches!(e, Event::Command { .. } | Event::Message { .. }))
            .collect();
        assert_eq!(
            weather_message_like,
            vec![&Event::Command {
                server: "irc".into(),
                origin: "bob".into(),
                channel: "#room".into(),
                plugin: "weather".into(),
                body: "paris".into(),
            }]
        );

        let other: Vec<Event> = other_seen.lock().unwrap().clone();
        assert!(other.iter().any(|e| matches!(e, Event::Message { .. })));
        assert!(!other.iter().any(|e| matches!(e, Event::Command { .. })));
    }

    #[test]
    fn drop_rule_suppresses_plugins_but_not_watchers() {
        let (mut machine, clock) = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));

        insert_plugin(
            &mut machine,
            "spy",
            Box::new(Recorder {
                seen: seen.clone(),
                ..Recorder::default()
            }),
        );
        machine
            .rules
            .add(Rule::new(crate::fsm::rules::RuleAction::Drop), None)
            .unwrap();
        boot_server(&mut machine, &clock, "irc", 10);

        machine.peer_connected(1);
        machine.control_line(1, "WATCH");
        drain(&mut machine);

        feed(&mut machine, "irc", ":alice!u@h PRIVMSG #room :psst");

        let outputs = drain(&mut machine);
        assert_eq!(peer_lines(&outputs, 1), vec!["message irc alice #room psst"]);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn self_unload_is_deferred_and_final() {
        let (mut machine, clock) = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));

        insert_plugin(
            &mut machine,
            "oneshot",
            Box::new(Recorder {
                seen: seen.clone(),
                unload_self: true,
                ..Recorder::default()
            }),
        );
        boot_server(&mut machine, &clock, "irc", 10);

        // The first event is delivered; the unload it requests lands
        // after the callback.
        feed(&mut machine, "irc", ":a!u@h PRIVMSG #room :one");
        assert!(!machine.plugins.contains("oneshot"));

        // In-flight or later events find no callback to run.
        feed(&mut machine, "irc", ":a!u@h PRIVMSG #room :two");

        let delivered: Vec<Event> = seen.lock().unwrap().clone();
        let messages: Vec<&Event> = delivered
            .iter()
            .filter(|e| matches!(e, Event::Message { .. }))
            .collect();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn plugin_flood_is_rate_limited() {
        let (mut machine, clock) = machine();
        insert_plugin(&mut machine, "flood", Box::<Flood>::default());
        boot_server(&mut machine, &clock, "irc", 2);

        feed(&mut machine, "irc", ":alice!u@h PRIVMSG #room :go");

        let first = written(&drain(&mut machine));
        assert_eq!(
            first,
            vec!["PRIVMSG #room :flood 0", "PRIVMSG #room :flood 1"]
        );

        // Next second releases the next two, strictly in order.
        clock.set(clock.local_time() + crate::net::LocalDuration::from_secs(1));
        machine.timer_expired();
        let second = written(&drain(&mut machine));
        assert_eq!(
            second,
            vec!["PRIVMSG #room :flood 2", "PRIVMSG #room :flood 3"]
        );
    }

    #[test]
    fn greeting_and_server_list() {
        let (mut machine, clock) = machine();
        boot_server(&mut machine, &clock, "irc", 10);
        boot_server(&mut machine, &clock, "freenode", 10);

        machine.peer_connected(3);
        let outputs = drain(&mut machine);
        assert_eq!(peer_lines(&outputs, 3), vec![GREETING]);

        machine.control_line(3, "SERVER-LIST");
        let outputs = drain(&mut machine);
        assert_eq!(peer_lines(&outputs, 3), vec!["OK irc freenode"]);
    }

    #[test]
    fn verbs_on_a_disconnected_server_fail_cleanly() {
        let (mut machine, clock) = machine();
        boot_server(&mut machine, &clock, "irc", 10);

        machine.peer_connected(3);
        drain(&mut machine);

        machine.control_line(3, "SERVER-DISCONNECT irc");
        let outputs = drain(&mut machine);
        assert_eq!(peer_lines(&outputs, 3), vec!["OK"]);
        // The goodbye and the teardown went to the transport.
        assert!(written(&outputs).iter().any(|l| l.starts_with("QUIT")));
        assert!(outputs.iter().any(|io| matches!(io, Io::Disconnect(..))));

        machine.control_line(3, "SERVER-MESSAGE irc #room hello there");
        let outputs = drain(&mut machine);
        assert_eq!(
            peer_lines(&outputs, 3),
            vec!["ERROR server irc not found"]
        );
        assert!(written(&outputs).is_empty());
    }

    #[test]
    fn unknown_verbs_and_blank_lines() {
        let (mut machine, _) = machine();

        machine.peer_connected(9);
        drain(&mut machine);

        machine.control_line(9, "FROBNICATE now");
        machine.control_line(9, "   ");

        let outputs = drain(&mut machine);
        assert_eq!(peer_lines(&outputs, 9), vec!["ERROR command not found"]);
    }

    #[test]
    fn rule_verbs_roundtrip() {
        let (mut machine, _) = machine();

        machine.peer_connected(4);
        drain(&mut machine);

        machine.control_line(4, "RULE-ADD drop c=#staff p=echo");
        machine.control_line(4, "RULE-ADD accept s=irc");
        machine.control_line(4, "RULE-MOVE 1 0");
        machine.control_line(4, "RULE-EDIT 1 a=accept c+#extra c-#staff");
        drain(&mut machine);

        machine.control_line(4, "RULE-LIST");
        let outputs = drain(&mut machine);
        assert_eq!(
            peer_lines(&outputs, 4),
            vec!["OK 2\naccept\nirc\n\n\n\n\naccept\n\n#extra\n\necho"]
        );

        machine.control_line(4, "RULE-REMOVE 7");
        let outputs = drain(&mut machine);
        assert_eq!(peer_lines(&outputs, 4), vec!["ERROR index out of range"]);
    }

    #[test]
    fn plugin_verbs_cover_maps_and_info() {
        let (mut machine, _) = machine();
        let mut echo = Echo::default();
        echo.data.metadata = Metadata {
            author: "jean".into(),
            license: "ISC".into(),
            summary: "echoes messages".into(),
            version: "1.0".into(),
        };
        insert_plugin(&mut machine, "echo", Box::new(echo));

        machine.peer_connected(5);
        drain(&mut machine);

        machine.control_line(5, "PLUGIN-CONFIG echo level loud");
        machine.control_line(5, "PLUGIN-CONFIG echo level");
        machine.control_line(5, "PLUGIN-CONFIG echo");
        machine.control_line(5, "PLUGIN-INFO echo");
        machine.control_line(5, "PLUGIN-CONFIG ghost");

        let outputs = drain(&mut machine);
        assert_eq!(
            peer_lines(&outputs, 5),
            vec![
                "OK",
                "OK 1\nloud",
                "OK 1\nlevel=loud",
                "OK echo\nechoes messages\n1.0\nISC\njean",
                "ERROR plugin ghost not found",
            ]
        );
    }
}
