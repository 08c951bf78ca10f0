//! Plugin host: registration, dispatch, timers.
//!
//! The engine accepts any [`Plugin`] implementation through a list of
//! [`Loader`] capabilities tried in order. Callbacks run synchronously
//! on the loop thread and must not block; anything a callback wants
//! changed in the engine is recorded as an [`Action`] and applied once
//! the callback has returned, resolved by id so that a plugin may
//! unload itself (or anything else) safely mid-dispatch.
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::fsm::event::Event;
use crate::net::{LocalDuration, LocalTime, ServerId};

pub type PluginId = String;
pub type TimerId = u64;

/// An error in the plugin host.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("plugin {0} not found")]
    NotFound(String),
    #[error("plugin {0} already loaded")]
    Exists(String),
    #[error("could not load plugin: {0}")]
    Load(String),
    #[error("plugin callback failed: {0}")]
    Callback(String),
}

/// Read-only plugin description, populated at load time.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub author: String,
    pub license: String,
    pub summary: String,
    pub version: String,
}

/// The three string maps every plugin carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Options,
    Templates,
    Paths,
}

/// Timer flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then cancels itself.
    Single,
    /// Fires until stopped or its plugin is unloaded.
    Repeat,
}

/// What a callback asked the engine to do.
#[derive(Debug, Clone)]
pub enum Action {
    Message {
        server: ServerId,
        target: String,
        text: String,
    },
    Notice {
        server: ServerId,
        target: String,
        text: String,
    },
    Me {
        server: ServerId,
        target: String,
        text: String,
    },
    Join {
        server: ServerId,
        channel: String,
        password: Option<String>,
    },
    Part {
        server: ServerId,
        channel: String,
        reason: Option<String>,
    },
    Kick {
        server: ServerId,
        channel: String,
        target: String,
        reason: Option<String>,
    },
    Mode {
        server: ServerId,
        channel: String,
        mode: String,
        args: Option<String>,
    },
    Topic {
        server: ServerId,
        channel: String,
        topic: String,
    },
    Invite {
        server: ServerId,
        channel: String,
        target: String,
    },
    StartTimer {
        plugin: PluginId,
        timer: TimerId,
        kind: TimerKind,
        delay: LocalDuration,
    },
    StopTimer {
        plugin: PluginId,
        timer: TimerId,
    },
    LoadPlugin(PluginId),
    UnloadPlugin(PluginId),
    ReloadPlugin(PluginId),
}

/// Engine API handed to a callback.
///
/// Everything is deferred: the context only records intentions, the
/// dispatcher applies them after the callback returns.
pub struct Context<'a> {
    plugin: PluginId,
    actions: &'a mut Vec<Action>,
    next_timer: &'a mut TimerId,
}

impl Context<'_> {
    /// The id of the plugin being called.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn message(&mut self, server: &ServerId, target: &str, text: &str) {
        self.actions.push(Action::Message {
            server: server.clone(),
            target: target.to_owned(),
            text: text.to_owned(),
        });
    }

    pub fn notice(&mut self, server: &ServerId, target: &str, text: &str) {
        self.actions.push(Action::Notice {
            server: server.clone(),
            target: target.to_owned(),
            text: text.to_owned(),
        });
    }

    pub fn me(&mut self, server: &ServerId, target: &str, text: &str) {
        self.actions.push(Action::Me {
            server: server.clone(),
            target: target.to_owned(),
            text: text.to_owned(),
        });
    }

    pub fn join(&mut self, server: &ServerId, channel: &str, password: Option<&str>) {
        self.actions.push(Action::Join {
            server: server.clone(),
            channel: channel.to_owned(),
            password: password.map(str::to_owned),
        });
    }

    pub fn part(&mut self, server: &ServerId, channel: &str, reason: Option<&str>) {
        self.actions.push(Action::Part {
            server: server.clone(),
            channel: channel.to_owned(),
            reason: reason.map(str::to_owned),
        });
    }

    pub fn kick(&mut self, server: &ServerId, channel: &str, target: &str, reason: Option<&str>) {
        self.actions.push(Action::Kick {
            server: server.clone(),
            channel: channel.to_owned(),
            target: target.to_owned(),
            reason: reason.map(str::to_owned),
        });
    }

    pub fn topic(&mut self, server: &ServerId, channel: &str, topic: &str) {
        self.actions.push(Action::Topic {
            server: server.clone(),
            channel: channel.to_owned(),
            topic: topic.to_owned(),
        });
    }

    pub fn invite(&mut self, server: &ServerId, channel: &str, target: &str) {
        self.actions.push(Action::Invite {
            server: server.clone(),
            channel: channel.to_owned(),
            target: target.to_owned(),
        });
    }

    /// Arm a timer owned by the calling plugin. The handle is valid
    /// immediately.
    pub fn start_timer(&mut self, kind: TimerKind, delay_ms: u64) -> TimerId {
        let timer = *self.next_timer;
        *self.next_timer += 1;

        self.actions.push(Action::StartTimer {
            plugin: self.plugin.clone(),
            timer,
            kind,
            delay: LocalDuration::from_millis(delay_ms as u128),
        });
        timer
    }

    pub fn stop_timer(&mut self, timer: TimerId) {
        self.actions.push(Action::StopTimer {
            plugin: self.plugin.clone(),
            timer,
        });
    }

    pub fn load_plugin(&mut self, id: &str) {
        self.actions.push(Action::LoadPlugin(id.to_owned()));
    }

    pub fn unload_plugin(&mut self, id: &str) {
        self.actions.push(Action::UnloadPlugin(id.to_owned()));
    }

    pub fn reload_plugin(&mut self, id: &str) {
        self.actions.push(Action::ReloadPlugin(id.to_owned()));
    }
}

/// A loaded plugin, as the engine sees it.
pub trait Plugin: Send {
    fn metadata(&self) -> &Metadata;

    /// Read one entry of the given map.
    fn get(&self, map: MapKind, key: &str) -> Option<String>;
    /// Write one entry of the given map.
    fn set(&mut self, map: MapKind, key: &str, value: &str);
    /// All keys of the given map.
    fn keys(&self, map: MapKind) -> Vec<String>;

    fn on_load(&mut self, _ctx: &mut Context<'_>) -> Result<(), PluginError> {
        Ok(())
    }
    fn on_unload(&mut self, _ctx: &mut Context<'_>) {}
    fn on_reload(&mut self, _ctx: &mut Context<'_>) -> Result<(), PluginError> {
        Ok(())
    }
    fn on_event(&mut self, _ctx: &mut Context<'_>, _event: &Event) {}
    fn on_timer(&mut self, _ctx: &mut Context<'_>, _timer: TimerId) {}
}

/// Embeddable storage for the trait's metadata and maps, so concrete
/// plugins only implement behavior.
#[derive(Debug, Clone, Default)]
pub struct PluginData {
    pub metadata: Metadata,
    options: BTreeMap<String, String>,
    templates: BTreeMap<String, String>,
    paths: BTreeMap<String, String>,
}

impl PluginData {
    fn map(&self, map: MapKind) -> &BTreeMap<String, String> {
        match map {
            MapKind::Options => &self.options,
            MapKind::Templates => &self.templates,
            MapKind::Paths => &self.paths,
        }
    }

    fn map_mut(&mut self, map: MapKind) -> &mut BTreeMap<String, String> {
        match map {
            MapKind::Options => &mut self.options,
            MapKind::Templates => &mut self.templates,
            MapKind::Paths => &mut self.paths,
        }
    }

    pub fn get(&self, map: MapKind, key: &str) -> Option<String> {
        self.map(map).get(key).cloned()
    }

    pub fn set(&mut self, map: MapKind, key: &str, value: &str) {
        self.map_mut(map).insert(key.to_owned(), value.to_owned());
    }

    pub fn keys(&self, map: MapKind) -> Vec<String> {
        self.map(map).keys().cloned().collect()
    }
}

/// A way of turning an id and a path into a live plugin.
///
/// The engine tries each loader in order; scripting hosts plug in
/// here without the engine knowing anything about them.
pub trait Loader: Send {
    /// Loader name for diagnostics.
    fn kind(&self) -> &'static str;

    /// Try to open the plugin `id` at `path`.
    fn open(&self, id: &str, path: &Path) -> Result<Box<dyn Plugin>, PluginError>;
}

/// Loader over constructors registered at startup. Paths are ignored;
/// the id is the registry key.
#[derive(Default)]
pub struct StaticLoader {
    constructors: HashMap<String, fn() -> Box<dyn Plugin>>,
}

impl StaticLoader {
    pub fn register(&mut self, id: &str, constructor: fn() -> Box<dyn Plugin>) {
        self.constructors.insert(id.to_owned(), constructor);
    }
}

impl Loader for StaticLoader {
    fn kind(&self) -> &'static str {
        "static"
    }

    fn open(&self, id: &str, _path: &Path) -> Result<Box<dyn Plugin>, PluginError> {
        self.constructors
            .get(id)
            .map(|constructor| constructor())
            .ok_or_else(|| PluginError::Load(format!("{} is not a known plugin", id)))
    }
}

#[derive(Debug)]
struct Timer {
    plugin: PluginId,
    id: TimerId,
    kind: TimerKind,
    delay: LocalDuration,
    due: LocalTime,
}

/// Owns every plugin and their timers; fan-out order is load order.
pub struct PluginHost {
    plugins: Vec<(PluginId, Box<dyn Plugin>)>,
    loaders: Vec<Box<dyn Loader>>,
    search_paths: Vec<PathBuf>,
    timers: Vec<Timer>,
    next_timer: TimerId,
}

impl PluginHost {
    pub fn new(loaders: Vec<Box<dyn Loader>>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            plugins: Vec::new(),
            loaders,
            search_paths,
            timers: Vec::new(),
            next_timer: 0,
        }
    }

    /// Loaded plugin ids, in load order.
    pub fn ids(&self) -> impl Iterator<Item = &PluginId> {
        self.plugins.iter().map(|(id, _)| id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.iter().any(|(known, _)| known == id)
    }

    pub fn get(&self, id: &str) -> Result<&dyn Plugin, PluginError> {
        self.plugins
            .iter()
            .find(|(known, _)| known == id)
            .map(|(_, plugin)| plugin.as_ref())
            .ok_or_else(|| PluginError::NotFound(id.to_owned()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Box<dyn Plugin>, PluginError> {
        self.plugins
            .iter_mut()
            .find(|(known, _)| known == id)
            .map(|(_, plugin)| plugin)
            .ok_or_else(|| PluginError::NotFound(id.to_owned()))
    }

    /// Register an already-open plugin and run its load callback. The
    /// registration is rolled back if the callback fails.
    pub fn insert(
        &mut self,
        id: &str,
        plugin: Box<dyn Plugin>,
        actions: &mut Vec<Action>,
    ) -> Result<(), PluginError> {
        if self.contains(id) {
            return Err(PluginError::Exists(id.to_owned()));
        }

        self.plugins.push((id.to_owned(), plugin));

        let result = self.guarded(id, actions, |plugin, ctx| plugin.on_load(ctx));
        match result {
            Ok(()) => {
                info!(target: "plugins", "Loaded {}", id);
                Ok(())
            }
            Err(err) => {
                self.plugins.retain(|(known, _)| known != id);
                Err(err)
            }
        }
    }

    /// Search the loaders and paths for `id`, open it and register it.
    pub fn load(&mut self, id: &str, actions: &mut Vec<Action>) -> Result<(), PluginError> {
        if self.contains(id) {
            return Err(PluginError::Exists(id.to_owned()));
        }

        let mut candidates: Vec<PathBuf> = self
            .search_paths
            .iter()
            .map(|dir| dir.join(id))
            .collect();
        if candidates.is_empty() {
            candidates.push(PathBuf::from(id));
        }

        let mut opened = None;
        let mut last_error = PluginError::Load(format!("no loader accepted {}", id));

        'search: for loader in &self.loaders {
            for path in &candidates {
                match loader.open(id, path) {
                    Ok(plugin) => {
                        debug!(target: "plugins", "{}: Opened by {} loader", id, loader.kind());
                        opened = Some(plugin);
                        break 'search;
                    }
                    Err(err) => last_error = err,
                }
            }
        }

        match opened {
            Some(plugin) => self.insert(id, plugin, actions),
            None => Err(last_error),
        }
    }

    /// Drop a plugin: timers first, then the unload callback, then the
    /// record itself.
    pub fn unload(&mut self, id: &str, actions: &mut Vec<Action>) -> Result<(), PluginError> {
        if !self.contains(id) {
            return Err(PluginError::NotFound(id.to_owned()));
        }

        self.timers.retain(|timer| timer.plugin != id);
        self.guarded(id, actions, |plugin, ctx| {
            plugin.on_unload(ctx);
            Ok(())
        })
        .ok();
        self.plugins.retain(|(known, _)| known != id);

        info!(target: "plugins", "Unloaded {}", id);
        Ok(())
    }

    /// Run the reload callback; a failing reload unloads the plugin.
    pub fn reload(&mut self, id: &str, actions: &mut Vec<Action>) -> Result<(), PluginError> {
        if !self.contains(id) {
            return Err(PluginError::NotFound(id.to_owned()));
        }

        match self.guarded(id, actions, |plugin, ctx| plugin.on_reload(ctx)) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(target: "plugins", "{}: Reload failed, unloading: {}", id, err);
                self.unload(id, actions).ok();
                Err(err)
            }
        }
    }

    /// Deliver one event to one plugin, if it is still loaded.
    pub fn fire_event(&mut self, id: &str, event: &Event, actions: &mut Vec<Action>) {
        self.guarded(id, actions, |plugin, ctx| {
            plugin.on_event(ctx, event);
            Ok(())
        })
        .ok();
    }

    /// Arm a timer. The plugin must still exist.
    pub fn start_timer(
        &mut self,
        plugin: &str,
        timer: TimerId,
        kind: TimerKind,
        delay: LocalDuration,
        now: LocalTime,
    ) {
        if !self.contains(plugin) {
            return;
        }
        self.timers.push(Timer {
            plugin: plugin.to_owned(),
            id: timer,
            kind,
            delay,
            due: now + delay,
        });
    }

    pub fn stop_timer(&mut self, plugin: &str, timer: TimerId) {
        self.timers
            .retain(|t| !(t.plugin == plugin && t.id == timer));
    }

    /// Fire every due timer. Repeat timers are re-armed from `now`, so
    /// there are no catch-up bursts after a stall.
    pub fn fire_due_timers(&mut self, now: LocalTime, actions: &mut Vec<Action>) {
        let mut due = Vec::new();

        self.timers.retain_mut(|timer| {
            if timer.due > now {
                return true;
            }
            due.push((timer.plugin.clone(), timer.id));
            match timer.kind {
                TimerKind::Single => false,
                TimerKind::Repeat => {
                    timer.due = now + timer.delay;
                    true
                }
            }
        });

        for (plugin, timer) in due {
            self.guarded(&plugin, actions, |plugin, ctx| {
                plugin.on_timer(ctx, timer);
                Ok(())
            })
            .ok();
        }
    }

    /// Delay until the earliest armed timer, if any.
    pub fn next_timer_due(&self, now: LocalTime) -> Option<LocalDuration> {
        self.timers
            .iter()
            .map(|timer| {
                if timer.due >= now {
                    timer.due - now
                } else {
                    LocalDuration::from_secs(0)
                }
            })
            .min()
    }

    /// Run one callback with panic isolation. A missing plugin is a
    /// silent no-op: in-flight work may legitimately outlive an unload.
    fn guarded<F>(
        &mut self,
        id: &str,
        actions: &mut Vec<Action>,
        callback: F,
    ) -> Result<(), PluginError>
    where
        F: FnOnce(&mut Box<dyn Plugin>, &mut Context<'_>) -> Result<(), PluginError>,
    {
        let next_timer = &mut self.next_timer;
        let Some((_, plugin)) = self.plugins.iter_mut().find(|(known, _)| known == id) else {
            return Ok(());
        };

        let mut ctx = Context {
            plugin: id.to_owned(),
            actions,
            next_timer,
        };

        match catch_unwind(AssertUnwindSafe(|| callback(plugin, &mut ctx))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());

                error!(target: "plugins", "{}: Callback panicked: {}", id, message);
                Err(PluginError::Callback(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recording {
        data: PluginData,
        seen: Arc<Mutex<Vec<String>>>,
        panic_on_event: bool,
    }

    impl Plugin for Recording {
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

        fn on_event(&mut self, _ctx: &mut Context<'_>, event: &Event) {
            if self.panic_on_event {
                panic!("boom");
            }
            self.seen.lock().unwrap().push(event.kind().name().to_owned());
        }

        fn on_timer(&mut self, _ctx: &mut Context<'_>, timer: TimerId) {
            self.seen.lock().unwrap().push(format!("timer {}", timer));
        }

        fn on_unload(&mut self, _ctx: &mut Context<'_>) {
            self.seen.lock().unwrap().push("unload".to_owned());
        }
    }

    fn host() -> PluginHost {
        PluginHost::new(Vec::new(), Vec::new())
    }

    fn connect_event() -> Event {
        Event::Connect {
            server: "irc".into(),
        }
    }

    #[test]
    fn insert_dispatch_unload() {
        let mut host = host();
        let mut actions = Vec::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        host.insert(
            "echo",
            Box::new(Recording {
                seen: seen.clone(),
                ..Recording::default()
            }),
            &mut actions,
        )
        .unwrap();

        host.fire_event("echo", &connect_event(), &mut actions);
        host.unload("echo", &mut actions).unwrap();
        host.fire_event("echo", &connect_event(), &mut actions);

        assert_eq!(*seen.lock().unwrap(), vec!["connect", "unload"]);
        assert!(!host.contains("echo"));
    }

    #[test]
    fn duplicate_load_is_refused() {
        let mut host = host();
        let mut actions = Vec::new();

        host.insert("echo", Box::<Recording>::default(), &mut actions)
            .unwrap();

        assert!(matches!(
            host.insert("echo", Box::<Recording>::default(), &mut actions),
            Err(PluginError::Exists(_))
        ));
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let mut host = host();
        let mut actions = Vec::new();

        host.insert(
            "bad",
            Box::new(Recording {
                panic_on_event: true,
                ..Recording::default()
            }),
            &mut actions,
        )
        .unwrap();

        host.fire_event("bad", &connect_event(), &mut actions);

        // Still loaded; a bad event handler is not a load failure.
        assert!(host.contains("bad"));
    }

    #[test]
    fn static_loader_resolves_by_id() {
        let mut loader = StaticLoader::default();
        loader.register("echo", || Box::<Recording>::default());

        let mut host = PluginHost::new(vec![Box::new(loader)], Vec::new());
        let mut actions = Vec::new();

        host.load("echo", &mut actions).unwrap();
        assert!(host.contains("echo"));
        assert!(matches!(
            host.load("missing", &mut actions),
            Err(PluginError::Load(_))
        ));
    }

    #[test]
    fn single_timer_fires_once() {
        let mut host = host();
        let mut actions = Vec::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        host.insert(
            "clocky",
            Box::new(Recording {
                seen: seen.clone(),
                ..Recording::default()
            }),
            &mut actions,
        )
        .unwrap();

        let t0 = LocalTime::from_secs(100);
        host.start_timer("clocky", 7, TimerKind::Single, LocalDuration::from_millis(250), t0);

        host.fire_due_timers(t0 + LocalDuration::from_millis(100), &mut actions);
        assert!(seen.lock().unwrap().is_empty());

        host.fire_due_timers(t0 + LocalDuration::from_millis(300), &mut actions);
        host.fire_due_timers(t0 + LocalDuration::from_millis(600), &mut actions);

        assert_eq!(*seen.lock().unwrap(), vec!["timer 7"]);
        assert_eq!(host.next_timer_due(t0), None);
    }

    #[test]
    fn repeat_timer_rearms_without_catchup() {
        let mut host = host();
        let mut actions = Vec::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        host.insert(
            "clocky",
            Box::new(Recording {
                seen: seen.clone(),
                ..Recording::default()
            }),
            &mut actions,
        )
        .unwrap();

        let t0 = LocalTime::from_secs(100);
        host.start_timer("clocky", 1, TimerKind::Repeat, LocalDuration::from_secs(1), t0);

        // A long stall spanning three periods yields a single firing.
        host.fire_due_timers(t0 + LocalDuration::from_secs(3), &mut actions);
        assert_eq!(seen.lock().unwrap().len(), 1);

        // And the next deadline counts from the stalled firing.
        assert_eq!(
            host.next_timer_due(t0 + LocalDuration::from_secs(3)),
            Some(LocalDuration::from_secs(1))
        );
    }

    #[test]
    fn unload_cancels_timers() {
        let mut host = host();
        let mut actions = Vec::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        host.insert(
            "clocky",
            Box::new(Recording {
                seen: seen.clone(),
                ..Recording::default()
            }),
            &mut actions,
        )
        .unwrap();

        let t0 = LocalTime::from_secs(100);
        host.start_timer("clocky", 1, TimerKind::Repeat, LocalDuration::from_secs(1), t0);
        host.unload("clocky", &mut actions).unwrap();

        host.fire_due_timers(t0 + LocalDuration::from_secs(5), &mut actions);

        assert_eq!(*seen.lock().unwrap(), vec!["unload"]);
    }

    #[test]
    fn context_actions_are_recorded() {
        let mut actions = Vec::new();
        let mut next_timer = 0;
        let mut ctx = Context {
            plugin: "echo".into(),
            actions: &mut actions,
            next_timer: &mut next_timer,
        };

        ctx.message(&"irc".to_owned(), "#room", "hi");
        let timer = ctx.start_timer(TimerKind::Single, 500);
        ctx.stop_timer(timer);

        assert_eq!(actions.len(), 3);
        assert!(matches!(&actions[0], Action::Message { target, .. } if target == "#room"));
        assert!(
            matches!(&actions[1], Action::StartTimer { timer: t, .. } if *t == timer)
        );
    }
}
