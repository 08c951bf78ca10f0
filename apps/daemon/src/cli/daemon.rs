use std::time::Duration;

use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use tern_engine::client::handle::Handle as _;
use tern_engine::client::{Client, Handle};
use tern_engine::fsm::event::Event;
use tern_engine::net::reactor::{ControlBind, Waker};

use crate::config::DaemonConfig;

/// Daemon encapsulates the engine's start and orderly stop.
pub struct Daemon {
    config: DaemonConfig,
    cancellation: CancellationToken,
    pub(crate) task_tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            cancellation: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Wait for any service to signal cancellation.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Spawn the engine and its observers; returns the engine handle.
    pub fn run(&self) -> eyre::Result<Handle<Waker>> {
        let engine_config = self.config.to_engine_config()?;
        let control = ControlBind {
            path: self.config.transport.path.clone(),
            owner: self.config.transport.owner()?,
        };

        let client = Client::new(engine_config, control)?;
        let handle = client.handle();
        let events = client.events();

        self.task_tracker.spawn(client.run(self.cancellation.clone()));
        self.spawn_event_logger(events);
        self.task_tracker.close();

        Ok(handle)
    }

    /// Log every event the engine emits.
    fn spawn_event_logger(&self, events: flume::Receiver<Event>) {
        let cancellation = self.cancellation.clone();

        self.task_tracker.spawn(async move {
            loop {
                select! {
                    _ = cancellation.cancelled() => break,
                    event = events.recv_async() => {
                        match event {
                            Ok(event) => info!(target: "event", "{}", event.to_line()),
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }

    /// QUIT everywhere, give the goodbyes a moment to reach the wire,
    /// then stop the loop, bounded by the configured deadline.
    pub async fn shutdown(&self, handle: &Handle<Waker>) {
        info!("Shutting down, closing server connections...");

        handle.shutdown().await.ok();
        sleep(Duration::from_millis(500)).await;

        self.cancellation.cancel();

        select! {
            _ = self.task_tracker.wait() => {},
            _ = sleep(Duration::from_secs(self.config.shutdown_timeout())) => {
                info!("Shutdown timeout reached, exiting...");
            },
        }
    }
}
