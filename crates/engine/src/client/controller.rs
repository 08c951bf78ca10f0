//! Pre-wired engine client: reactor, service and handle.
use std::time;

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::client::error::Error;
use crate::client::handle;
use crate::client::service::Service;
use crate::common::time::RefClock;
use crate::fsm::event::Event;
use crate::fsm::handler::{Command, Config};
use crate::fsm::servers::ServerConfig;
use crate::net::reactor::{ControlBind, Reactor, Waker};
use crate::net::ServerId;

/// Runs a pre-loaded engine.
pub struct Client {
    handle: Handle<Waker>,
    service: Service<RefClock>,
    control: ControlBind,
    commands: chan::Receiver<Command>,
    events: chan::Receiver<Event>,
    events_tx: chan::Sender<Event>,
    reactor: Reactor,
}

impl Client {
    /// Create a new client around an engine configuration.
    pub fn new(config: Config, control: ControlBind) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let (events_tx, events_rx) = chan::unbounded::<Event>();

        let reactor = Reactor::new()?;
        let clock = RefClock::default();
        let rng = fastrand::Rng::new();

        let service = Service::new(config, clock, rng);

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
        };

        Ok(Self {
            handle,
            service,
            control,
            commands: commands_rx,
            events: events_rx,
            events_tx,
            reactor,
        })
    }

    /// Run the engine until cancelled.
    pub async fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(
                &self.control,
                self.service,
                self.commands,
                self.events_tx,
                cancellation,
            )
            .await;

        if let Err(e) = result {
            error!("Engine is down. Client run error: {}", e);
        }
    }

    /// Create a new handle to communicate with the engine.
    pub fn handle(&self) -> Handle<Waker> {
        self.handle.clone()
    }

    /// Events the engine emits, for observability.
    pub fn events(&self) -> chan::Receiver<Event> {
        self.events.clone()
    }
}

/// Concrete engine handle over the reactor's command channel.
#[derive(Clone)]
pub struct Handle<W: crate::net::Waker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub timeout: time::Duration,
}

impl<W: crate::net::Waker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }
}

#[async_trait]
impl<W: crate::net::Waker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn connect(&self, config: ServerConfig) -> Result<(), handle::Error> {
        self._command(Command::Connect(Box::new(config))).await
    }

    async fn disconnect(&self, id: Option<ServerId>) -> Result<(), handle::Error> {
        self._command(Command::Disconnect(id)).await
    }

    async fn reconnect(&self, id: Option<ServerId>) -> Result<(), handle::Error> {
        self._command(Command::Reconnect(id)).await
    }

    async fn servers(&self) -> Result<Vec<ServerId>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self._command(Command::GetServers(transmit)).await?;

        match receive.recv_async().await {
            Ok(ids) => Ok(ids),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn shutdown(&self) -> Result<(), handle::Error> {
        self._command(Command::Shutdown).await
    }
}
