//! Poll-based reactor. This is a single-threaded reactor using a `poll` loop.
use std::collections::{HashMap, HashSet};
use std::io;
use std::net;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use flume as chan;
use popol::Event;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::net::socket::Socket;
use crate::net::time::TimeoutManager;
use crate::net::{
    error::Error, Disconnect, Io, LocalDuration, LocalTime, PeerId, ServerId, Service, Source,
};

/// Maximum amount of time to wait for i/o when no timer is due sooner.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 64;
/// Outbound ceiling for a control peer that is not draining.
const MAX_PEER_BUFFER: usize = 128 * 1024;

/// Where to bind the control socket, and who should own the node.
#[derive(Debug, Clone)]
pub struct ControlBind {
    pub path: PathBuf,
    pub owner: Option<(u32, u32)>,
}

#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }
}

impl crate::net::Waker for Waker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// A single-threaded non-blocking reactor over IRC server transports
/// and the control socket.
pub struct Reactor {
    servers: HashMap<ServerId, Socket<net::TcpStream>>,
    connecting: HashSet<ServerId>,
    peers: HashMap<PeerId, Socket<UnixStream>>,
    next_peer: PeerId,
    sources: popol::Sources<Source>,
    waker: Waker,
    timeouts: TimeoutManager,
}

impl Reactor {
    /// Construct a new reactor.
    pub fn new() -> io::Result<Self> {
        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let timeouts = TimeoutManager::new(LocalDuration::from_millis(10));

        Ok(Self {
            servers: HashMap::new(),
            connecting: HashSet::new(),
            peers: HashMap::new(),
            next_peer: 0,
            sources,
            waker,
            timeouts,
        })
    }

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Run the given service with the reactor.
    ///
    /// The control socket is bound before the first poll; the node is
    /// unlinked again when the loop exits.
    pub async fn run<S>(
        &mut self,
        control: &ControlBind,
        mut service: S,
        commands: chan::Receiver<S::Command>,
        publisher: chan::Sender<S::Ev>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Service + Send,
        S::DisconnectReason: Send + Sync,
    {
        let listener = bind_control(control)?;
        self.sources
            .register(Source::Listener, &listener, popol::interest::READ);
        debug!(target: "net", "Listening for control connections on {}", control.path.display());

        let local_time = SystemTime::now().into();
        service.initialize(local_time).await;
        self.process(&mut service, &publisher, local_time).await;

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = Vec::with_capacity(32);

        let result = loop {
            select! {
                _ = cancellation.cancelled() => {
                    trace!("Reactor cancelled");
                    break Ok(());
                }
                result = self.step(&mut events, &mut service, &commands, &publisher, &listener) => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(err) = std::fs::remove_file(&control.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(target: "net", "Could not unlink {}: {}", control.path.display(), err);
            }
        }
        result
    }

    async fn step<S>(
        &mut self,
        events: &mut Vec<Event<Source>>,
        service: &mut S,
        commands: &chan::Receiver<S::Command>,
        publisher: &chan::Sender<S::Ev>,
        listener: &UnixListener,
    ) -> Result<(), Error>
    where
        S: Service + Send,
        S::DisconnectReason: Send + Sync,
    {
        tokio::task::yield_now().await;

        let wait = self
            .timeouts
            .next(LocalTime::now())
            .unwrap_or(WAIT_TIMEOUT)
            .clamp(LocalDuration::from_millis(1), WAIT_TIMEOUT);

        trace!(
            "Polling {} source(s) and {} timeout(s), waking up in {}..",
            self.sources.len(),
            self.timeouts.len(),
            wait,
        );

        let result = self.sources.wait_timeout(events, wait.into()); // Blocking.
        let local_time = SystemTime::now().into();

        service.tick(local_time);

        match result {
            Ok(n) => {
                trace!("Woke up with {n} source(s) ready");

                for event in events.drain(..) {
                    match &event.key {
                        Source::Server(id) => {
                            let id = id.clone();

                            if event.is_invalid() {
                                // File descriptor was closed out from under us.
                                error!(target: "net", "{}: Socket is invalid, removing", id);
                                self.sources.unregister(&event.key);
                                continue;
                            }
                            if event.is_error() || event.is_hangup() {
                                // Let the subsequent read fail.
                                trace!("{}: Socket error triggered: {:?}", id, event);
                            }
                            if event.is_writable() {
                                self.server_writable(&id, service).await?;
                            }
                            if event.is_readable() {
                                self.server_readable(&id, service).await;
                            }
                        }
                        Source::Peer(peer) => {
                            let peer = *peer;

                            if event.is_invalid() {
                                self.sources.unregister(&event.key);
                                self.peers.remove(&peer);
                                service.peer_disconnected(peer);
                                continue;
                            }
                            if event.is_writable() {
                                self.peer_writable(peer, service);
                            }
                            if event.is_readable() {
                                self.peer_readable(peer, service).await;
                            }
                        }
                        Source::Listener => self.accept_peers(listener, service),
                        Source::Waker => {
                            trace!("Woken up by waker ({} command(s))", commands.len());
                            popol::Waker::reset(event.source).ok();

                            for cmd in commands.try_iter() {
                                service.command_received(cmd).await;
                            }
                        }
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                if self.timeouts.expire(local_time) > 0 {
                    service.timer_expired().await;
                }
            }
            Err(err) => return Err(err.into()),
        }
        self.process(service, publisher, local_time).await;

        Ok(())
    }

    /// Process service state machine outputs.
    async fn process<S>(
        &mut self,
        service: &mut S,
        publisher: &chan::Sender<S::Ev>,
        local_time: LocalTime,
    ) where
        S: Service + Send,
        S::DisconnectReason: Send + Sync,
    {
        // Note that there may be bytes destined for a server that has
        // since been disconnected.
        while let Some(out) = service.next() {
            match out {
                Io::Write(id, bytes) => {
                    if let Some((socket, source)) = self.servers.get_mut(&id).and_then(|socket| {
                        self.sources
                            .get_mut(&Source::Server(id.clone()))
                            .map(|source| (socket, source))
                    }) {
                        socket.push(&bytes);
                        source.set(popol::interest::WRITE);
                    }
                }
                Io::PeerWrite(peer, bytes) => {
                    if let Some((socket, source)) = self.peers.get_mut(&peer).and_then(|socket| {
                        self.sources
                            .get_mut(&Source::Peer(peer))
                            .map(|source| (socket, source))
                    }) {
                        socket.push(&bytes);
                        source.set(popol::interest::WRITE);

                        if socket.buffered() > MAX_PEER_BUFFER {
                            warn!(target: "net", "Control peer #{} is not draining, dropping", peer);
                            self.drop_peer(peer, service);
                        }
                    }
                }
                Io::Connect(id, host, port) => {
                    match dial(&host, port) {
                        Ok(stream) => {
                            self.sources.register(
                                Source::Server(id.clone()),
                                &stream,
                                popol::interest::ALL,
                            );
                            self.servers.insert(id.clone(), Socket::from(stream));
                            self.connecting.insert(id.clone());

                            service.attempted(&id);
                        }
                        Err(err) => {
                            error!(target: "net", "{}: Dial error: {}", id, err.to_string());

                            service
                                .disconnected(&id, Disconnect::DialError(Arc::new(err)))
                                .await;
                        }
                    };
                }
                Io::Disconnect(id, reason) => {
                    // Flush any goodbye still buffered, then shut the
                    // connection down, ignoring any potential errors
                    // (`ENOTCONN` if the remote already left).
                    if let Some(socket) = self.servers.get_mut(&id) {
                        socket.flush().ok();
                        socket.disconnect().ok();
                    }
                    self.unregister_server(&id, Disconnect::StateMachine(reason), service)
                        .await;
                }
                Io::DropPeer(peer) => self.drop_peer(peer, service),
                Io::SetTimer(timeout) => {
                    self.timeouts.register(local_time + timeout);
                }
                Io::Event(event) => {
                    trace!("Event: {:?}", event);

                    publisher.send(event).ok();
                }
            }
        }
    }

    /// Unregister a server transport from the reactor.
    async fn unregister_server<S>(
        &mut self,
        id: &ServerId,
        reason: Disconnect<S::DisconnectReason>,
        service: &mut S,
    ) where
        S: Service + Send,
    {
        self.connecting.remove(id);
        self.servers.remove(id);
        self.sources.unregister(&Source::Server(id.clone()));

        service.disconnected(id, reason).await;
    }

    fn drop_peer<S>(&mut self, peer: PeerId, service: &mut S)
    where
        S: Service + Send,
    {
        if let Some(socket) = self.peers.remove(&peer) {
            socket.disconnect().ok();
        }
        self.sources.unregister(&Source::Peer(peer));
        service.peer_disconnected(peer);
    }

    async fn server_readable<S>(&mut self, id: &ServerId, service: &mut S)
    where
        S: Service + Send,
    {
        // Nb. If the socket was readable and writable at the same time, and it
        // was disconnected during an attempt to write, it will no longer be
        // registered and hence available for reads.
        let Some(socket) = self.servers.get_mut(id) else {
            return;
        };
        let mut buffer = [0; READ_BUFFER_SIZE];

        trace!("{}: Socket is readable", id);

        // Nb. Since `poll`, which this reactor is based on, is level-triggered,
        // we will be notified again if there is still data to be read on the
        // socket. Hence, there is no use in putting this socket read in a loop,
        // as the second invocation would likely block.
        match socket.read(&mut buffer) {
            Ok(count) if count > 0 => {
                service
                    .message_received(id, std::borrow::Cow::Borrowed(&buffer[..count]))
                    .await;
            }
            Ok(_) => {
                // Zero bytes read means the remote performed an orderly
                // shutdown.
                socket.disconnect().ok();
                self.unregister_server(
                    id,
                    Disconnect::ConnectionError(Arc::new(io::Error::from(
                        io::ErrorKind::ConnectionReset,
                    ))),
                    service,
                )
                .await;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // This shouldn't normally happen, since this function is only
                // called when there's data on the socket.
            }
            Err(err) => {
                trace!("{}: Read error: {}", id, err.to_string());

                socket.disconnect().ok();
                self.unregister_server(id, Disconnect::ConnectionError(Arc::new(err)), service)
                    .await;
            }
        }
    }

    async fn server_writable<S>(&mut self, id: &ServerId, service: &mut S) -> io::Result<()>
    where
        S: Service + Send,
    {
        trace!("{}: Socket is writable", id);

        let Some(source) = self.sources.get_mut(&Source::Server(id.clone())) else {
            return Ok(());
        };
        let Some(socket) = self.servers.get_mut(id) else {
            return Ok(());
        };

        // "A file descriptor for a socket that is connecting asynchronously
        // shall indicate that it is ready for writing, once a connection has
        // been established." Since we perform a non-blocking connect, we're
        // only really connected once the socket is writable.
        if self.connecting.remove(id) {
            service.connected(id);
        }

        match socket.flush() {
            // Everything was written; no longer interested in writability.
            Ok(()) => {
                source.unset(popol::interest::WRITE);
            }
            // Partial write; stay interested.
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::WriteZero].contains(&err.kind()) =>
            {
                source.set(popol::interest::WRITE);
            }
            Err(err) => {
                error!(target: "net", "{}: Write error: {}", id, err.to_string());

                socket.disconnect().ok();
                self.unregister_server(id, Disconnect::ConnectionError(Arc::new(err)), service)
                    .await;
            }
        }
        Ok(())
    }

    async fn peer_readable<S>(&mut self, peer: PeerId, service: &mut S)
    where
        S: Service + Send,
    {
        let Some(socket) = self.peers.get_mut(&peer) else {
            return;
        };
        let mut buffer = [0; READ_BUFFER_SIZE];

        match socket.read(&mut buffer) {
            Ok(count) if count > 0 => {
                service
                    .peer_bytes_received(peer, std::borrow::Cow::Borrowed(&buffer[..count]))
                    .await;
            }
            Ok(_) => self.drop_peer(peer, service),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => self.drop_peer(peer, service),
        }
    }

    fn peer_writable<S>(&mut self, peer: PeerId, service: &mut S)
    where
        S: Service + Send,
    {
        let Some(source) = self.sources.get_mut(&Source::Peer(peer)) else {
            return;
        };
        let Some(socket) = self.peers.get_mut(&peer) else {
            return;
        };

        match socket.flush() {
            Ok(()) => {
                source.unset(popol::interest::WRITE);
            }
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::WriteZero].contains(&err.kind()) =>
            {
                source.set(popol::interest::WRITE);
            }
            Err(_) => self.drop_peer(peer, service),
        }
    }

    fn accept_peers<S>(&mut self, listener: &UnixListener, service: &mut S)
    where
        S: Service + Send,
    {
        loop {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "net", "Accept error: {}", e.to_string());
                    break;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                error!(target: "net", "Accept error: {}", e.to_string());
                continue;
            }

            let peer = self.next_peer;
            self.next_peer += 1;

            trace!("Accepted control peer #{}", peer);

            self.sources
                .register(Source::Peer(peer), &stream, popol::interest::READ);
            self.peers.insert(peer, Socket::from(stream));

            service.peer_connected(peer);
        }
    }
}

/// Bind the control socket, replacing any stale node, and hand it to
/// the configured owner.
fn bind_control(control: &ControlBind) -> Result<UnixListener, Error> {
    if let Err(err) = std::fs::remove_file(&control.path) {
        if err.kind() != io::ErrorKind::NotFound {
            return Err(Error::Bind {
                path: control.path.clone(),
                source: err,
            });
        }
    }

    let listener = UnixListener::bind(&control.path).map_err(|source| Error::Bind {
        path: control.path.clone(),
        source,
    })?;
    listener.set_nonblocking(true)?;

    if let Some((uid, gid)) = control.owner {
        let path = std::ffi::CString::new(control.path.as_os_str().as_bytes())
            .expect("socket path contains no NUL byte");

        // SAFETY: `path` is a valid NUL-terminated string.
        if unsafe { libc::chown(path.as_ptr(), uid, gid) } != 0 {
            return Err(Error::Bind {
                path: control.path.clone(),
                source: io::Error::last_os_error(),
            });
        }
    }

    Ok(listener)
}

/// Connect to a server given a remote address.
fn dial(host: &str, port: u16) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};
    use std::net::ToSocketAddrs;

    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve"))?;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_nonblocking(true)?;

    match sock.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}
