use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::connection::{Connection, ConnectionId, Event, Message, State};
use crate::net::framing::close_code;
use crate::net::tcp_opt;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION_ID: u64 = 2;

/// How often the loop wakes to expire stalled handshakes.
const TICK: Duration = Duration::from_millis(250);

/// Application callbacks. All of them run on the server's I/O thread, one at
/// a time, so a handler never races with itself.
pub trait Handler: Send + 'static {
    /// The opening handshake with `peer` completed.
    fn on_connect(&mut self, _peers: &mut Peers<'_>, _id: ConnectionId, _peer: SocketAddr) {}

    /// A complete message arrived. Messages from one connection arrive in order.
    fn on_message(&mut self, peers: &mut Peers<'_>, id: ConnectionId, message: Message);

    /// Fired exactly once for every connection that fired `on_connect`.
    fn on_disconnect(&mut self, _peers: &mut Peers<'_>, _id: ConnectionId) {}
}

/// Adapts a plain `(id, text)` closure into a `Handler`. Binary messages are
/// logged and ignored.
pub struct OnText<F>(F);

pub fn on_text<F>(f: F) -> OnText<F>
where
    F: FnMut(ConnectionId, &str) + Send + 'static,
{
    OnText(f)
}

impl<F> Handler for OnText<F>
where
    F: FnMut(ConnectionId, &str) + Send + 'static,
{
    fn on_message(&mut self, _peers: &mut Peers<'_>, id: ConnectionId, message: Message) {
        match message {
            Message::Text(text) => (self.0)(id, &text),
            Message::Binary(payload) => {
                log::debug!("{} ignoring {} byte binary message", id, payload.len())
            }
        }
    }
}

struct Peer {
    conn: Connection,
    stream: TcpStream,
}

/// Access to the live connection set from inside a `Handler` callback.
/// Writes are queued and flushed once the callback returns.
pub struct Peers<'a> {
    peers: &'a mut HashMap<ConnectionId, Peer>,
}

impl Peers<'_> {
    pub fn send_to(&mut self, id: ConnectionId, text: &str) -> bool {
        self.peers
            .get_mut(&id)
            .map_or(false, |peer| peer.conn.send_text(text))
    }

    pub fn send_binary_to(&mut self, id: ConnectionId, payload: &[u8]) -> bool {
        self.peers
            .get_mut(&id)
            .map_or(false, |peer| peer.conn.send_binary(payload))
    }

    /// Queues `text` for every open connection and returns how many there were.
    pub fn broadcast(&mut self, text: &str) -> usize {
        let mut sent = 0;
        for peer in self.peers.values_mut() {
            if peer.conn.send_text(text) {
                sent += 1;
            }
        }
        sent
    }

    pub fn close(&mut self, id: ConnectionId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.conn.close(close_code::NORMAL, "");
        }
    }

    /// Connections that completed the handshake and are not closing.
    pub fn open_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .peers
            .values()
            .filter(|peer| peer.conn.is_open())
            .map(|peer| peer.conn.id())
            .collect();
        ids.sort();
        ids
    }
}

enum Command {
    Broadcast { text: String, reply: Sender<usize> },
    SendTo { id: ConnectionId, text: String, reply: Sender<bool> },
    Count { reply: Sender<usize> },
    Stop,
}

/// Owner's side of a running server. Dropping it stops the server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    commands: Sender<Command>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

pub struct Server;

impl Server {
    /// Binds the listener and spawns the I/O thread. Bind failures are
    /// returned here; the loop never starts in that case.
    pub fn start<H: Handler>(config: ServerConfig, handler: H) -> Result<ServerHandle, ServerError> {
        let addr = config.socket_addr();
        let std_listener = tcp_opt::bind_listener(addr, config.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(std_listener);
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let (commands, inbox) = mpsc::channel();
        let io_core = config.io_core;
        let event_loop = EventLoop {
            poll,
            listener,
            peers: HashMap::new(),
            next_id: FIRST_CONNECTION_ID,
            commands: inbox,
            handler,
            config,
        };

        let thread = thread::Builder::new()
            .name("ws-io".into())
            .spawn(move || {
                if let Some(core) = io_core {
                    pin_to_core(core);
                }
                event_loop.run();
            })?;

        log::info!("websocket server listening on {}", local_addr);
        Ok(ServerHandle {
            local_addr,
            commands,
            waker,
            thread: Some(thread),
        })
    }
}

/// One-call entry point taking the two scalar fields of the add-on UI.
pub fn start<F>(bind_address: &str, bind_port: u16, on_message: F) -> Result<ServerHandle, ServerError>
where
    F: FnMut(ConnectionId, &str) + Send + 'static,
{
    let config = ServerConfig::new(bind_address, bind_port)?;
    Server::start(config, on_text(on_message))
}

fn pin_to_core(core: usize) {
    let Some(core_id) = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
    else {
        log::warn!("core {} not available, I/O thread left unpinned", core);
        return;
    };
    if core_affinity::set_for_current(core_id) {
        log::info!("I/O thread pinned to core {}", core);
    } else {
        log::warn!("failed to pin I/O thread to core {}", core);
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Sends `text` to every open connection. Returns how many were sent to.
    pub fn broadcast(&self, text: &str) -> usize {
        self.request(|reply| Command::Broadcast {
            text: text.to_string(),
            reply,
        })
        .unwrap_or(0)
    }

    pub fn send_to(&self, id: ConnectionId, text: &str) -> bool {
        self.request(|reply| Command::SendTo {
            id,
            text: text.to_string(),
            reply,
        })
        .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.request(|reply| Command::Count { reply }).unwrap_or(0)
    }

    /// Round-trips a command through the loop thread. `None` if the loop is
    /// gone, or if called from the loop thread itself (use `Peers` there).
    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> Command) -> Option<T> {
        let thread = self.thread.as_ref()?;
        if thread.thread().id() == thread::current().id() {
            log::error!("ServerHandle used from inside a handler; use Peers instead");
            return None;
        }
        let (reply, answer) = mpsc::channel();
        self.commands.send(make(reply)).ok()?;
        if let Err(e) = self.waker.wake() {
            log::error!("failed to wake server loop: {}", e);
            return None;
        }
        answer.recv().ok()
    }

    /// Closes every connection (with a Going Away frame), closes the listener
    /// and joins the I/O thread. Safe to call more than once.
    ///
    /// From inside a handler the loop is told to stop once the callback
    /// returns, but cannot be joined.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.commands.send(Command::Stop);
        if thread.thread().id() == thread::current().id() {
            log::info!("websocket server on {} stopping from its own loop", self.local_addr);
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::error!("failed to wake server loop: {}", e);
        }
        if thread.join().is_err() {
            log::error!("server loop panicked");
        }
        log::info!("websocket server on {} stopped", self.local_addr);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct EventLoop<H> {
    poll: Poll,
    listener: TcpListener,
    peers: HashMap<ConnectionId, Peer>,
    next_id: u64,
    commands: Receiver<Command>,
    handler: H,
    config: ServerConfig,
}

impl<H: Handler> EventLoop<H> {
    fn run(mut self) {
        let mut events = Events::with_capacity(128);
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];
        let timeout = self.config.handshake_timeout.map(|_| TICK);

        loop {
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                log::error!("poll failed, stopping server loop: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    Token(raw) => {
                        let id = ConnectionId(raw as u64);
                        if event.is_readable() || event.is_read_closed() {
                            self.read(id, &mut buf);
                        }
                    }
                }
            }

            if !self.run_commands() {
                break;
            }
            self.expire_handshakes();
            self.settle();
        }

        self.shutdown();
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(e) = tcp_opt::apply_optimizations(&stream) {
                        log::debug!("could not tune socket from {}: {}", addr, e);
                    }
                    let id = ConnectionId(self.next_id);
                    self.next_id += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(id.0 as usize),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!("failed to register connection from {}: {}", addr, e);
                        continue;
                    }
                    log::info!("{} new connection from {}", id, addr);
                    let conn = Connection::new(id, addr, self.config.max_message_size);
                    self.peers.insert(id, Peer { conn, stream });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Reads until the socket would block, then hands decoded events to the
    /// handler.
    fn read(&mut self, id: ConnectionId, buf: &mut [u8]) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        while peer.conn.state() != State::Closed {
            match peer.stream.read(buf) {
                Ok(0) => {
                    log::info!("{} peer closed the socket", id);
                    peer.conn.force_close();
                }
                Ok(n) => peer.conn.receive(&buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("{} read failed: {}", id, e);
                    peer.conn.force_close();
                }
            }
        }

        self.dispatch(id);
    }

    fn dispatch(&mut self, id: ConnectionId) {
        loop {
            let Some((event, addr)) = self
                .peers
                .get_mut(&id)
                .and_then(|peer| peer.conn.next_event().map(|event| (event, peer.conn.peer())))
            else {
                return;
            };

            let mut peers = Peers {
                peers: &mut self.peers,
            };
            match event {
                Event::Opened => self.handler.on_connect(&mut peers, id, addr),
                Event::Message(message) => self.handler.on_message(&mut peers, id, message),
            }
        }
    }

    /// Returns false once the loop should exit.
    fn run_commands(&mut self) -> bool {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            };

            let mut peers = Peers {
                peers: &mut self.peers,
            };
            match command {
                Command::Broadcast { text, reply } => {
                    let _ = reply.send(peers.broadcast(&text));
                }
                Command::SendTo { id, text, reply } => {
                    let _ = reply.send(peers.send_to(id, &text));
                }
                Command::Count { reply } => {
                    let _ = reply.send(peers.open_ids().len());
                }
                Command::Stop => return false,
            }
        }
    }

    fn expire_handshakes(&mut self) {
        let Some(timeout) = self.config.handshake_timeout else {
            return;
        };
        let now = Instant::now();
        for peer in self.peers.values_mut() {
            if peer.conn.handshake_expired(now, timeout) {
                log::info!("{} handshake timed out", peer.conn.id());
                peer.conn.close(close_code::PROTOCOL_ERROR, "");
            }
        }
    }

    /// Flushes queued output and drops finished connections until nothing
    /// changes. Disconnect callbacks may queue more output for other peers.
    fn settle(&mut self) {
        loop {
            for peer in self.peers.values_mut() {
                flush(peer);
            }
            if !self.reap() {
                break;
            }
        }
    }

    /// Removes closed connections. Returns whether any were removed.
    fn reap(&mut self) -> bool {
        let closed: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.conn.state() == State::Closed)
            .map(|(id, _)| *id)
            .collect();

        for id in &closed {
            let Some(mut peer) = self.peers.remove(id) else {
                continue;
            };
            if let Err(e) = self.poll.registry().deregister(&mut peer.stream) {
                log::debug!("{} deregister failed: {}", id, e);
            }
            drop(peer.stream);
            log::info!("{} connection closed", id);

            if peer.conn.has_opened() {
                let mut peers = Peers {
                    peers: &mut self.peers,
                };
                self.handler.on_disconnect(&mut peers, *id);
            }
        }
        !closed.is_empty()
    }

    fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(mut peer) = self.peers.remove(&id) else {
                continue;
            };
            peer.conn.close(close_code::GOING_AWAY, "server shutting down");
            // Best effort: one non-blocking flush of the Close frame.
            flush(&mut peer);
            let _ = self.poll.registry().deregister(&mut peer.stream);
            drop(peer.stream);

            if peer.conn.has_opened() {
                let mut peers = Peers {
                    peers: &mut self.peers,
                };
                self.handler.on_disconnect(&mut peers, id);
            }
        }
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            log::debug!("listener deregister failed: {}", e);
        }
    }
}

/// Writes as much queued output as the socket accepts.
fn flush(peer: &mut Peer) {
    while let Some(bytes) = peer.conn.pending_output() {
        match peer.stream.write(bytes) {
            Ok(0) => {
                log::warn!("{} socket refused write", peer.conn.id());
                peer.conn.force_close();
            }
            Ok(n) => peer.conn.consume_output(n),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !is_disconnect(&e) {
                    log::warn!("{} write failed: {}", peer.conn.id(), e);
                }
                peer.conn.force_close();
            }
        }
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
