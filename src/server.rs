//! The TCP server core: accept loop, one worker thread per connection, an
//! outbound connection manager with reconnect policy, and a per-IP
//! connection cap.
//!
//! Grounded on `tchajed-rust-nbd/src/server.rs::start` for the listener
//! setup (`TcpListener::bind`, `set_nodelay`, one thread per accepted
//! connection) and on `examples/original_source/library/source/server/
//! server.h` for the policies that file's single-threaded `accept` loop
//! didn't need to think about: a per-IP cap, the outbound reconnect-with-
//! retry loop, and draining the oversize-frame buffer instead of blowing
//! up on it.
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use log::{debug, info, warn};
use nix::sys::socket::{setsockopt, shutdown as nix_shutdown, sockopt::ReuseAddr, sockopt::ReusePort, Shutdown as NixShutdown};

use crate::app::{Application, Handler};
use crate::buffer::RecvBuffer;
use crate::connection::{ConnectionIdGen, Direction};
use crate::frame::{is_reserved_cipher, Frame, CIPHER_DELETE, CIPHER_HELLO, CIPHER_MODIFY, CIPHER_PARAMETERS_REQUEST, CIPHER_PAUSE, CIPHER_RUN};
use crate::param::Constraints;
use crate::value::Value;

/// Parameter id: seconds to wait between outbound connection attempts.
pub const PARAM_CONNECT_RETRY_SECONDS: u64 = 1_000_001;
/// Parameter id: outbound connection attempts before giving up.
pub const PARAM_CONNECT_ATTEMPT_LIMIT: u64 = 1_000_002;
/// Parameter id: maximum simultaneous connections accepted from one peer IP.
pub const PARAM_PER_IP_CAP: u64 = 1_000_003;
/// Parameter id: initial per-connection receive buffer size, in bytes.
pub const PARAM_RECV_BUFFER_SIZE: u64 = 1_000_004;
/// Parameter id: per-connection receive buffer high-water mark, in bytes.
pub const PARAM_RECV_BUFFER_LIMIT: u64 = 1_000_005;
/// Parameter id: whether the listener is currently up.
pub const PARAM_SERVER_STATE: u64 = 1_000_006;
/// Parameter id: configured maximum simultaneous connections.
pub const PARAM_MAX_CONNECTIONS: u64 = 1_000_007;
/// Parameter id: IP address the server is listening on.
pub const PARAM_LISTEN_IP: u64 = 1_000_008;
/// Parameter id: TCP port the server is listening on.
pub const PARAM_LISTEN_PORT: u64 = 1_000_009;

const SERVER_STATE_LABELS: [(i64, &str); 2] = [(0, "Stopped"), (1, "Listening")];

/// The listener's run state, mirrored into the const `PARAM_SERVER_STATE`
/// slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Stopped,
    Listening,
}

impl ServerState {
    fn as_code(self) -> i32 {
        match self {
            ServerState::Stopped => 0,
            ServerState::Listening => 1,
        }
    }
}

/// Tunables for listener and connection behavior. These seed the
/// corresponding registry slots at construction time; once the server is
/// running, a manager can change the non-const ones with `CIPHER_MODIFY`
/// and the new value takes effect on the next use (next accept, next
/// outbound retry, next connection's buffer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_connections: i32,
    pub max_frame_size: u64,
    pub recv_buffer_initial_size: u64,
    pub max_connections_per_ip: u64,
    pub connect_attempts_limit: u64,
    pub connect_retry_seconds: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_connections: 256,
            max_frame_size: 16 * 1024 * 1024,
            recv_buffer_initial_size: 4096,
            max_connections_per_ip: 8,
            connect_attempts_limit: 5,
            connect_retry_seconds: 1,
        }
    }
}

/// Read a `u64`-valued registry slot, falling back to `default` if the
/// slot is missing or holds some other kind (it shouldn't, but a default
/// keeps a stray type mismatch from wedging the accept loop).
fn registry_u64<H: Handler>(app: &Application<H>, id: u64, default: u64) -> u64 {
    match app.registry.get(id).map(|s| &s.value) {
        Some(Value::U64(v)) => *v,
        _ => default,
    }
}

fn registry_u32<H: Handler>(app: &Application<H>, id: u64, default: u32) -> u32 {
    match app.registry.get(id).map(|s| &s.value) {
        Some(Value::U32(v)) => *v,
        _ => default,
    }
}

/// Errors the server surface raises. Wraps `io::Error` for the usual
/// socket failures and adds the few conditions that aren't I/O errors.
#[derive(Debug)]
pub enum ServerError {
    Io(io::Error),
    AlreadyRunning,
    ConnectAttemptsExhausted,
    UnknownConnection(i32),
    PerIpCapReached(IpAddr),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "{e}"),
            ServerError::AlreadyRunning => write!(f, "server is already listening"),
            ServerError::ConnectAttemptsExhausted => {
                write!(f, "exhausted connection attempts")
            }
            ServerError::UnknownConnection(id) => write!(f, "no connection with id {id}"),
            ServerError::PerIpCapReached(ip) => {
                write!(f, "per-IP connection cap reached for {ip}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

struct ConnEntry {
    writer: Arc<Mutex<TcpStream>>,
    peer_ip: IpAddr,
}

struct Shared<H: Handler + Send + 'static> {
    app: Mutex<Application<H>>,
    connections: Mutex<HashMap<i32, ConnEntry>>,
    per_ip_counts: Mutex<HashMap<IpAddr, usize>>,
    id_gen: Mutex<ConnectionIdGen>,
    stopped: AtomicBool,
    worker_count: Mutex<usize>,
    worker_done: Condvar,
    config: ServerConfig,
    listener_fd: Mutex<Option<RawFd>>,
}

/// Called from a worker thread once `Application::shutdown_requested`
/// flips true (set by a manager's `CIPHER_DELETE`): marks the server
/// stopped and forcibly unblocks the listener's blocking `accept`, since
/// the accept loop otherwise only checks `stopped` between connections.
fn request_server_shutdown<H: Handler + Send + 'static>(shared: &Arc<Shared<H>>) {
    if shared.stopped.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(target: "paramserve::server", "shutdown requested, unblocking the accept loop");
    if let Some(fd) = *shared.listener_fd.lock().unwrap() {
        if let Err(e) = nix_shutdown(fd, NixShutdown::Both) {
            warn!(target: "paramserve::server", "shutting down listener socket: {e}");
        }
    }
}

/// The server: owns the application, the listener, and every live
/// connection worker thread.
pub struct Server<H: Handler + Send + 'static> {
    shared: Arc<Shared<H>>,
    listener: Option<TcpListener>,
    accept_thread: Option<JoinHandle<()>>,
}

impl<H: Handler + Send + 'static> Server<H> {
    /// Build a server around an application, registering the nine
    /// always-present server-level parameters.
    pub fn new(mut app: Application<H>, config: ServerConfig) -> Self {
        app.registry.register_parameter(
            PARAM_CONNECT_RETRY_SECONDS,
            "Seconds between try to connect",
            Value::U32(config.connect_retry_seconds),
            Constraints::min(Value::U32(1)),
        );
        app.registry.register_parameter(
            PARAM_CONNECT_ATTEMPT_LIMIT,
            "Limit of attempts to connection",
            Value::U64(config.connect_attempts_limit),
            Constraints::min(Value::U64(1)),
        );
        app.registry.register_parameter(
            PARAM_PER_IP_CAP,
            "Limit of connections from one IP",
            Value::U64(config.max_connections_per_ip),
            Constraints::min(Value::U64(1)),
        );
        app.registry.register_parameter(
            PARAM_RECV_BUFFER_SIZE,
            "Recv buffer size",
            Value::U64(config.recv_buffer_initial_size),
            Constraints::min(Value::U64(3)),
        );
        app.registry.register_parameter(
            PARAM_RECV_BUFFER_LIMIT,
            "Recv buffer size limit",
            Value::U64(config.max_frame_size),
            Constraints::min(Value::U64(1024)),
        );
        app.registry.register_const_parameter(
            PARAM_SERVER_STATE,
            "Server state",
            Value::I32(ServerState::Stopped.as_code()),
        );
        app.registry.set_string_interpretations(
            PARAM_SERVER_STATE,
            SERVER_STATE_LABELS
                .iter()
                .map(|(code, label)| (*code, label.to_string()))
                .collect(),
        );
        app.registry.register_const_parameter(
            PARAM_MAX_CONNECTIONS,
            "Max connections",
            Value::I32(config.max_connections),
        );
        app.registry.register_const_parameter(
            PARAM_LISTEN_IP,
            "Listening IP",
            Value::Str(String::new()),
        );
        app.registry.register_const_parameter(
            PARAM_LISTEN_PORT,
            "Listening port",
            Value::OptU16(None),
        );

        Server {
            shared: Arc::new(Shared {
                app: Mutex::new(app),
                connections: Mutex::new(HashMap::new()),
                per_ip_counts: Mutex::new(HashMap::new()),
                id_gen: Mutex::new(ConnectionIdGen::new()),
                stopped: AtomicBool::new(false),
                worker_count: Mutex::new(0),
                worker_done: Condvar::new(),
                config,
                listener_fd: Mutex::new(None),
            }),
            listener: None,
            accept_thread: None,
        }
    }

    pub fn application(&self) -> std::sync::MutexGuard<'_, Application<H>> {
        self.shared.app.lock().unwrap()
    }

    /// Bind, mark `ReuseAddr`/`ReusePort` (best-effort), and start accepting
    /// connections on a background thread.
    pub fn start(&mut self, ip: IpAddr, port: u16) -> Result<(), ServerError>
    where
        H: 'static,
    {
        if self.listener.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        self.shared.stopped.store(false, Ordering::SeqCst);
        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr)?;
        let fd = listener.as_raw_fd();
        *self.shared.listener_fd.lock().unwrap() = Some(fd);
        if let Err(e) = setsockopt(fd, ReuseAddr, &true) {
            warn!(target: "paramserve::server", "SO_REUSEADDR unavailable: {e}");
        }
        if let Err(e) = setsockopt(fd, ReusePort, &true) {
            debug!(target: "paramserve::server", "SO_REUSEPORT unavailable: {e}");
        }

        let bound_port = listener.local_addr()?.port();
        {
            let mut app = self.shared.app.lock().unwrap();
            app.registry
                .force_set(PARAM_LISTEN_PORT, Value::OptU16(Some(bound_port)));
            app.registry
                .force_set(PARAM_LISTEN_IP, Value::Str(ip.to_string()));
            app.registry.force_set(
                PARAM_SERVER_STATE,
                Value::I32(ServerState::Listening.as_code()),
            );
        }

        let accept_listener = listener.try_clone()?;
        let shared = Arc::clone(&self.shared);
        self.accept_thread = Some(thread::spawn(move || accept_loop(accept_listener, shared)));
        self.listener = Some(listener);
        info!(target: "paramserve::server", "listening on {addr}");
        Ok(())
    }

    /// Connections currently accepted or opened via `open_connect`.
    pub fn active_connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Stop accepting new connections, close every live connection, and
    /// block until every worker thread has exited.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.take() {
            drop(listener);
        }
        {
            let connections = self.shared.connections.lock().unwrap();
            for entry in connections.values() {
                let _ = entry.writer.lock().unwrap().shutdown(std::net::Shutdown::Both);
            }
        }
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        let mut count = self.shared.worker_count.lock().unwrap();
        while *count > 0 {
            count = self.shared.worker_done.wait(count).unwrap();
        }
        self.shared.connections.lock().unwrap().clear();
        self.shared.per_ip_counts.lock().unwrap().clear();
        *self.shared.listener_fd.lock().unwrap() = None;
        self.shared
            .app
            .lock()
            .unwrap()
            .registry
            .force_set(PARAM_SERVER_STATE, Value::I32(ServerState::Stopped.as_code()));
        info!(target: "paramserve::server", "stopped");
    }

    /// Send a frame to a specific connection, whether it was accepted or
    /// opened via `open_connect`.
    pub fn send_frame(&self, connection_id: i32, frame: &Frame) -> Result<(), ServerError> {
        let connections = self.shared.connections.lock().unwrap();
        let entry = connections
            .get(&connection_id)
            .ok_or(ServerError::UnknownConnection(connection_id))?;
        let mut writer = entry.writer.lock().unwrap();
        writer.write_all(&frame.encode())?;
        Ok(())
    }

    pub fn send_hello(&self, connection_id: i32) -> Result<(), ServerError> {
        self.send_frame(connection_id, &Frame::new(CIPHER_HELLO))
    }
    pub fn send_run(&self, connection_id: i32) -> Result<(), ServerError> {
        self.send_frame(connection_id, &Frame::new(CIPHER_RUN))
    }
    pub fn send_pause(&self, connection_id: i32) -> Result<(), ServerError> {
        self.send_frame(connection_id, &Frame::new(CIPHER_PAUSE))
    }
    pub fn send_delete(&self, connection_id: i32) -> Result<(), ServerError> {
        self.send_frame(connection_id, &Frame::new(CIPHER_DELETE))
    }
    pub fn send_modify(&self, connection_id: i32, fields: Frame) -> Result<(), ServerError> {
        let mut frame = Frame::new(CIPHER_MODIFY);
        for (key, (_, value)) in fields.iter() {
            frame.set(*key, value.clone());
        }
        self.send_frame(connection_id, &frame)
    }
    pub fn send_metadata_request(&self, connection_id: i32) -> Result<(), ServerError> {
        self.send_frame(connection_id, &Frame::new(crate::frame::CIPHER_METADATA_REQUEST))
    }
    pub fn send_parameters_request(&self, connection_id: i32) -> Result<(), ServerError> {
        self.send_frame(connection_id, &Frame::new(CIPHER_PARAMETERS_REQUEST))
    }

    /// Open an outbound connection under `id`, retrying up to the
    /// configured attempt limit. On success, sends the hello frame and, if
    /// `needs_reconnect` is set, keeps reconnecting (calling
    /// `on_disconnect`/`on_reconnect`) for as long as the server runs.
    pub fn open_connect(
        &self,
        id: i32,
        ip: IpAddr,
        port: u16,
        needs_reconnect: bool,
    ) -> Result<(), ServerError> {
        let (attempts, retry_seconds) = {
            let app = self.shared.app.lock().unwrap();
            (
                registry_u64(
                    &app,
                    PARAM_CONNECT_ATTEMPT_LIMIT,
                    self.shared.config.connect_attempts_limit,
                ),
                registry_u32(
                    &app,
                    PARAM_CONNECT_RETRY_SECONDS,
                    self.shared.config.connect_retry_seconds,
                ),
            )
        };
        let stream = connect_with_retry(ip, port, attempts, StdDuration::from_secs(retry_seconds as u64))?;
        self.register_connection(id, stream, ip, Direction::Outgoing)?;
        self.send_hello(id)?;

        let shared = Arc::clone(&self.shared);
        *self.shared.worker_count.lock().unwrap() += 1;
        thread::spawn(move || {
            outgoing_worker(shared, id, ip, port, needs_reconnect);
        });
        Ok(())
    }

    pub fn close_connect(&self, id: i32) -> Result<(), ServerError> {
        let mut connections = self.shared.connections.lock().unwrap();
        let entry = connections
            .remove(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        let _ = entry.writer.lock().unwrap().shutdown(std::net::Shutdown::Both);
        *self
            .shared
            .per_ip_counts
            .lock()
            .unwrap()
            .entry(entry.peer_ip)
            .or_insert(1) -= 1;
        Ok(())
    }

    fn register_connection(
        &self,
        id: i32,
        stream: TcpStream,
        peer_ip: IpAddr,
        _direction: Direction,
    ) -> Result<(), ServerError> {
        stream.set_nodelay(true).ok();
        let writer = stream.try_clone()?;
        let mut connections = self.shared.connections.lock().unwrap();
        connections.insert(
            id,
            ConnEntry {
                writer: Arc::new(Mutex::new(writer)),
                peer_ip,
            },
        );
        Ok(())
    }
}

fn connect_with_retry(
    ip: IpAddr,
    port: u16,
    attempts: u64,
    delay: StdDuration,
) -> Result<TcpStream, ServerError> {
    let addr = SocketAddr::new(ip, port);
    let attempts = attempts.max(1);
    for attempt in 0..attempts {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(
                    target: "paramserve::server",
                    "connect attempt {}/{attempts} to {addr} failed: {e}",
                    attempt + 1
                );
                if attempt + 1 < attempts {
                    thread::sleep(delay);
                }
            }
        }
    }
    Err(ServerError::ConnectAttemptsExhausted)
}

fn accept_loop<H: Handler + Send + 'static>(listener: TcpListener, shared: Arc<Shared<H>>) {
    for incoming in listener.incoming() {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "paramserve::server", "accept failed: {e}");
                continue;
            }
        };
        let peer_ip = match stream.peer_addr() {
            Ok(addr) => addr.ip(),
            Err(_) => continue,
        };

        {
            let per_ip_cap = registry_u64(
                &shared.app.lock().unwrap(),
                PARAM_PER_IP_CAP,
                shared.config.max_connections_per_ip,
            );
            let mut counts = shared.per_ip_counts.lock().unwrap();
            let entry = counts.entry(peer_ip).or_insert(0);
            if *entry as u64 >= per_ip_cap {
                warn!(
                    target: "paramserve::server",
                    "refusing connection from {peer_ip}: per-IP cap reached"
                );
                continue;
            }
            *entry += 1;
        }

        let id = shared.id_gen.lock().unwrap().next_incoming();
        stream.set_nodelay(true).ok();
        let writer = match stream.try_clone() {
            Ok(w) => w,
            Err(_) => continue,
        };
        shared.connections.lock().unwrap().insert(
            id,
            ConnEntry {
                writer: Arc::new(Mutex::new(writer)),
                peer_ip,
            },
        );

        let worker_shared = Arc::clone(&shared);
        *shared.worker_count.lock().unwrap() += 1;
        thread::spawn(move || {
            serve_connection(worker_shared, id, stream);
        });
    }
}

fn finish_worker<H: Handler + Send + 'static>(shared: &Arc<Shared<H>>) {
    let mut count = shared.worker_count.lock().unwrap();
    *count -= 1;
    if *count == 0 {
        shared.worker_done.notify_all();
    }
}

fn cleanup_connection<H: Handler + Send + 'static>(shared: &Arc<Shared<H>>, id: i32) {
    if let Some(entry) = shared.connections.lock().unwrap().remove(&id) {
        let mut counts = shared.per_ip_counts.lock().unwrap();
        if let Some(n) = counts.get_mut(&entry.peer_ip) {
            *n = n.saturating_sub(1);
        }
    }
}

/// Build a receive buffer sized from the live registry values rather than
/// the construction-time `ServerConfig` snapshot, so a manager's
/// `CIPHER_MODIFY` to the buffer parameters takes effect for the next
/// connection.
fn recv_buffer_for<H: Handler + Send + 'static>(shared: &Arc<Shared<H>>) -> RecvBuffer {
    let app = shared.app.lock().unwrap();
    let initial = registry_u64(&app, PARAM_RECV_BUFFER_SIZE, shared.config.recv_buffer_initial_size);
    let limit = registry_u64(&app, PARAM_RECV_BUFFER_LIMIT, shared.config.max_frame_size);
    RecvBuffer::with_capacity(limit as usize, initial as usize)
}

/// Read frames off one accepted connection until it's closed or the
/// server is stopping, dispatching reserved-cipher frames to the
/// application and everything else to `Handler::on_frame`.
fn serve_connection<H: Handler + Send + 'static>(shared: Arc<Shared<H>>, id: i32, mut stream: TcpStream) {
    let mut recv = recv_buffer_for(&shared);
    let mut chunk = [0u8; 8192];
    stream
        .set_read_timeout(Some(StdDuration::from_millis(200)))
        .ok();

    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!(target: "paramserve::server", "connection {id} closed by peer");
                break;
            }
            Ok(n) => {
                recv.feed(&chunk[..n]);
                if !drain_frames(&shared, id, &mut recv, &stream) {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected) => {
                break;
            }
            Err(e) => {
                warn!(target: "paramserve::server", "read error on connection {id}: {e}");
                break;
            }
        }
    }

    cleanup_connection(&shared, id);
    finish_worker(&shared);
}

/// Pull every complete frame currently buffered and dispatch it. Returns
/// `false` if the connection should be closed (a malformed frame was
/// received).
fn drain_frames<H: Handler + Send + 'static>(
    shared: &Arc<Shared<H>>,
    id: i32,
    recv: &mut RecvBuffer,
    stream: &TcpStream,
) -> bool {
    loop {
        match recv.take_frame() {
            Ok(Some(frame)) => {
                let cipher = frame.cipher;
                let (reply, shutdown_requested) = {
                    let mut app = shared.app.lock().unwrap();
                    let reply = app.dispatch(id, &frame);
                    (reply, app.shutdown_requested())
                };
                if is_reserved_cipher(cipher) {
                    if let Some(reply) = reply {
                        if let Ok(mut writer) = stream.try_clone() {
                            let _ = writer.write_all(&reply.encode());
                        }
                    }
                }
                if shutdown_requested {
                    request_server_shutdown(shared);
                    return true;
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(target: "paramserve::server", "malformed frame on connection {id}: {e}");
                return false;
            }
        }
    }
}

/// Drives one outbound connection: serve it like any other, and if it
/// drops and `needs_reconnect` is set, notify the application and keep
/// retrying until the server stops.
fn outgoing_worker<H: Handler + Send + 'static>(
    shared: Arc<Shared<H>>,
    id: i32,
    ip: IpAddr,
    port: u16,
    needs_reconnect: bool,
) {
    loop {
        let stream = {
            let connections = shared.connections.lock().unwrap();
            connections.get(&id).map(|e| e.writer.lock().unwrap().try_clone())
        };
        let stream = match stream {
            Some(Ok(s)) => s,
            _ => break,
        };

        let mut reader = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => break,
        };
        serve_outgoing_until_closed(&shared, id, &mut reader);

        if shared.stopped.load(Ordering::SeqCst) || !needs_reconnect {
            break;
        }

        shared.app.lock().unwrap().on_disconnect(id);
        cleanup_connection(&shared, id);

        let (attempts, retry_seconds) = {
            let app = shared.app.lock().unwrap();
            (
                registry_u64(
                    &app,
                    PARAM_CONNECT_ATTEMPT_LIMIT,
                    shared.config.connect_attempts_limit,
                ),
                registry_u32(
                    &app,
                    PARAM_CONNECT_RETRY_SECONDS,
                    shared.config.connect_retry_seconds,
                ),
            )
        };
        match connect_with_retry(ip, port, attempts, StdDuration::from_secs(retry_seconds as u64)) {
            Ok(new_stream) => {
                new_stream.set_nodelay(true).ok();
                let writer = match new_stream.try_clone() {
                    Ok(w) => w,
                    Err(_) => break,
                };
                shared.connections.lock().unwrap().insert(
                    id,
                    ConnEntry {
                        writer: Arc::new(Mutex::new(writer)),
                        peer_ip: ip,
                    },
                );
                let _ = new_stream.try_clone().map(|mut w| {
                    w.write_all(&Frame::new(CIPHER_HELLO).encode())
                });
                shared.app.lock().unwrap().on_reconnect(id);
            }
            Err(_) => break,
        }
    }

    finish_worker(&shared);
}

fn serve_outgoing_until_closed<H: Handler + Send + 'static>(
    shared: &Arc<Shared<H>>,
    id: i32,
    stream: &mut TcpStream,
) {
    let mut recv = recv_buffer_for(shared);
    let mut chunk = [0u8; 8192];
    stream
        .set_read_timeout(Some(StdDuration::from_millis(200)))
        .ok();
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                recv.feed(&chunk[..n]);
                if !drain_frames(shared, id, &mut recv, stream) {
                    return;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Application;
    use serial_test::serial;
    use std::net::Ipv4Addr;

    struct NoopHandler;
    impl Handler for NoopHandler {}

    fn server() -> Server<NoopHandler> {
        Server::new(
            Application::new("test-app", NoopHandler),
            ServerConfig {
                max_connections: 4,
                max_frame_size: 4096,
                recv_buffer_initial_size: 256,
                max_connections_per_ip: 1,
                connect_attempts_limit: 1,
                connect_retry_seconds: 1,
            },
        )
    }

    #[test]
    #[serial]
    fn start_and_stop_is_idempotent_and_clean() {
        let mut server = server();
        server
            .start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .expect("bind on an ephemeral port");
        server.stop();
    }

    #[test]
    #[serial]
    fn per_ip_cap_refuses_a_second_connection_from_the_same_peer() {
        let mut server = server();
        server
            .start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .expect("bind on an ephemeral port");
        let port = {
            let app = server.application();
            match app.registry.get(PARAM_LISTEN_PORT).unwrap().value {
                Value::OptU16(Some(p)) => p,
                _ => panic!("listen port not recorded"),
            }
        };

        let _first = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        thread::sleep(StdDuration::from_millis(100));
        let _second = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        thread::sleep(StdDuration::from_millis(100));

        assert_eq!(
            *server
                .shared
                .per_ip_counts
                .lock()
                .unwrap()
                .get(&IpAddr::V4(Ipv4Addr::LOCALHOST))
                .unwrap(),
            1
        );

        server.stop();
    }

    #[test]
    #[serial]
    fn start_records_listen_ip_and_server_state() {
        let mut server = server();
        server
            .start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .expect("bind on an ephemeral port");
        {
            let app = server.application();
            assert_eq!(
                app.registry.get(PARAM_SERVER_STATE).unwrap().value,
                Value::I32(ServerState::Listening.as_code())
            );
            assert_eq!(
                app.registry.get(PARAM_LISTEN_IP).unwrap().value,
                Value::Str(Ipv4Addr::LOCALHOST.to_string())
            );
        }
        server.stop();
        let app = server.application();
        assert_eq!(
            app.registry.get(PARAM_SERVER_STATE).unwrap().value,
            Value::I32(ServerState::Stopped.as_code())
        );
    }

    #[test]
    #[serial]
    fn shutdown_request_unblocks_the_accept_loop() {
        let mut server = server();
        server
            .start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .expect("bind on an ephemeral port");

        request_server_shutdown(&server.shared);
        assert!(server.shared.stopped.load(Ordering::SeqCst));
        if let Some(handle) = server.accept_thread.take() {
            handle.join().expect("accept loop exits once shut down");
        }

        server.stop();
    }
}
