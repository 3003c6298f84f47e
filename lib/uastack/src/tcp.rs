//! TCP connection manager: an event source exposing listen sockets,
//! accepted inbound sockets and outbound active sockets as opaque
//! connection ids with a per-connection callback. All closing is
//! asynchronous via delayed callbacks so pending events drain cleanly
//! before a socket goes away.

use crate::eventloop::{EventLoop, EventSource, EventSourceState, FdEvents, SourceId};
use crate::support::{NetworkError, NetworkResult};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use serde_derive::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use uabase::logging::{self, Logger};
use uabase::status::StatusCode;

pub type ConnectionId = u64;

/// Default shared receive buffer: 128 KiB.
pub const DEFAULT_RECV_BUFSIZE: u32 = 1 << 17;
/// Default cap for allocated send buffers: 64 KiB.
pub const DEFAULT_SEND_BUFSIZE: u32 = 1 << 16;

const SEND_RETRY_LIMIT: u32 = 1000;
const SEND_RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Backlog of pending connections on a listen socket.
const LISTEN_BACKLOG: i32 = 100;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Opening,
    Established,
    Closing,
    Closed,
}

/// Manager-level configuration. `max_connections` of zero means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    pub recv_bufsize: u32,
    pub send_bufsize: u32,
    pub max_connections: u32,
}

impl Default for TcpConfig {
    fn default() -> TcpConfig {
        TcpConfig {
            recv_bufsize: DEFAULT_RECV_BUFSIZE,
            send_bufsize: DEFAULT_SEND_BUFSIZE,
            max_connections: 0,
        }
    }
}

/// Parameters of a single `open_connection` call.
#[derive(Debug, Clone, Default)]
pub struct OpenParams {
    /// Listen interfaces or the connect target. Empty means all interfaces
    /// for listening.
    pub addresses: Vec<String>,
    pub port: u16,
    pub listen: bool,
    /// Only check resolvability/bindability, do not open anything.
    pub validate: bool,
    /// Allow rebinding to a recently used address/port combination.
    pub reuse: bool,
}

impl OpenParams {
    pub fn listen(port: u16) -> OpenParams {
        OpenParams {
            port,
            listen: true,
            ..OpenParams::default()
        }
    }

    pub fn connect<S: Into<String>>(address: S, port: u16) -> OpenParams {
        OpenParams {
            addresses: vec![address.into()],
            port,
            ..OpenParams::default()
        }
    }
}

/// Details accompanying a state-change callback.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub listen_address: Option<String>,
    pub listen_port: Option<u16>,
    pub remote_address: Option<String>,
}

/// Per-connection callback. Invoked for Opening (active connect pending),
/// Established (ready, and again with a non-empty payload on data arrival),
/// Closing (about to close) and Closed (gone).
pub type ConnectionCallback = Rc<
    RefCell<
        dyn FnMut(
            &mut TcpConnectionManager,
            &mut EventLoop,
            ConnectionId,
            ConnectionState,
            &CallbackParams,
            &[u8],
        ),
    >,
>;

/// Wraps a closure into the shared callback handle.
pub fn connection_callback<F>(callback: F) -> ConnectionCallback
where
    F: FnMut(
            &mut TcpConnectionManager,
            &mut EventLoop,
            ConnectionId,
            ConnectionState,
            &CallbackParams,
            &[u8],
        ) + 'static,
{
    Rc::new(RefCell::new(callback))
}

/// One non-blocking read; interrupts are retried, zero bytes mean the peer
/// closed the socket.
fn read_step(stream: &mut TcpStream, buffer: &mut [u8]) -> NetworkResult<usize> {
    loop {
        match stream.read(buffer) {
            Ok(0) => return Err(NetworkError::Fatal(StatusCode::BAD_CONNECTION_CLOSED)),
            Ok(count) => return Ok(count),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// One non-blocking write with interrupt retry.
fn write_step(stream: &mut TcpStream, data: &[u8]) -> NetworkResult<usize> {
    loop {
        match stream.write(data) {
            Ok(0) => return Err(NetworkError::Fatal(StatusCode::BAD_CONNECTION_CLOSED)),
            Ok(count) => return Ok(count),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Creates the bound non-blocking listen socket. IPv6 sockets are v6-only
/// so wildcard listening on both families does not double-bind; `reuse`
/// allows rebinding to a recently used address/port combination.
fn bind_listen_socket(addr: SocketAddr, reuse: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    if reuse {
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

enum ConnSocket {
    Listen(TcpListener),
    Stream(TcpStream),
}

impl ConnSocket {
    fn source_mut(&mut self) -> &mut dyn mio::event::Source {
        match self {
            ConnSocket::Listen(listener) => listener,
            ConnSocket::Stream(stream) => stream,
        }
    }
}

struct TcpConnection {
    socket: ConnSocket,
    /// None while a listen socket is paused by the connection watermark.
    token: Option<Token>,
    state: ConnectionState,
    callback: ConnectionCallback,
    closing: bool,
    listen_info: Option<(String, u16)>,
}

pub struct TcpConnectionManager {
    name: String,
    id: Option<SourceId>,
    state: EventSourceState,
    config: TcpConfig,
    /// One receive buffer shared by all connections; never referenced after
    /// a data callback returns.
    rx_buffer: Vec<u8>,
    conns: HashMap<ConnectionId, TcpConnection>,
    tokens: HashMap<Token, ConnectionId>,
    next_id: ConnectionId,
    limit_reached: bool,
    log: Logger,
}

impl TcpConnectionManager {
    pub fn new<S: Into<String>>(name: S, config: TcpConfig, log: Logger) -> TcpConnectionManager {
        let name = name.into();
        let log = log.new(logging::o!("source" => name.clone()));
        TcpConnectionManager {
            name,
            id: None,
            state: EventSourceState::Fresh,
            config,
            rx_buffer: Vec::new(),
            conns: HashMap::new(),
            tokens: HashMap::new(),
            next_id: 1,
            limit_reached: false,
            log,
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Allocates a send buffer. The size is capped by the configured send
    /// buffer size.
    pub fn alloc_send_buffer(&self, size: usize) -> Result<Vec<u8>, StatusCode> {
        if size > self.config.send_bufsize as usize {
            return Err(StatusCode::BAD_OUT_OF_MEMORY);
        }
        Ok(Vec::with_capacity(size))
    }

    /// Opens a listen or active connection. Connection ids surface through
    /// the callback: one listen call may create several sockets.
    pub fn open_connection(
        &mut self,
        el: &mut EventLoop,
        params: &OpenParams,
        callback: ConnectionCallback,
    ) -> Result<(), StatusCode> {
        if self.state != EventSourceState::Started {
            logging::error!(self.log, "cannot open a connection on a manager that is not started");
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        if params.listen {
            self.open_passive(el, params, callback)
        } else {
            self.open_active(el, params, callback)
        }
    }

    /// Sends the whole buffer, blocking with short poll-sleep retries on
    /// would-block. Consumes the buffer; an unrecoverable error shuts the
    /// connection down.
    pub fn send_with_connection(
        &mut self,
        el: &mut EventLoop,
        id: ConnectionId,
        data: Vec<u8>,
    ) -> Result<(), StatusCode> {
        let mut written = 0;
        let mut retries = 0;
        while written < data.len() {
            let result = match self.conns.get_mut(&id) {
                Some(conn) if !conn.closing => match &mut conn.socket {
                    ConnSocket::Stream(stream) => write_step(stream, &data[written..]),
                    ConnSocket::Listen(_) => return Err(StatusCode::BAD_INVALID_ARGUMENT),
                },
                _ => return Err(StatusCode::BAD_NOT_FOUND),
            };

            match result {
                Ok(count) => {
                    written += count;
                    retries = 0;
                }
                Err(NetworkError::Wait) => {
                    retries += 1;
                    if retries > SEND_RETRY_LIMIT {
                        logging::error!(self.log, "send retry budget exhausted"; "connection" => id);
                        self.shutdown(el, id);
                        return Err(StatusCode::BAD_CONNECTION_CLOSED);
                    }
                    thread::sleep(SEND_RETRY_SLEEP);
                }
                Err(error) => {
                    logging::error!(self.log, "send failed"; "connection" => id, "error" => %error);
                    self.shutdown(el, id);
                    return Err(StatusCode::BAD_CONNECTION_CLOSED);
                }
            }
        }
        Ok(())
    }

    /// Marks the connection closing. The fd is deregistered and the socket
    /// closed from a delayed callback one loop iteration later.
    pub fn close_connection(
        &mut self,
        el: &mut EventLoop,
        id: ConnectionId,
    ) -> Result<(), StatusCode> {
        if !self.conns.contains_key(&id) {
            logging::warn!(self.log, "cannot close connection, not found"; "connection" => id);
            return Err(StatusCode::BAD_NOT_FOUND);
        }
        self.shutdown(el, id);
        Ok(())
    }

    fn source_id(&self) -> Result<SourceId, StatusCode> {
        self.id.ok_or(StatusCode::BAD_INTERNAL_ERROR)
    }

    fn invoke(
        &mut self,
        el: &mut EventLoop,
        callback: &ConnectionCallback,
        id: ConnectionId,
        state: ConnectionState,
        params: &CallbackParams,
        payload: &[u8],
    ) {
        let mut cb = callback.borrow_mut();
        (&mut *cb)(self, el, id, state, params, payload);
    }

    fn alloc_connection_id(&mut self) -> ConnectionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn at_connection_limit(&self) -> bool {
        let max = self.config.max_connections;
        self.limit_reached || (max != 0 && self.conns.len() >= max as usize)
    }

    fn open_passive(
        &mut self,
        el: &mut EventLoop,
        params: &OpenParams,
        callback: ConnectionCallback,
    ) -> Result<(), StatusCode> {
        // absent addresses means all interfaces
        let addresses = if params.addresses.is_empty() {
            logging::info!(self.log, "listening on all interfaces");
            vec!["0.0.0.0".to_string(), "::".to_string()]
        } else {
            params.addresses.clone()
        };

        let mut result = Err(StatusCode::BAD_INTERNAL_ERROR);
        for address in &addresses {
            match self.open_listen_address(el, address, params, callback.clone()) {
                Ok(()) => result = Ok(()),
                Err(code) => {
                    logging::warn!(self.log, "could not listen on address";
                                   "address" => %address, "status" => %code);
                }
            }
        }
        result
    }

    fn open_listen_address(
        &mut self,
        el: &mut EventLoop,
        address: &str,
        params: &OpenParams,
        callback: ConnectionCallback,
    ) -> Result<(), StatusCode> {
        if self.at_connection_limit() {
            logging::error!(self.log, "unable to open listen socket: no available sockets");
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        let source_id = self.source_id()?;
        let resolved: Vec<SocketAddr> = (address, params.port)
            .to_socket_addrs()
            .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?
            .collect();
        if resolved.is_empty() {
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        let mut opened = false;
        for addr in resolved {
            let socket = match bind_listen_socket(addr, params.reuse) {
                Ok(socket) => socket,
                Err(err) => {
                    logging::warn!(self.log, "error binding the listen socket";
                                   "address" => %addr, "error" => %err);
                    continue;
                }
            };

            // only validate: the bind proved the address usable
            if params.validate {
                opened = true;
                continue;
            }

            if let Err(err) = socket.listen(LISTEN_BACKLOG) {
                logging::warn!(self.log, "error listening on the socket";
                               "address" => %addr, "error" => %err);
                continue;
            }
            let mut listener = TcpListener::from_std(socket.into());

            let port = listener
                .local_addr()
                .map(|local| local.port())
                .unwrap_or(params.port);

            let token = match el.register_fd(source_id, &mut listener, Interest::READABLE) {
                Ok(token) => token,
                Err(_) => continue,
            };

            logging::info!(self.log, "creating listen socket";
                           "address" => address, "port" => port);

            let id = self.alloc_connection_id();
            self.tokens.insert(token, id);
            self.conns.insert(
                id,
                TcpConnection {
                    socket: ConnSocket::Listen(listener),
                    token: Some(token),
                    state: ConnectionState::Established,
                    callback: callback.clone(),
                    closing: false,
                    listen_info: Some((address.to_string(), port)),
                },
            );

            let cb_params = CallbackParams {
                listen_address: Some(address.to_string()),
                listen_port: Some(port),
                remote_address: None,
            };
            let cb = callback.clone();
            self.invoke(el, &cb, id, ConnectionState::Established, &cb_params, &[]);
            opened = true;
        }

        if opened {
            Ok(())
        } else {
            Err(StatusCode::BAD_INTERNAL_ERROR)
        }
    }

    fn open_active(
        &mut self,
        el: &mut EventLoop,
        params: &OpenParams,
        callback: ConnectionCallback,
    ) -> Result<(), StatusCode> {
        if self.at_connection_limit() {
            logging::error!(self.log, "unable to establish connection: no available sockets");
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }

        let address = params
            .addresses
            .first()
            .ok_or(StatusCode::BAD_INVALID_ARGUMENT)?;
        let source_id = self.source_id()?;

        let addr = (address.as_str(), params.port)
            .to_socket_addrs()
            .map_err(|_| StatusCode::BAD_INTERNAL_ERROR)?
            .next()
            .ok_or(StatusCode::BAD_INTERNAL_ERROR)?;

        if params.validate {
            return Ok(());
        }

        // non-blocking connect; completion arrives as an OUT event
        let mut stream = TcpStream::connect(addr).map_err(|_| StatusCode::BAD_DISCONNECT)?;
        let _ = stream.set_nodelay(true);

        let token = el.register_fd(source_id, &mut stream, Interest::WRITABLE)?;
        let id = self.alloc_connection_id();
        self.tokens.insert(token, id);
        self.conns.insert(
            id,
            TcpConnection {
                socket: ConnSocket::Stream(stream),
                token: Some(token),
                state: ConnectionState::Opening,
                callback: callback.clone(),
                closing: false,
                listen_info: None,
            },
        );

        logging::info!(self.log, "opening a connection";
                       "address" => address, "port" => params.port, "connection" => id);

        let cb_params = CallbackParams::default();
        self.invoke(el, &callback, id, ConnectionState::Opening, &cb_params, &[]);
        Ok(())
    }

    fn handle_listen_event(&mut self, el: &mut EventLoop, conn_id: ConnectionId) {
        let mut accepted = Vec::new();
        let mut close_listener = false;
        {
            let conn = match self.conns.get_mut(&conn_id) {
                Some(conn) => conn,
                None => return,
            };
            let listener = match &mut conn.socket {
                ConnSocket::Listen(listener) => listener,
                ConnSocket::Stream(_) => return,
            };
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => accepted.push((stream, peer)),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(ref err) if err.kind() == io::ErrorKind::ConnectionAborted => continue,
                    Err(err) => {
                        logging::warn!(self.log, "error accepting, closing the listen socket";
                                       "connection" => conn_id, "error" => %err);
                        close_listener = true;
                        break;
                    }
                }
            }
        }

        for (stream, peer) in accepted {
            self.setup_accepted(el, conn_id, stream, peer);
        }
        if close_listener {
            self.shutdown(el, conn_id);
        }
        self.enforce_connection_limit(el);
    }

    fn setup_accepted(
        &mut self,
        el: &mut EventLoop,
        listener_id: ConnectionId,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) {
        let source_id = match self.source_id() {
            Ok(source_id) => source_id,
            Err(_) => return,
        };
        let callback = match self.conns.get(&listener_id) {
            Some(conn) => conn.callback.clone(),
            None => return,
        };

        let _ = stream.set_nodelay(true);

        let token = match el.register_fd(source_id, &mut stream, Interest::READABLE) {
            Ok(token) => token,
            Err(_) => return,
        };

        let id = self.alloc_connection_id();
        self.tokens.insert(token, id);
        self.conns.insert(
            id,
            TcpConnection {
                socket: ConnSocket::Stream(stream),
                token: Some(token),
                state: ConnectionState::Established,
                callback: callback.clone(),
                closing: false,
                listen_info: None,
            },
        );

        logging::info!(self.log, "connection opened via the listen socket";
                       "connection" => id, "remote" => %peer);

        let cb_params = CallbackParams {
            remote_address: Some(peer.to_string()),
            ..CallbackParams::default()
        };
        self.invoke(el, &callback, id, ConnectionState::Established, &cb_params, &[]);
    }

    /// Pauses all listen sockets once the watermark is reached: the fds are
    /// deregistered, the sockets stay open and idle.
    fn enforce_connection_limit(&mut self, el: &mut EventLoop) {
        let max = self.config.max_connections;
        if max == 0 || self.limit_reached || self.conns.len() < max as usize {
            return;
        }

        logging::info!(self.log, "connection limit reached, pausing listen sockets");
        for conn in self.conns.values_mut() {
            if let ConnSocket::Listen(listener) = &mut conn.socket {
                if let Some(token) = conn.token.take() {
                    self.tokens.remove(&token);
                    el.deregister_fd(listener, token);
                }
            }
        }
        self.limit_reached = true;
    }

    fn handle_stream_event(&mut self, el: &mut EventLoop, conn_id: ConnectionId, events: FdEvents) {
        let state = match self.conns.get(&conn_id) {
            Some(conn) => conn.state,
            None => return,
        };

        if state == ConnectionState::Opening {
            self.finish_connect(el, conn_id);
            return;
        }

        if events.contains(FdEvents::ERR) {
            logging::info!(self.log, "the connection closes with error"; "connection" => conn_id);
            self.shutdown(el, conn_id);
            return;
        }
        if events.contains(FdEvents::OUT) {
            return;
        }
        self.drain_receive(el, conn_id);
    }

    /// The out-event of a pending active connect. Errors also arrive as
    /// out-events, so the socket error is checked explicitly.
    fn finish_connect(&mut self, el: &mut EventLoop, conn_id: ConnectionId) {
        let check = match self.conns.get_mut(&conn_id) {
            Some(conn) => match &mut conn.socket {
                ConnSocket::Stream(stream) => stream.take_error(),
                ConnSocket::Listen(_) => return,
            },
            None => return,
        };

        match check {
            Ok(None) => {}
            Ok(Some(err)) => {
                logging::info!(self.log, "the connection closes with error";
                               "connection" => conn_id, "error" => %err);
                self.shutdown(el, conn_id);
                return;
            }
            Err(err) => {
                logging::info!(self.log, "the connection closes with error";
                               "connection" => conn_id, "error" => %err);
                self.shutdown(el, conn_id);
                return;
            }
        }

        // connected: from now on only read-events are interesting
        let callback = {
            let conn = match self.conns.get_mut(&conn_id) {
                Some(conn) => conn,
                None => return,
            };
            let token = match conn.token {
                Some(token) => token,
                None => return,
            };
            if el
                .modify_fd(conn.socket.source_mut(), token, Interest::READABLE)
                .is_err()
            {
                None
            } else {
                conn.state = ConnectionState::Established;
                Some(conn.callback.clone())
            }
        };

        match callback {
            Some(callback) => {
                logging::debug!(self.log, "opening a new connection"; "connection" => conn_id);
                let cb_params = CallbackParams::default();
                self.invoke(
                    el,
                    &callback,
                    conn_id,
                    ConnectionState::Established,
                    &cb_params,
                    &[],
                );
            }
            None => self.shutdown(el, conn_id),
        }
    }

    /// Reads until would-block, handing each filled buffer slice to the
    /// connection callback as-is. Reassembly is the callback's concern.
    fn drain_receive(&mut self, el: &mut EventLoop, conn_id: ConnectionId) {
        let mut buffer = std::mem::take(&mut self.rx_buffer);
        loop {
            let read_result = match self.conns.get_mut(&conn_id) {
                Some(conn) if !conn.closing => match &mut conn.socket {
                    ConnSocket::Stream(stream) => read_step(stream, &mut buffer[..]),
                    ConnSocket::Listen(_) => break,
                },
                _ => break,
            };

            match read_result {
                Ok(count) => {
                    logging::trace!(self.log, "received message";
                                    "connection" => conn_id, "size" => count);
                    let callback = match self.conns.get(&conn_id) {
                        Some(conn) => conn.callback.clone(),
                        None => break,
                    };
                    let cb_params = CallbackParams::default();
                    self.invoke(
                        el,
                        &callback,
                        conn_id,
                        ConnectionState::Established,
                        &cb_params,
                        &buffer[..count],
                    );
                }
                Err(NetworkError::Wait) => break,
                Err(error) => {
                    logging::debug!(self.log, "recv failed, shutting down";
                                    "connection" => conn_id, "error" => %error);
                    self.shutdown(el, conn_id);
                    break;
                }
            }
        }
        self.rx_buffer = buffer;
    }

    /// Triggers the asynchronous close of one connection.
    fn shutdown(&mut self, el: &mut EventLoop, id: ConnectionId) {
        let source_id = match self.id {
            Some(source_id) => source_id,
            None => return,
        };
        let conn = match self.conns.get_mut(&id) {
            Some(conn) => conn,
            None => return,
        };
        if conn.closing {
            logging::debug!(self.log, "cannot close - already closing"; "connection" => id);
            return;
        }
        conn.closing = true;
        conn.state = ConnectionState::Closing;

        // shutdown cancels a pending poll interest in the socket
        if let ConnSocket::Stream(stream) = &conn.socket {
            let _ = stream.shutdown(Shutdown::Both);
        }

        logging::debug!(self.log, "shutdown triggered"; "connection" => id);

        el.add_delayed_callback(Box::new(move |el| {
            el.with_source(source_id, |source, el| {
                if let Some(cm) = source.as_any_mut().downcast_mut::<TcpConnectionManager>() {
                    cm.finish_close(el, id);
                }
            });
        }));
    }

    /// Runs in a delayed callback: deregisters the fd, signals Closing then
    /// Closed, closes the socket and frees the state.
    fn finish_close(&mut self, el: &mut EventLoop, id: ConnectionId) {
        let mut conn = match self.conns.remove(&id) {
            Some(conn) => conn,
            None => return,
        };

        logging::debug!(self.log, "delayed closing of the connection"; "connection" => id);

        if let Some(token) = conn.token.take() {
            self.tokens.remove(&token);
            el.deregister_fd(conn.socket.source_mut(), token);
        }

        let callback = conn.callback.clone();
        let cb_params = match &conn.listen_info {
            Some((address, port)) => CallbackParams {
                listen_address: Some(address.clone()),
                listen_port: Some(*port),
                remote_address: None,
            },
            None => CallbackParams::default(),
        };

        self.invoke(el, &callback, id, ConnectionState::Closing, &cb_params, &[]);

        // dropping the connection closes the socket
        drop(conn);
        logging::info!(self.log, "socket closed"; "connection" => id);

        self.invoke(el, &callback, id, ConnectionState::Closed, &cb_params, &[]);

        if self.limit_reached {
            self.schedule_listen_reopen(el);
        }
        self.check_stopped();
    }

    fn schedule_listen_reopen(&mut self, el: &mut EventLoop) {
        let source_id = match self.id {
            Some(source_id) => source_id,
            None => return,
        };
        logging::debug!(self.log, "delayed reopen of the listen sockets triggered");
        el.add_delayed_callback(Box::new(move |el| {
            el.with_source(source_id, |source, el| {
                if let Some(cm) = source.as_any_mut().downcast_mut::<TcpConnectionManager>() {
                    cm.reopen_listen_sockets(el);
                }
            });
        }));
    }

    /// Re-registers paused listen sockets once the connection count dropped
    /// below the watermark.
    fn reopen_listen_sockets(&mut self, el: &mut EventLoop) {
        if !self.limit_reached {
            return;
        }
        let max = self.config.max_connections;
        if max != 0 && self.conns.len() >= max as usize {
            return;
        }
        let source_id = match self.id {
            Some(source_id) => source_id,
            None => return,
        };

        let mut reopened = Vec::new();
        for (&id, conn) in self.conns.iter_mut() {
            if conn.token.is_some() || conn.closing {
                continue;
            }
            if let ConnSocket::Listen(listener) = &mut conn.socket {
                if let Ok(token) = el.register_fd(source_id, listener, Interest::READABLE) {
                    conn.token = Some(token);
                    reopened.push((token, id));
                }
            }
        }
        for (token, id) in reopened {
            self.tokens.insert(token, id);
        }
        self.limit_reached = false;
        logging::debug!(self.log, "listen sockets reopened");
    }

    fn check_stopped(&mut self) {
        if self.state == EventSourceState::Stopping && self.conns.is_empty() {
            logging::debug!(self.log, "all sockets closed, the connection manager has stopped");
            self.state = EventSourceState::Stopped;
        }
    }
}

impl EventSource for TcpConnectionManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EventSourceState {
        self.state
    }

    fn attach(&mut self, id: SourceId, _el: &mut EventLoop) -> Result<(), StatusCode> {
        if self.state != EventSourceState::Fresh {
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        self.id = Some(id);
        self.state = EventSourceState::Stopped;
        Ok(())
    }

    fn start(&mut self, _el: &mut EventLoop) -> Result<(), StatusCode> {
        if self.state != EventSourceState::Stopped {
            logging::error!(self.log, "to start, the connection manager has to be registered in an event loop and not started yet");
            return Err(StatusCode::BAD_INTERNAL_ERROR);
        }
        self.rx_buffer = vec![0u8; self.config.recv_bufsize as usize];
        self.state = EventSourceState::Started;
        Ok(())
    }

    fn stop(&mut self, el: &mut EventLoop) {
        logging::debug!(self.log, "shutting down the connection manager");
        self.state = EventSourceState::Stopping;

        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        for id in ids {
            self.shutdown(el, id);
        }
        self.check_stopped();
    }

    fn process_event(&mut self, el: &mut EventLoop, token: Token, events: FdEvents) {
        let conn_id = match self.tokens.get(&token) {
            Some(&conn_id) => conn_id,
            None => return,
        };
        let is_listener = matches!(
            self.conns.get(&conn_id).map(|conn| &conn.socket),
            Some(ConnSocket::Listen(_))
        );
        if is_listener {
            self.handle_listen_event(el, conn_id);
        } else {
            self.handle_stream_event(el, conn_id, events);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
