//! Handshake listener: the coordinator's listening endpoint.
//!
//! Lifecycle: `Created -> BoundToPort -> Listening -> Accepting -> Drained`.
//! Bind and listen are separate steps so a busy port (`Bind`) and a refused
//! backlog (`Listen`) are reported as distinct startup failures.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::bridge::{FrameError, Handshake, StateFrame};
use crate::registry::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    BoundToPort,
    Listening,
    Accepting,
    Drained,
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("failed to listen on port {port} (backlog {backlog}): {source}")]
    Listen {
        port: u16,
        backlog: u32,
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("listener is not listening (state {0:?})")]
    NotListening(ListenerState),
}

/// Why a connection could not be admitted into the registry.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake protocol error: {0}")]
    Protocol(String),

    #[error("unknown worker identity: pid {pid}")]
    UnknownWorkerIdentity { pid: u32 },

    #[error("peer closed before sending a handshake")]
    Disconnected,

    #[error("slot rejected handshake: {0}")]
    Rejected(#[from] RegistryError),
}

/// First read from a freshly accepted connection, as seen by the event loop.
#[derive(Debug)]
pub enum FirstRead {
    Frame(StateFrame),
    Malformed(FrameError),
    Closed,
}

pub struct HandshakeListener {
    state: ListenerState,
    listener: Option<TcpListener>,
    port: u16,
}

impl Default for HandshakeListener {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeListener {
    pub fn new() -> Self {
        Self {
            state: ListenerState::Created,
            listener: None,
            port: 0,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Port actually bound (resolves port 0 to the OS-assigned port).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `127.0.0.1:port` and start listening with `backlog`.
    pub fn start(&mut self, port: u16, backlog: u32) -> Result<u16, ListenerError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let socket = TcpSocket::new_v4().map_err(|source| ListenerError::Bind { port, source })?;
        socket
            .set_reuseaddr(true)
            .map_err(|source| ListenerError::Bind { port, source })?;
        socket
            .bind(addr)
            .map_err(|source| ListenerError::Bind { port, source })?;
        self.state = ListenerState::BoundToPort;

        let bound = socket
            .local_addr()
            .map_err(|source| ListenerError::Bind { port, source })?
            .port();

        let listener = socket
            .listen(backlog)
            .map_err(|source| ListenerError::Listen {
                port: bound,
                backlog,
                source,
            })?;
        self.state = ListenerState::Listening;
        self.port = bound;
        self.listener = Some(listener);

        tracing::info!(port = bound, backlog, "Listening for workers");
        Ok(bound)
    }

    /// Accept one pending connection.
    ///
    /// Cancel-safe: usable as a `select!` branch, which is how the event loop
    /// waits for the listening socket to become readable.
    pub async fn accept_one(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let listener = match (&self.listener, self.state) {
            (Some(listener), ListenerState::Listening | ListenerState::Accepting) => listener,
            _ => return Err(ListenerError::NotListening(self.state)),
        };
        listener.accept().await.map_err(ListenerError::Accept)
    }

    /// Record that the accept loop has started serving connections.
    pub fn mark_accepting(&mut self) {
        if self.state == ListenerState::Listening {
            self.state = ListenerState::Accepting;
        }
    }

    /// Turn the first read of a connection into the identity it declares.
    ///
    /// Mapping the identity to a slot is the orchestrator's job, since only it
    /// knows which processes were spawned.
    pub fn complete_handshake(&self, first: FirstRead) -> Result<Handshake, HandshakeError> {
        match first {
            FirstRead::Frame(frame) => {
                Handshake::from_frame(&frame).map_err(HandshakeError::Protocol)
            }
            FirstRead::Malformed(e) => Err(HandshakeError::Protocol(e.to_string())),
            FirstRead::Closed => Err(HandshakeError::Disconnected),
        }
    }

    /// Stop listening. Pending, unaccepted connections are refused.
    pub fn drain(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!(port = self.port, "Listener drained");
        }
        self.state = ListenerState::Drained;
    }
}
