//! Readiness loop shared by the handshake and exchange phases.
//!
//! Each accepted connection gets a reader task that decodes frames and
//! forwards them, along with end-of-stream and decode failures, into one
//! channel. `EventMultiplexer::next` then waits on {shutdown, listener,
//! channel} and yields one readiness event at a time. Reader tasks never touch
//! the registry; all mutation happens on the caller's task.

use std::collections::HashSet;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::{FrameCodec, FrameError, StateFrame};
use crate::listener::{FirstRead, HandshakeListener, ListenerError};
use crate::registry::ConnId;

/// What a reader task observed on its connection.
#[derive(Debug)]
pub enum ConnEvent {
    Frame(StateFrame),
    /// Bytes that do not decode as a frame. The reader stops after this.
    Malformed(FrameError),
    /// End of stream, orderly or abrupt.
    Closed,
}

impl From<ConnEvent> for FirstRead {
    fn from(event: ConnEvent) -> Self {
        match event {
            ConnEvent::Frame(frame) => FirstRead::Frame(frame),
            ConnEvent::Malformed(e) => FirstRead::Malformed(e),
            ConnEvent::Closed => FirstRead::Closed,
        }
    }
}

/// One dispatchable readiness event.
#[derive(Debug)]
pub enum Readiness {
    Accepted(Connection),
    AcceptFailed(ListenerError),
    Read { conn: ConnId, event: ConnEvent },
}

/// Write side of an accepted connection plus its reader task.
///
/// Dropping it closes the socket: the write half shuts down and the reader
/// task (which owns the read half) is aborted.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    reader: JoinHandle<()>,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_port(&self) -> u16 {
        self.peer.port()
    }

    pub async fn send(&mut self, frame: &StateFrame) -> Result<(), FrameError> {
        self.writer.send(frame).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Stop signal for an [`EventMultiplexer`], cloneable across tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.is_cancelled()
    }
}

pub struct EventMultiplexer {
    events_tx: mpsc::UnboundedSender<(ConnId, ConnEvent)>,
    events_rx: mpsc::UnboundedReceiver<(ConnId, ConnEvent)>,
    shutdown: ShutdownHandle,
    next_conn: u64,
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventMultiplexer {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx,
            shutdown: ShutdownHandle::default(),
            next_conn: 0,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Wait for the next event on the listener or a watched connection.
    ///
    /// `watched` is rebuilt by the caller every iteration; events from
    /// connections outside it are stale (the connection was already unbound or
    /// rejected) and are discarded here. Returns `None` once shutdown has been
    /// signalled.
    pub async fn next(
        &mut self,
        listener: &HandshakeListener,
        watched: &HashSet<ConnId>,
    ) -> Option<Readiness> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.0.cancelled() => return None,

                accepted = listener.accept_one() => {
                    return Some(match accepted {
                        Ok((stream, peer)) => Readiness::Accepted(self.register(stream, peer)),
                        Err(e) => Readiness::AcceptFailed(e),
                    });
                }

                Some((conn, event)) = self.events_rx.recv() => {
                    if watched.contains(&conn) {
                        return Some(Readiness::Read { conn, event });
                    }
                    tracing::trace!(%conn, ?event, "Discarding event from unwatched connection");
                }
            }
        }
    }

    /// Pop an already-queued event without waiting.
    pub fn try_next(&mut self, watched: &HashSet<ConnId>) -> Option<(ConnId, ConnEvent)> {
        while let Ok((conn, event)) = self.events_rx.try_recv() {
            if watched.contains(&conn) {
                return Some((conn, event));
            }
            tracing::trace!(%conn, ?event, "Discarding event from unwatched connection");
        }
        None
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) -> Connection {
        let id = ConnId::new(self.next_conn);
        self.next_conn += 1;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let tx = self.events_tx.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = match reader.next().await {
                    Some(Ok(frame)) => ConnEvent::Frame(frame),
                    // Reset, or EOF in the middle of a frame: the peer is gone.
                    Some(Err(e)) if e.is_io() => {
                        tracing::debug!(conn = %id, error = %e, "Connection error");
                        ConnEvent::Closed
                    }
                    Some(Err(e)) => ConnEvent::Malformed(e),
                    None => ConnEvent::Closed,
                };
                let last = !matches!(event, ConnEvent::Frame(_));
                if tx.send((id, event)).is_err() || last {
                    break;
                }
            }
            tracing::trace!(conn = %id, "Reader task exiting");
        });

        tracing::debug!(conn = %id, %peer, "Accepted connection");
        Connection {
            id,
            peer,
            writer: FramedWrite::new(write_half, FrameCodec::new()),
            reader: task,
        }
    }
}
