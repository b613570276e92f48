//! Worker runtime - runs inside each worker process.
//!
//! This module provides the child side of the lock-step protocol. The
//! coordinator side (spawning, handshake, tick fan-out) is in orchestrator.rs.
//!
//! Protocol, per connection:
//! 1. Connect to `host:port` and send `{"pid": <pid>}`
//! 2. For every frame received, call the handler and write its reply
//! 3. Stop when the coordinator closes, or after replying to `on == false`

use std::io;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::protocol::is_power_off;
use crate::bridge::{FrameCodec, FrameError, Handshake, StateFrame};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("failed to connect to coordinator at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("tick handler failed: {0}")]
    Handler(String),
}

impl WorkerError {
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// Identity sent in the handshake. Defaults to the OS process id.
    pub pid: Option<u32>,
}

impl WorkerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            pid: None,
        }
    }

    /// Build from a command line whose last positional argument is the port.
    ///
    /// `args` excludes the program name.
    pub fn from_args<I, S>(args: I) -> Result<Self, WorkerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let last = args
            .into_iter()
            .last()
            .ok_or_else(|| WorkerError::Usage("<program> [args...] <port>".to_string()))?;
        let last = last.as_ref();
        let port = last
            .parse::<u16>()
            .map_err(|_| WorkerError::Usage(format!("invalid port: {last}")))?;
        Ok(Self::new(port))
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid.unwrap_or_else(std::process::id)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The simulator model behind a worker.
///
/// Called once per coordinator tick with the shared outbound frame; the
/// returned frame is sent back as this worker's state for the tick.
#[async_trait::async_trait]
pub trait TickHandler: Send + 'static {
    async fn on_tick(&mut self, frame: &StateFrame) -> Result<StateFrame, WorkerError>;
}

/// Why [`run_worker`] returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Replied to a frame with `on == false`.
    PowerOff,
    /// The coordinator closed the connection.
    CoordinatorClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub ticks: u64,
    pub reason: ExitReason,
}

/// Connect, handshake, and serve ticks until the exchange ends.
///
/// A handler error drops the connection (the coordinator sees the slot
/// disconnect) and is returned.
pub async fn run_worker<H: TickHandler>(
    mut handler: H,
    config: WorkerConfig,
) -> Result<WorkerExit, WorkerError> {
    let addr = config.addr();
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| WorkerError::Connect {
            addr: addr.clone(),
            source,
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::new());
    let mut writer = FramedWrite::new(write_half, FrameCodec::new());

    let pid = config.pid();
    writer.send(Handshake::new(pid).to_frame()).await?;
    tracing::info!(pid, %addr, "Connected to coordinator");

    let mut ticks = 0u64;
    loop {
        let frame = match reader.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) if e.is_io() => {
                tracing::debug!(pid, error = %e, "Coordinator connection lost");
                return Ok(closed(ticks));
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(closed(ticks)),
        };

        let reply = handler.on_tick(&frame).await?;
        writer.send(&reply).await?;
        ticks += 1;
        tracing::trace!(pid, ticks, %frame, %reply, "Tick");

        if is_power_off(&frame) {
            tracing::info!(pid, ticks, "Power off");
            return Ok(WorkerExit {
                ticks,
                reason: ExitReason::PowerOff,
            });
        }
    }
}

fn closed(ticks: u64) -> WorkerExit {
    tracing::info!(ticks, "Coordinator closed connection");
    WorkerExit {
        ticks,
        reason: ExitReason::CoordinatorClosed,
    }
}
