//! Worker processes: launch command, spawn strategy, and reaping.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

/// Program and leading arguments used to start every worker.
///
/// The coordinator's port is appended as the final positional argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full command line for a worker told to connect to `port`.
    pub fn command_line(&self, port: u16) -> Vec<String> {
        let mut line = Vec::with_capacity(self.args.len() + 2);
        line.push(self.program.clone());
        line.extend(self.args.iter().cloned());
        line.push(port.to_string());
        line
    }
}

impl fmt::Display for LaunchTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker {index} ({program}): {source}")]
    Spawn {
        index: usize,
        program: String,
        source: std::io::Error,
    },
    #[error("worker {index} has no process id (exited immediately?)")]
    NoPid { index: usize },
    #[error("spawn failed: {0}")]
    Other(String),
}

/// A launched worker as reported by a [`WorkerSpawner`].
#[derive(Debug)]
pub struct SpawnedWorker {
    pub pid: u32,
    /// OS child to reap at shutdown. `None` for workers whose lifecycle is
    /// managed elsewhere.
    pub child: Option<Child>,
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        index: usize,
        launch: &LaunchTemplate,
        port: u16,
    ) -> Result<SpawnedWorker, SpawnError>;
}

/// Spawns each worker as an OS process running the launch template.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(
        &self,
        index: usize,
        launch: &LaunchTemplate,
        port: u16,
    ) -> Result<SpawnedWorker, SpawnError> {
        let child = Command::new(&launch.program)
            .args(&launch.args)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Spawn {
                index,
                program: launch.program.clone(),
                source,
            })?;
        let pid = child.id().ok_or(SpawnError::NoPid { index })?;
        Ok(SpawnedWorker {
            pid,
            child: Some(child),
        })
    }
}

/// One spawned worker, owned by the orchestrator.
#[derive(Debug)]
pub struct ProcessHandle {
    index: usize,
    launch_command: Vec<String>,
    port: u16,
    pid: u32,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn new(index: usize, launch: &LaunchTemplate, port: u16, spawned: SpawnedWorker) -> Self {
        Self {
            index,
            launch_command: launch.command_line(port),
            port,
            pid: spawned.pid,
            child: spawned.child,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn launch_command(&self) -> &[String] {
        &self.launch_command
    }

    /// Coordinator port the worker was told to connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the OS process has already exited. Workers without a child
    /// handle are reported as running.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(_))) => true,
            Some(Ok(None)) | None => false,
            Some(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "Failed to poll worker");
                false
            }
        }
    }

    /// Stop and reap the process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Processes that already exited are reaped without signalling.
    pub async fn reap(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid = self.pid, %status, "Worker already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "Failed to poll worker"),
        }

        terminate(self.pid);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = self.pid, %status, "Worker exited");
                return;
            }
            Ok(Err(e)) => tracing::warn!(pid = self.pid, error = %e, "Failed to wait for worker"),
            Err(_) => tracing::warn!(pid = self.pid, ?grace, "Worker ignored SIGTERM, killing"),
        }

        if let Err(e) = child.kill().await {
            tracing::warn!(pid = self.pid, error = %e, "Failed to kill worker");
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}
