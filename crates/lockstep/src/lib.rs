//! lockstep: lock-step co-simulation coordinator.
//!
//! Spawns N worker simulator processes, binds each to a slot through a TCP
//! handshake, then drives them one tick at a time: every worker receives the
//! same outbound frame and answers with its own state frame.

pub mod bridge;
pub mod counter;
pub mod event_loop;
pub mod listener;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod stimulus;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::{Scalar, StateFrame};
pub use event_loop::ShutdownHandle;
pub use orchestrator::{
    LoopEvent, Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorState,
    SlotFailure, TickResult,
};
pub use process::{CommandSpawner, LaunchTemplate, SpawnError, SpawnedWorker, WorkerSpawner};
pub use registry::{ConnId, ConnectionRegistry};
pub use stimulus::Stimulus;
pub use worker::{TickHandler, WorkerConfig, WorkerError, run_worker};
