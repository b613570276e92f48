//! Field contract between coordinator and worker.
//!
//! Two kinds of frame share each connection:
//! - **Handshake** (worker -> coordinator, once): `{"pid": <integer>}`
//! - **Tick** (both directions, once per cycle): outbound stimulus such as
//!   `clock`, `reset`, `enable`, `on`; inbound frame is opaque to the core.

use super::frame::StateFrame;

/// Handshake field carrying the worker's OS process id.
pub const PID_FIELD: &str = "pid";

/// Cycle count sent on every tick.
pub const CLOCK_FIELD: &str = "clock";
pub const RESET_FIELD: &str = "reset";
pub const ENABLE_FIELD: &str = "enable";
/// Liveness flag. A worker answers a frame with `on == false` and then exits.
pub const ON_FIELD: &str = "on";

/// Identity declared by a worker in its first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub pid: u32,
}

impl Handshake {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn to_frame(self) -> StateFrame {
        StateFrame::new().with(PID_FIELD, self.pid)
    }

    /// Extract the identity from a handshake frame. Extra fields are ignored.
    pub fn from_frame(frame: &StateFrame) -> Result<Self, String> {
        let raw = match frame.get(PID_FIELD) {
            None => return Err(format!("handshake frame has no `{PID_FIELD}` field")),
            Some(value) => value
                .as_int()
                .ok_or_else(|| format!("`{PID_FIELD}` must be an integer, got {value}"))?,
        };
        u32::try_from(raw)
            .map(Self::new)
            .map_err(|_| format!("`{PID_FIELD}` {raw} is not a valid process id"))
    }
}

/// Whether a frame tells the worker to stop after answering it.
pub fn is_power_off(frame: &StateFrame) -> bool {
    frame.get_bool(ON_FIELD) == Some(false)
}
