//! 4-bit up-counter model, the reference worker.

use crate::bridge::protocol::{ENABLE_FIELD, RESET_FIELD};
use crate::bridge::StateFrame;
use crate::worker::{TickHandler, WorkerError};

pub const OUTPUT_FIELD: &str = "counter_out";

const WIDTH_MASK: u8 = 0x0f;

/// Synchronous counter: `reset` clears it, otherwise `enable` counts up by
/// one per tick, wrapping at 16. Both inputs default to low when absent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    value: u8,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    pub fn clock(&mut self, reset: bool, enable: bool) -> u8 {
        if reset {
            self.value = 0;
        } else if enable {
            self.value = (self.value + 1) & WIDTH_MASK;
        }
        self.value
    }
}

#[async_trait::async_trait]
impl TickHandler for Counter {
    async fn on_tick(&mut self, frame: &StateFrame) -> Result<StateFrame, WorkerError> {
        let reset = flag(frame, RESET_FIELD)?;
        let enable = flag(frame, ENABLE_FIELD)?;
        let value = self.clock(reset, enable);
        Ok(StateFrame::new().with(OUTPUT_FIELD, value))
    }
}

fn flag(frame: &StateFrame, field: &str) -> Result<bool, WorkerError> {
    match frame.get(field) {
        None => Ok(false),
        Some(scalar) => scalar.as_bool().ok_or_else(|| {
            WorkerError::handler(format!("`{field}` must be a boolean, got {scalar}"))
        }),
    }
}
