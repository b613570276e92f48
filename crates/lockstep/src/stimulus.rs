//! Stimulus schedules: what the driver sends on each cycle.
//!
//! A schedule is a list of edges `(cycle, field, value)`. A field holds the
//! value of its most recent edge until the next one, like a testbench signal.

use crate::bridge::protocol::{CLOCK_FIELD, ENABLE_FIELD, ON_FIELD, RESET_FIELD};
use crate::bridge::{Scalar, StateFrame};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub cycle: u64,
    pub field: String,
    pub value: Scalar,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stimulus {
    /// Sorted by cycle; edges on the same cycle keep insertion order.
    edges: Vec<Edge>,
}

impl Stimulus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter testbench: reset pulse over cycles 4..8, enable over
    /// 12..50, power off at 52.
    pub fn reference() -> Self {
        Self::new()
            .edge(0, RESET_FIELD, false)
            .edge(0, ENABLE_FIELD, false)
            .edge(0, ON_FIELD, true)
            .edge(4, RESET_FIELD, true)
            .edge(8, RESET_FIELD, false)
            .edge(12, ENABLE_FIELD, true)
            .edge(50, ENABLE_FIELD, false)
            .edge(52, ON_FIELD, false)
    }

    pub fn edge(mut self, cycle: u64, field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        let at = self.edges.partition_point(|e| e.cycle <= cycle);
        self.edges.insert(
            at,
            Edge {
                cycle,
                field: field.into(),
                value: value.into(),
            },
        );
        self
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outbound frame for `cycle`: `clock` plus every field driven so far.
    pub fn frame_at(&self, cycle: u64) -> StateFrame {
        let clock = i64::try_from(cycle).unwrap_or(i64::MAX);
        let mut frame = StateFrame::new().with(CLOCK_FIELD, clock);
        for edge in self.edges.iter().take_while(|e| e.cycle <= cycle) {
            frame.insert(edge.field.clone(), edge.value.clone());
        }
        frame
    }

    /// First cycle whose frame tells workers to power off.
    pub fn power_off_cycle(&self) -> Option<u64> {
        self.edges
            .iter()
            .find(|e| e.field == ON_FIELD && e.value == Scalar::Bool(false))
            .map(|e| e.cycle)
    }

    /// Frames for cycles `0..cycles`.
    pub fn frames(&self, cycles: u64) -> impl Iterator<Item = StateFrame> + '_ {
        (0..cycles).map(|cycle| self.frame_at(cycle))
    }
}
