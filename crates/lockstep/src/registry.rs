//! Connection registry: fixed table of worker slots.
//!
//! A slot index is the logical role the driver addresses ("worker 2"). Which
//! connection lands in which slot is decided by the identity a worker declares
//! in its handshake, never by the order connections arrive in.

use std::collections::HashSet;
use std::fmt;

/// Handle for one accepted connection.
///
/// Monotonic per event loop, never reused, so a stale id can never alias a
/// newer connection the way a recycled OS descriptor could.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One position in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    index: usize,
    conn: Option<ConnId>,
    port: u16,
    pid: u32,
}

impl WorkerSlot {
    fn unbound(index: usize) -> Self {
        Self {
            index,
            conn: None,
            port: 0,
            pid: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Peer port of the bound connection (0 when never bound).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Process id declared at handshake (0 when never bound).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_bound(&self) -> bool {
        self.conn.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("slot {index} is already bound")]
    SlotAlreadyBound { index: usize },

    #[error("slot {index} out of range (capacity {capacity})")]
    IndexOutOfRange { index: usize, capacity: usize },

    #[error("{conn} is already bound to slot {index}")]
    ConnectionInUse { conn: ConnId, index: usize },

    #[error("pid {pid} is already bound to slot {index}")]
    PidInUse { pid: u32, index: usize },
}

/// Fixed-capacity table of [`WorkerSlot`]s.
#[derive(Debug)]
pub struct ConnectionRegistry {
    slots: Vec<WorkerSlot>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(WorkerSlot::unbound).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bind a handshaken connection to `index`.
    pub fn bind(
        &mut self,
        index: usize,
        conn: ConnId,
        port: u16,
        pid: u32,
    ) -> Result<(), RegistryError> {
        let capacity = self.capacity();
        let slot = self
            .slots
            .get(index)
            .ok_or(RegistryError::IndexOutOfRange { index, capacity })?;
        if slot.is_bound() {
            return Err(RegistryError::SlotAlreadyBound { index });
        }
        if let Some(other) = self.index_of(conn) {
            return Err(RegistryError::ConnectionInUse { conn, index: other });
        }
        if let Some(other) = self.slots.iter().find(|s| s.is_bound() && s.pid == pid) {
            return Err(RegistryError::PidInUse {
                pid,
                index: other.index,
            });
        }

        self.slots[index] = WorkerSlot {
            index,
            conn: Some(conn),
            port,
            pid,
        };
        tracing::debug!(slot = index, %conn, port, pid, "Slot bound");
        Ok(())
    }

    /// Mark `index` unbound and hand back its connection for reclaiming.
    ///
    /// Idempotent: unbinding an unbound (or out of range) slot returns `None`.
    pub fn unbind(&mut self, index: usize) -> Option<ConnId> {
        let slot = self.slots.get_mut(index)?;
        let conn = slot.conn.take()?;
        tracing::debug!(slot = index, %conn, pid = slot.pid, "Slot unbound");
        Some(conn)
    }

    pub fn all_bound(&self) -> bool {
        self.slots.iter().all(WorkerSlot::is_bound)
    }

    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_bound()).count()
    }

    /// Connections of currently bound slots.
    pub fn descriptors_snapshot(&self) -> HashSet<ConnId> {
        self.slots.iter().filter_map(|s| s.conn).collect()
    }

    pub fn slot(&self, index: usize) -> Option<&WorkerSlot> {
        self.slots.get(index)
    }

    pub fn index_of(&self, conn: ConnId) -> Option<usize> {
        self.slots
            .iter()
            .find(|s| s.conn == Some(conn))
            .map(|s| s.index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter()
    }

    pub fn bound(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter().filter(|s| s.is_bound())
    }
}
