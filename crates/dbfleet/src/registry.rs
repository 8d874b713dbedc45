//! Instance registry, port allocator and waiting queue.
//!
//! All three live in one state object behind a single mutex, so capacity
//! checks, port allocation, record insertion/removal, queue operations and
//! worker-side status mutation are each atomic with respect to every
//! concurrent reader. "Port available" is defined as "not present as a key
//! in the registry" — there is no separate free list.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::instance::{InstanceRecord, InstanceStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Every port in the configured range is held by a live record.
    #[error("no free port in {base}..={max} ({registered} instances registered)")]
    PortsExhausted { base: u16, max: u16, registered: usize },

    /// Invariant violation: the allocator handed out a port that is
    /// already registered. Unreachable while allocation and insertion
    /// share the registry lock.
    #[error("port {0} is already registered")]
    DuplicatePort(u16),
}

/// A request waiting for capacity. Only the input needed to retry
/// admission later; no port is assigned until admission.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub root_password: String,
}

/// The single exclusion domain: registry map + FIFO waiting queue.
///
/// Callers hold the surrounding mutex for the duration of every compound
/// operation (check capacity, allocate, insert, dispatch).
#[derive(Debug, Default)]
pub struct FleetState {
    instances: BTreeMap<u16, InstanceRecord>,
    waiting: VecDeque<QueuedRequest>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.instances.len()
    }

    /// Lowest-available-first scan from `base`, bounded by `max`.
    pub fn allocate_port(&self, base: u16, max: u16) -> Result<u16, RegistryError> {
        (base..=max)
            .find(|port| !self.instances.contains_key(port))
            .ok_or(RegistryError::PortsExhausted {
                base,
                max,
                registered: self.instances.len(),
            })
    }

    pub fn insert(&mut self, record: InstanceRecord) -> Result<(), RegistryError> {
        if self.instances.contains_key(&record.port) {
            tracing::error!(port = record.port, "duplicate registration attempt");
            return Err(RegistryError::DuplicatePort(record.port));
        }
        self.instances.insert(record.port, record);
        Ok(())
    }

    pub fn get(&self, port: u16) -> Option<&InstanceRecord> {
        self.instances.get(&port)
    }

    pub fn remove(&mut self, port: u16) -> Option<InstanceRecord> {
        self.instances.remove(&port)
    }

    /// Starting → Running. Ignored if the record is gone (stopped while
    /// provisioning) or already left Starting.
    pub fn mark_running(&mut self, port: u16) -> bool {
        self.transition(port, |rec| rec.set_running())
    }

    /// Starting → Failed. Same guard as [`mark_running`](Self::mark_running).
    pub fn mark_failed(&mut self, port: u16, error: String) -> bool {
        self.transition(port, |rec| rec.set_failed(error))
    }

    fn transition(&mut self, port: u16, apply: impl FnOnce(&mut InstanceRecord)) -> bool {
        match self.instances.get_mut(&port) {
            Some(rec) if rec.status == InstanceStatus::Starting => {
                apply(rec);
                true
            }
            Some(rec) => {
                tracing::debug!(port, status = rec.status.as_str(), "ignoring stale provisioning outcome");
                false
            }
            None => {
                tracing::debug!(port, "provisioning outcome for a removed record");
                false
            }
        }
    }

    /// Snapshot of all records, ordered by port.
    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        self.instances.values().cloned().collect()
    }

    /// Remove and return every record (for shutdown cleanup).
    pub fn drain_all(&mut self) -> Vec<InstanceRecord> {
        let records = self.instances.values().cloned().collect();
        self.instances.clear();
        records
    }

    pub fn push_waiting(&mut self, request: QueuedRequest) {
        self.waiting.push_back(request);
    }

    pub fn pop_waiting(&mut self) -> Option<QueuedRequest> {
        self.waiting.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.waiting.len()
    }
}

/// Lock the fleet state, recovering from poison.
///
/// A panic while holding the lock leaves bookkeeping in whatever state the
/// panicking thread reached; continuing with that state beats taking the
/// whole admission path down.
pub(crate) fn lock_state(state: &Mutex<FleetState>) -> MutexGuard<'_, FleetState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("fleet state mutex poisoned - continuing with recovered state");
            poisoned.into_inner()
        }
    }
}
