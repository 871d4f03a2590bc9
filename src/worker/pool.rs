//! Fixed-size pool of sandbox slots.
//!
//! A slot is always in exactly one place: the free FIFO, the hands of one
//! running execution, or in flight to one waiting reservation. Releasing a
//! slot hands it straight to the oldest live waiter, so a waiter can never be
//! overtaken by a caller that arrived later.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::{Result, SandboxError};
use crate::worker::isolation::Isolation;

/// Load snapshot reported to the scheduler. Advisory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub available: u32,
    pub waiting: u32,
    pub processing: u32,
    pub total: u32,
}

impl PoolStatus {
    /// Field-wise sum, used for fleet-wide aggregation. Saturates, since the
    /// counts come from workers.
    pub fn merge(self, other: PoolStatus) -> PoolStatus {
        PoolStatus {
            available: self.available.saturating_add(other.available),
            waiting: self.waiting.saturating_add(other.waiting),
            processing: self.processing.saturating_add(other.processing),
            total: self.total.saturating_add(other.total),
        }
    }
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<u32>,
    waiters: VecDeque<oneshot::Sender<u32>>,
}

pub struct SlotPool {
    state: Mutex<PoolState>,
    total: u32,
    isolation: Arc<dyn Isolation>,
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("total", &self.total)
            .field("status", &self.status())
            .finish()
    }
}

impl SlotPool {
    /// Initialise every slot through the isolation backend and build the pool.
    ///
    /// Any slot failing to initialise aborts provisioning; a node without its
    /// full slot set must not start.
    pub async fn provision(capacity: usize, isolation: Arc<dyn Isolation>) -> Result<Arc<Self>> {
        let total = u32::try_from(capacity)
            .map_err(|_| SandboxError::Internal(format!("capacity {} too large", capacity)))?;
        if total == 0 {
            return Err(SandboxError::Provision {
                slot: 0,
                reason: "capacity must be at least 1".to_string(),
            });
        }

        for slot in 0..total {
            isolation.init(slot).await?;
            tracing::debug!(slot, "Slot initialised");
        }
        tracing::info!(capacity = total, "Slot pool provisioned");

        Ok(Arc::new(Self {
            state: Mutex::new(PoolState {
                free: (0..total).collect(),
                waiters: VecDeque::new(),
            }),
            total,
            isolation,
        }))
    }

    pub fn isolation(&self) -> &Arc<dyn Isolation> {
        &self.isolation
    }

    /// Take a slot, waiting in FIFO order if none is free.
    ///
    /// Never fails and has no timeout. Dropping the future before it resolves
    /// gives back any slot that was already handed to it.
    pub async fn reserve_slot(&self) -> u32 {
        loop {
            let rx = {
                let mut state = self.state.lock();
                if let Some(slot) = state.free.pop_front() {
                    return slot;
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            let mut pending = PendingReservation { pool: self, rx };
            if let Ok(slot) = (&mut pending.rx).await {
                return slot;
            }
        }
    }

    /// Like [`reserve_slot`](Self::reserve_slot), but the slot is released
    /// when the returned guard is dropped.
    pub async fn reserve(self: &Arc<Self>) -> SlotGuard {
        let slot = self.reserve_slot().await;
        SlotGuard {
            pool: Arc::clone(self),
            slot,
        }
    }

    /// Return a slot. The oldest live waiter receives it directly; only when
    /// nobody is waiting does it go back on the free FIFO.
    pub fn release(&self, slot: u32) {
        debug_assert!(slot < self.total, "slot {} out of range", slot);

        let mut state = self.state.lock();
        debug_assert!(!state.free.contains(&slot), "slot {} released twice", slot);

        let mut slot = slot;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(slot) {
                Ok(()) => return,
                // Waiter gave up; try the next one.
                Err(returned) => slot = returned,
            }
        }
        state.free.push_back(slot);
    }

    pub fn available(&self) -> u32 {
        self.state.lock().free.len() as u32
    }

    /// Reservations currently parked. Abandoned waiters are not counted.
    pub fn waiting(&self) -> u32 {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.is_closed())
            .count() as u32
    }

    pub fn processing(&self) -> u32 {
        self.total - self.available()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let available = state.free.len() as u32;
        PoolStatus {
            available,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count() as u32,
            processing: self.total - available,
            total: self.total,
        }
    }

    /// Slot ids currently on the free FIFO, front first.
    pub fn free_slots(&self) -> Vec<u32> {
        self.state.lock().free.iter().copied().collect()
    }

    /// Drain the free FIFO and release each slot's isolation state.
    ///
    /// Slots still held by running executions are left alone. Returns the
    /// number of slots cleaned.
    pub async fn cleanup(&self) -> usize {
        let drained: Vec<u32> = self.state.lock().free.drain(..).collect();
        let held = self.total as usize - drained.len();
        if held > 0 {
            tracing::warn!(held, "Cleaning up pool with slots still in use");
        }

        for &slot in &drained {
            if let Err(e) = self.isolation.cleanup(slot).await {
                tracing::error!(slot, error = %e, "Slot cleanup failed");
            }
        }
        tracing::info!(cleaned = drained.len(), "Slot pool cleaned up");
        drained.len()
    }
}

/// A parked reservation. If it is dropped after a slot was sent to it but
/// before that slot was taken, the slot goes back through `release`.
struct PendingReservation<'a> {
    pool: &'a SlotPool,
    rx: oneshot::Receiver<u32>,
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(slot) = self.rx.try_recv() {
            self.pool.release(slot);
        }
    }
}

/// Exclusive use of one slot until dropped.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    slot: u32,
}

impl SlotGuard {
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}
