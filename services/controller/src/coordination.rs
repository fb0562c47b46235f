//! Coordination store shared by control loops.
//!
//! Two loops aimed at the same target must not both dispatch in the same tick.
//! Each target gets one [`CoordinationCell`]; a loop claims the cell with the
//! current tick before dispatching, and a loop that finds the tick already
//! claimed skips the cycle.
//!
//! The contract is weak on purpose: a claim does not lock anything, and a loop
//! that claims and then fails to dispatch does not release. Duplicate dispatch
//! across different ticks is tolerated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use siphon_id::TargetId;
use tokio::sync::RwLock;

/// One atomic timestamp slot. Empty until first set.
#[derive(Debug, Default)]
pub struct CoordinationCell {
    /// Stored as `tick + 1` so zero means empty.
    slot: AtomicU64,
}

impl CoordinationCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last claimed tick, if any.
    pub fn peek(&self) -> Option<u64> {
        self.slot.load(Ordering::Acquire).checked_sub(1)
    }

    /// Overwrite unconditionally.
    pub fn set(&self, tick: u64) {
        self.slot.store(tick.saturating_add(1), Ordering::Release);
    }

    /// Claim `tick` for the caller.
    ///
    /// Fails if `tick` is already claimed, or if another loop wrote the cell
    /// between the read and the exchange.
    pub fn try_claim(&self, tick: u64) -> bool {
        let wanted = tick.saturating_add(1);
        let current = self.slot.load(Ordering::Acquire);
        if current == wanted {
            return false;
        }
        self.slot
            .compare_exchange(current, wanted, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Per-target cells, created on first use.
#[derive(Debug, Default)]
pub struct CoordinationStore {
    cells: RwLock<HashMap<TargetId, Arc<CoordinationCell>>>,
}

impl CoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cell for `target`.
    pub async fn cell(&self, target: &TargetId) -> Arc<CoordinationCell> {
        if let Some(cell) = self.cells.read().await.get(target) {
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write().await;
        Arc::clone(cells.entry(target.clone()).or_default())
    }

    pub async fn len(&self) -> usize {
        self.cells.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cells.read().await.is_empty()
    }
}
