//! Worker capacity held for dispatched jobs that have not fired yet.
//!
//! A job commits capacity only when it launches, which can be seconds after
//! its loop packed it onto a worker. Every loop of a controller shares one
//! [`ReservationLedger`] and counts the holds of all loops as committed before
//! allocating, so two batches never pack against the same free capacity.
//!
//! Holds are taken all or nothing through [`ReservationLedger::try_reserve`]
//! and released when the returned [`Hold`] is dropped. A job drops its hold
//! right after launching, or when it aborts or is cancelled.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use siphon_batch::{SnapshotError, WorkerPool, WorkerSnapshot};
use siphon_id::{RunId, WorkerId};
use tracing::debug;

/// Capacity slack tolerated when re-checking a reservation.
const CAPACITY_EPSILON: f64 = 1e-9;

/// Capacity claimed by one job on one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub run_id: RunId,
    pub worker: WorkerId,
    pub amount: f64,
}

/// Holds outstanding when a loop started its cycle.
///
/// Taken before the worker snapshot is read. A job that fires between the two
/// reads is then counted as held even though the snapshot missed its commit.
#[derive(Debug, Clone, Default)]
pub struct LedgerView {
    held: BTreeMap<RunId, Reservation>,
}

impl LedgerView {
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Shared ledger of outstanding holds.
#[derive(Debug, Default)]
pub struct ReservationLedger {
    held: Mutex<BTreeMap<RunId, Reservation>>,
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holds, to be taken before reading the worker pool.
    pub fn view(&self) -> LedgerView {
        LedgerView {
            held: self.held().clone(),
        }
    }

    /// `pool` with every hold in `seen` or in the ledger counted as committed.
    pub fn available(&self, pool: &WorkerPool, seen: &LedgerView) -> Result<WorkerPool, SnapshotError> {
        let held = self.held();
        let workers = pool
            .workers()
            .iter()
            .map(|w| {
                let reserved = reserved_on(w.id(), &held, seen);
                let committed = (w.committed() + reserved).min(w.total());
                WorkerSnapshot::new(w.id().clone(), w.total(), committed, w.cores())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WorkerPool::new(workers))
    }

    /// Hold every claim, or none of them.
    ///
    /// Claims are re-checked against `pool` under the ledger lock, counting the
    /// holds in `seen` and every hold taken since. Returns `None` if any worker
    /// would be over-committed.
    pub fn try_reserve(
        self: &Arc<Self>,
        pool: &WorkerPool,
        seen: &LedgerView,
        claims: Vec<Reservation>,
    ) -> Option<Vec<Hold>> {
        let mut held = self.held();

        for worker in pool.workers() {
            let claimed: f64 = claims
                .iter()
                .filter(|c| &c.worker == worker.id())
                .map(|c| c.amount)
                .sum();
            if claimed == 0.0 {
                continue;
            }
            let reserved = reserved_on(worker.id(), &held, seen);
            if worker.committed() + reserved + claimed > worker.total() + CAPACITY_EPSILON {
                debug!(
                    worker_id = %worker.id(),
                    free = worker.free(),
                    reserved,
                    claimed,
                    "Reservation rejected"
                );
                return None;
            }
        }
        if claims.iter().any(|c| pool.workers().iter().all(|w| w.id() != &c.worker)) {
            return None;
        }

        let holds = claims
            .into_iter()
            .map(|claim| {
                let run_id = claim.run_id;
                held.insert(run_id, claim);
                Hold {
                    ledger: Arc::clone(self),
                    run_id,
                }
            })
            .collect();
        Some(holds)
    }

    /// Drop the hold for `run_id`, if any.
    pub fn release(&self, run_id: RunId) {
        self.held().remove(&run_id);
    }

    /// Capacity currently held on `worker`.
    pub fn outstanding(&self, worker: &WorkerId) -> f64 {
        self.held()
            .values()
            .filter(|r| &r.worker == worker)
            .map(|r| r.amount)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.held().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held().is_empty()
    }

    fn held(&self) -> MutexGuard<'_, BTreeMap<RunId, Reservation>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sum of the holds on `worker` present in either map, each counted once.
fn reserved_on(worker: &WorkerId, held: &BTreeMap<RunId, Reservation>, seen: &LedgerView) -> f64 {
    let current: f64 = held.values().filter(|r| &r.worker == worker).map(|r| r.amount).sum();
    let released: f64 = seen
        .held
        .iter()
        .filter(|(run_id, r)| &r.worker == worker && !held.contains_key(run_id))
        .map(|(_, r)| r.amount)
        .sum();
    current + released
}

/// One outstanding hold; released on drop.
#[derive(Debug)]
pub struct Hold {
    ledger: Arc<ReservationLedger>,
    run_id: RunId,
}

impl Hold {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.ledger.release(self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> WorkerId {
        WorkerId::parse("home").unwrap()
    }

    fn pool(total: f64, committed: f64) -> WorkerPool {
        WorkerPool::new(vec![WorkerSnapshot::new(home(), total, committed, 1).unwrap()])
    }

    fn claim(run: u64, amount: f64) -> Reservation {
        Reservation {
            run_id: RunId::new(run),
            worker: home(),
            amount,
        }
    }

    #[test]
    fn test_holds_count_as_committed() {
        let ledger = Arc::new(ReservationLedger::new());
        let pool = pool(100.0, 10.0);
        let seen = ledger.view();

        let holds = ledger.try_reserve(&pool, &seen, vec![claim(1, 30.0), claim(2, 20.0)]).unwrap();
        assert_eq!(holds.len(), 2);
        assert_eq!(ledger.outstanding(&home()), 50.0);

        let available = ledger.available(&pool, &ledger.view()).unwrap();
        assert_eq!(available.total_free(), 40.0);
    }

    #[test]
    fn test_rejects_all_claims_when_one_does_not_fit() {
        let ledger = Arc::new(ReservationLedger::new());
        let pool = pool(100.0, 0.0);
        let seen = ledger.view();

        let _first = ledger.try_reserve(&pool, &seen, vec![claim(1, 60.0)]).unwrap();
        assert!(ledger.try_reserve(&pool, &seen, vec![claim(2, 10.0), claim(3, 40.0)]).is_none());
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.outstanding(&home()), 60.0);
    }

    #[test]
    fn test_dropping_a_hold_releases_it() {
        let ledger = Arc::new(ReservationLedger::new());
        let pool = pool(100.0, 0.0);

        let holds = ledger.try_reserve(&pool, &ledger.view(), vec![claim(1, 70.0)]).unwrap();
        assert!(ledger.try_reserve(&pool, &ledger.view(), vec![claim(2, 70.0)]).is_none());

        drop(holds);
        assert!(ledger.is_empty());
        assert!(ledger.try_reserve(&pool, &ledger.view(), vec![claim(2, 70.0)]).is_some());
    }

    #[test]
    fn test_hold_released_after_view_still_counts() {
        let ledger = Arc::new(ReservationLedger::new());
        let stale_pool = pool(100.0, 0.0);

        let holds = ledger.try_reserve(&stale_pool, &ledger.view(), vec![claim(1, 70.0)]).unwrap();
        let seen = ledger.view();
        // The job fires: the hold goes, but the stale pool never saw its commit.
        drop(holds);

        assert_eq!(ledger.available(&stale_pool, &seen).unwrap().total_free(), 30.0);
        assert!(ledger.try_reserve(&stale_pool, &seen, vec![claim(2, 70.0)]).is_none());
    }

    #[test]
    fn test_unknown_worker_is_rejected() {
        let ledger = Arc::new(ReservationLedger::new());
        let claims = vec![Reservation {
            run_id: RunId::new(1),
            worker: WorkerId::parse("ghost").unwrap(),
            amount: 1.0,
        }];
        assert!(ledger.try_reserve(&pool(100.0, 0.0), &ledger.view(), claims).is_none());
    }

    #[test]
    fn test_available_never_exceeds_total() {
        let ledger = Arc::new(ReservationLedger::new());
        let big = pool(100.0, 0.0);
        let _holds = ledger.try_reserve(&big, &ledger.view(), vec![claim(1, 90.0)]).unwrap();

        let shrunk = ledger.available(&pool(100.0, 50.0), &ledger.view()).unwrap();
        assert_eq!(shrunk.total_free(), 0.0);
    }
}
