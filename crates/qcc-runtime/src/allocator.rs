//! Resource allocator: one ledger of committed totals, atomic batch reservation.

use std::collections::HashMap;

use parking_lot::Mutex;
use qcc_core::{Error, ResourceBudget, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrantId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceGrant {
    pub id: GrantId,
    pub budget: ResourceBudget,
}

#[derive(Default)]
struct Ledger {
    committed: ResourceBudget,
    grants: HashMap<GrantId, ResourceBudget>,
    next_id: u64,
}

/// Enforces that the sum of outstanding grants never exceeds capacity.
///
/// The lock is held only for the check-and-commit (or release) itself,
/// never across an await.
pub struct ResourceAllocator {
    capacity: ResourceBudget,
    ledger: Mutex<Ledger>,
}

impl ResourceAllocator {
    pub fn new(capacity: ResourceBudget) -> Self {
        Self {
            capacity,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Commit every budget in `requests`, or none of them.
    pub fn reserve(&self, requests: &[ResourceBudget]) -> Result<Vec<ResourceGrant>> {
        let requested: ResourceBudget = requests.iter().sum();
        let mut ledger = self.ledger.lock();
        let available = self.capacity.saturating_sub(ledger.committed);

        if !requested.fits_within(&available) {
            warn!("Reservation rejected: requested {}, available {}", requested, available);
            return Err(Error::ResourceExhausted {
                requested,
                available,
            });
        }

        ledger.committed = ledger.committed.saturating_add(requested);
        let grants = requests
            .iter()
            .map(|&budget| {
                let id = GrantId(ledger.next_id);
                ledger.next_id += 1;
                ledger.grants.insert(id, budget);
                ResourceGrant { id, budget }
            })
            .collect();
        debug!("Reserved {} ({} grants), committed {}", requested, requests.len(), ledger.committed);
        Ok(grants)
    }

    /// Return grants to the pool. Unknown or already released ids are ignored.
    pub fn release(&self, ids: &[GrantId]) -> ResourceBudget {
        let mut ledger = self.ledger.lock();
        let mut freed = ResourceBudget::ZERO;
        for id in ids {
            if let Some(budget) = ledger.grants.remove(id) {
                freed = freed.saturating_add(budget);
            }
        }
        ledger.committed = ledger.committed.saturating_sub(freed);
        if !freed.is_zero() {
            debug!("Released {}, committed {}", freed, ledger.committed);
        }
        freed
    }

    pub fn capacity(&self) -> ResourceBudget {
        self.capacity
    }

    pub fn committed(&self) -> ResourceBudget {
        self.ledger.lock().committed
    }

    pub fn available(&self) -> ResourceBudget {
        self.capacity.saturating_sub(self.committed())
    }

    pub fn outstanding_grants(&self) -> usize {
        self.ledger.lock().grants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(mb: u64) -> ResourceBudget {
        ResourceBudget::new(mb, 0, 0, 0)
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let alloc = ResourceAllocator::new(mem(50));
        let err = alloc.reserve(&[mem(40), mem(40)]).unwrap_err();
        match err {
            Error::ResourceExhausted { requested, available } => {
                assert_eq!(requested.memory_mb, 80);
                assert_eq!(available.memory_mb, 50);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(alloc.committed(), ResourceBudget::ZERO);
        assert_eq!(alloc.outstanding_grants(), 0);
    }

    #[test]
    fn test_reserve_and_release_once() {
        let alloc = ResourceAllocator::new(ResourceBudget::new(100, 100, 100, 100));
        let grants = alloc
            .reserve(&[ResourceBudget::new(30, 10, 0, 0), ResourceBudget::new(20, 10, 5, 1)])
            .unwrap();
        assert_eq!(grants.len(), 2);
        assert_eq!(alloc.committed(), ResourceBudget::new(50, 20, 5, 1));

        let ids: Vec<GrantId> = grants.iter().map(|g| g.id).collect();
        assert_eq!(alloc.release(&ids), ResourceBudget::new(50, 20, 5, 1));
        assert_eq!(alloc.release(&ids), ResourceBudget::ZERO);
        assert_eq!(alloc.committed(), ResourceBudget::ZERO);
    }

    #[test]
    fn test_any_dimension_can_exhaust() {
        let alloc = ResourceAllocator::new(ResourceBudget::new(1000, 100, 1000, 1000));
        assert!(alloc.reserve(&[ResourceBudget::new(10, 60, 0, 0)]).is_ok());
        assert!(alloc.reserve(&[ResourceBudget::new(10, 60, 0, 0)]).is_err());
        assert_eq!(alloc.available().cpu_percent, 40);
    }

    #[test]
    fn test_concurrent_reservations_never_overcommit() {
        let alloc = std::sync::Arc::new(ResourceAllocator::new(mem(100)));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || alloc.reserve(&[mem(15)]).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 6);
        assert_eq!(alloc.committed().memory_mb, 90);
        assert_eq!(alloc.outstanding_grants(), 6);
    }
}
