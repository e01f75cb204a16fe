//! Single-writer leases per (task, tick)
//!
//! A lease has an owner and an expiry. A live lease held by another owner cannot
//! be taken; an expired one can, which is how a crashed worker's claim is
//! reclaimed. Every acquisition gets a fresh fencing token, so a worker that
//! lost its lease can detect it on the next renewal even if it was slow rather
//! than dead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::job::{TaskId, Tick};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub tick: Tick,
    pub owner: String,
    /// Fencing token; strictly increases across acquisitions
    pub token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Lease table shared by every worker of one orchestrator namespace
#[derive(Debug)]
pub struct LeaseTable {
    leases: DashMap<(TaskId, Tick), Lease>,
    next_token: AtomicU64,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self {
            leases: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim (task, tick) for `owner`. `None` if another owner holds a live lease.
    pub fn try_acquire(
        &self,
        task_id: &TaskId,
        tick: Tick,
        owner: &str,
        ttl: Duration,
    ) -> Option<Lease> {
        self.try_acquire_at(task_id, tick, owner, ttl, Utc::now())
    }

    pub fn try_acquire_at(
        &self,
        task_id: &TaskId,
        tick: Tick,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<Lease> {
        match self.leases.entry((task_id.clone(), tick)) {
            Entry::Occupied(mut entry) => {
                let held = entry.get();
                if held.owner != owner && !held.is_expired_at(now) {
                    debug!(
                        task_id = %task_id,
                        tick = tick.0,
                        holder = %held.owner,
                        "Lease held by another worker"
                    );
                    return None;
                }
                if held.owner != owner {
                    warn!(
                        task_id = %task_id,
                        tick = tick.0,
                        previous_owner = %held.owner,
                        new_owner = owner,
                        "Reclaiming expired lease"
                    );
                }
                let lease = self.new_lease(task_id, tick, owner, ttl, now);
                entry.insert(lease.clone());
                Some(lease)
            }
            Entry::Vacant(entry) => {
                let lease = self.new_lease(task_id, tick, owner, ttl, now);
                entry.insert(lease.clone());
                Some(lease)
            }
        }
    }

    /// Extend a lease. Fails with `LeaseLost` if it expired or was taken over.
    pub fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        self.renew_at(lease, ttl, Utc::now())
    }

    pub fn renew_at(&self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        let lost = |reason: &str| OrchestratorError::LeaseLost {
            task_id: lease.task_id.clone(),
            tick: lease.tick,
            reason: reason.to_string(),
        };

        let mut current = self
            .leases
            .get_mut(&(lease.task_id.clone(), lease.tick))
            .ok_or_else(|| lost("lease released"))?;

        if current.token != lease.token {
            return Err(lost("lease taken over by another worker"));
        }
        if current.is_expired_at(now) {
            return Err(lost("lease expired"));
        }

        current.expires_at = now + to_chrono(ttl);
        Ok(current.clone())
    }

    /// Release if still held under the same token
    pub fn release(&self, lease: &Lease) -> bool {
        self.leases
            .remove_if(&(lease.task_id.clone(), lease.tick), |_, held| {
                held.token == lease.token
            })
            .is_some()
    }

    pub fn holder(&self, task_id: &TaskId, tick: Tick) -> Option<Lease> {
        self.leases
            .get(&(task_id.clone(), tick))
            .map(|l| l.clone())
            .filter(|l| !l.is_expired())
    }

    fn new_lease(
        &self,
        task_id: &TaskId,
        tick: Tick,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Lease {
        Lease {
            task_id: task_id.clone(),
            tick,
            owner: owner.to_string(),
            token: self.next_token.fetch_add(1, Ordering::SeqCst),
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
}
