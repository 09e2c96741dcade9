//! Per-key lock table with wait-die conflict resolution.
//!
//! The table itself never blocks. It is mutated only while the caller holds
//! the transaction manager's coarse mutex; blocking happens in the manager by
//! waiting on the per-key [`Condvar`] handed out by [`LockTable::condvar`].
//!
//! # Hand-off
//!
//! When the last owner releases a key, the lock is handed directly to the
//! head of the FIFO wait queue (and to every Shared waiter immediately
//! behind a Shared head). Waiters wake, find themselves among the owners and
//! return. A lock with queued waiters is therefore never free, so late
//! arrivals cannot overtake the queue.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Condvar;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{Result, TxError};
use crate::types::{Key, LockMode, TxId};

/// Result of one evaluation of the wait-die protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The requester owns the lock in a mode covering the request.
    Granted,
    /// The requester is older than every owner and is queued.
    Waiting,
    /// The requester is younger than `holder` and must abort.
    Died { holder: TxId },
}

#[derive(Debug, Default)]
pub struct KeyLock {
    pub mode: Option<LockMode>,
    pub owners: BTreeSet<TxId>,
    pub waiters: VecDeque<(TxId, LockMode)>,
    cond: Arc<Condvar>,
}

impl KeyLock {
    fn grant(&mut self, tx_id: &TxId, mode: LockMode) {
        self.mode = Some(match (self.mode, mode) {
            (Some(LockMode::Exclusive), _) | (_, LockMode::Exclusive) => LockMode::Exclusive,
            _ => LockMode::Shared,
        });
        self.owners.insert(tx_id.clone());
        self.waiters.retain(|(id, _)| id != tx_id);
    }

    fn is_queued(&self, tx_id: &TxId) -> bool {
        self.waiters.iter().any(|(id, _)| id == tx_id)
    }

    /// Hand a free lock to queued waiters in arrival order.
    fn hand_off(&mut self) -> Vec<TxId> {
        let mut granted = Vec::new();
        while let Some((tx_id, mode)) = self.waiters.front().cloned() {
            let compatible = match self.mode {
                None => true,
                Some(LockMode::Shared) => mode == LockMode::Shared,
                Some(LockMode::Exclusive) => false,
            };
            if !compatible {
                break;
            }
            self.waiters.pop_front();
            self.grant(&tx_id, mode);
            granted.push(tx_id);
        }
        granted
    }
}

/// Point-in-time view of one key's lock, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LockSnapshot {
    pub key: Key,
    pub mode: Option<LockMode>,
    pub owners: Vec<TxId>,
    pub waiters: Vec<(TxId, LockMode)>,
}

/// All key locks of one transaction manager. Locks are created lazily and
/// never deleted.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<Key, KeyLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a request for `mode` on `key` by `tx_id` (started at `start_ts`).
    ///
    /// `owner_start_ts` resolves an owner's start timestamp and returns `None`
    /// for owners that are no longer active. A `Waiting` outcome leaves the
    /// requester queued exactly once, however often it re-evaluates.
    pub fn acquire(
        &mut self,
        key: &str,
        tx_id: &TxId,
        start_ts: u64,
        mode: LockMode,
        owner_start_ts: impl Fn(&TxId) -> Option<u64>,
    ) -> Result<LockOutcome> {
        let lock = self.locks.entry(key.to_string()).or_default();

        if lock.owners.contains(tx_id) {
            return match (lock.mode, mode) {
                (Some(LockMode::Shared), LockMode::Exclusive) => {
                    Err(TxError::UnsupportedLockUpgrade {
                        tx_id: tx_id.clone(),
                        key: key.to_string(),
                    })
                }
                _ => Ok(LockOutcome::Granted),
            };
        }

        match (lock.mode, mode) {
            (None, _) | (Some(LockMode::Shared), LockMode::Shared) => {
                lock.grant(tx_id, mode);
                trace!(key, tx_id, %mode, "lock granted");
                return Ok(LockOutcome::Granted);
            }
            _ => {}
        }

        // Conflict: compare against the oldest live owner.
        let oldest = lock
            .owners
            .iter()
            .filter_map(|owner| owner_start_ts(owner).map(|ts| (ts, owner)))
            .min();
        if let Some((oldest_ts, holder)) = oldest {
            if start_ts > oldest_ts {
                return Ok(LockOutcome::Died {
                    holder: holder.clone(),
                });
            }
        }

        if !lock.is_queued(tx_id) {
            debug!(key, tx_id, %mode, "queued behind {:?}", lock.owners);
            lock.waiters.push_back((tx_id.clone(), mode));
        }
        Ok(LockOutcome::Waiting)
    }

    /// Drop `tx_id` from the owners of `key`. Returns the waiters the lock was
    /// handed to, if it became free.
    pub fn release(&mut self, key: &str, tx_id: &TxId) -> Vec<TxId> {
        let Some(lock) = self.locks.get_mut(key) else {
            return Vec::new();
        };
        lock.owners.remove(tx_id);
        if !lock.owners.is_empty() {
            return Vec::new();
        }
        lock.mode = None;
        let granted = lock.hand_off();
        if !granted.is_empty() {
            debug!(key, "lock handed to {granted:?}");
        }
        granted
    }

    /// Remove a queued request (the waiter was aborted while blocked).
    pub fn cancel_wait(&mut self, key: &str, tx_id: &TxId) {
        if let Some(lock) = self.locks.get_mut(key) {
            lock.waiters.retain(|(id, _)| id != tx_id);
        }
    }

    /// Remove every queued request of `tx_id` and wake the affected keys.
    ///
    /// Returns the keys `tx_id` was queued on.
    pub fn cancel_waits(&mut self, tx_id: &TxId) -> Vec<Key> {
        let mut keys = Vec::new();
        for (key, lock) in self.locks.iter_mut() {
            if lock.is_queued(tx_id) {
                lock.waiters.retain(|(id, _)| id != tx_id);
                lock.cond.notify_all();
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Condition variable waiters of `key` block on.
    pub fn condvar(&mut self, key: &str) -> Arc<Condvar> {
        self.locks.entry(key.to_string()).or_default().cond.clone()
    }

    pub fn notify(&self, key: &str) {
        if let Some(lock) = self.locks.get(key) {
            lock.cond.notify_all();
        }
    }

    pub fn get(&self, key: &str) -> Option<&KeyLock> {
        self.locks.get(key)
    }

    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        let mut locks: Vec<LockSnapshot> = self
            .locks
            .iter()
            .map(|(key, lock)| LockSnapshot {
                key: key.clone(),
                mode: lock.mode,
                owners: lock.owners.iter().cloned().collect(),
                waiters: lock.waiters.iter().cloned().collect(),
            })
            .collect();
        locks.sort_by(|a, b| a.key.cmp(&b.key));
        locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ages(pairs: &[(&str, u64)]) -> HashMap<TxId, u64> {
        pairs.iter().map(|(id, ts)| (id.to_string(), *ts)).collect()
    }

    #[test]
    fn shared_owners_coexist_and_exclusive_is_single() {
        let ts = ages(&[("a", 1), ("b", 2), ("c", 3)]);
        let age = |id: &TxId| ts.get(id).copied();
        let mut table = LockTable::new();

        let a = "a".to_string();
        let b = "b".to_string();
        assert_eq!(
            table.acquire("k", &a, 1, LockMode::Shared, age).unwrap(),
            LockOutcome::Granted
        );
        assert_eq!(
            table.acquire("k", &b, 2, LockMode::Shared, age).unwrap(),
            LockOutcome::Granted
        );
        let lock = table.get("k").unwrap();
        assert_eq!(lock.mode, Some(LockMode::Shared));
        assert_eq!(lock.owners.len(), 2);

        // Younger writer dies against the oldest shared owner
        let c = "c".to_string();
        assert_eq!(
            table.acquire("k", &c, 3, LockMode::Exclusive, age).unwrap(),
            LockOutcome::Died { holder: a.clone() }
        );
    }

    #[test]
    fn older_requester_waits_and_receives_hand_off() {
        let ts = ages(&[("old", 1), ("young", 5)]);
        let age = |id: &TxId| ts.get(id).copied();
        let mut table = LockTable::new();
        let old = "old".to_string();
        let young = "young".to_string();

        table
            .acquire("k", &young, 5, LockMode::Exclusive, age)
            .unwrap();
        assert_eq!(
            table.acquire("k", &old, 1, LockMode::Shared, age).unwrap(),
            LockOutcome::Waiting
        );
        // Re-evaluation does not queue twice
        table.acquire("k", &old, 1, LockMode::Shared, age).unwrap();
        assert_eq!(table.get("k").unwrap().waiters.len(), 1);

        assert_eq!(table.release("k", &young), vec![old.clone()]);
        let lock = table.get("k").unwrap();
        assert_eq!(lock.mode, Some(LockMode::Shared));
        assert!(lock.owners.contains(&old));
        assert!(lock.waiters.is_empty());
    }

    #[test]
    fn hand_off_grants_shared_run_then_stops_at_exclusive() {
        let ts = ages(&[("w1", 1), ("w2", 2), ("w3", 3), ("holder", 9)]);
        let age = |id: &TxId| ts.get(id).copied();
        let mut table = LockTable::new();
        let holder = "holder".to_string();
        table
            .acquire("k", &holder, 9, LockMode::Exclusive, age)
            .unwrap();
        for (id, ts, mode) in [
            ("w1", 1, LockMode::Shared),
            ("w2", 2, LockMode::Shared),
            ("w3", 3, LockMode::Exclusive),
        ] {
            assert_eq!(
                table.acquire("k", &id.to_string(), ts, mode, age).unwrap(),
                LockOutcome::Waiting
            );
        }

        let granted = table.release("k", &holder);
        assert_eq!(granted, vec!["w1".to_string(), "w2".to_string()]);
        assert_eq!(table.get("k").unwrap().waiters.len(), 1);

        table.release("k", &"w1".to_string());
        let granted = table.release("k", &"w2".to_string());
        assert_eq!(granted, vec!["w3".to_string()]);
        assert_eq!(table.get("k").unwrap().mode, Some(LockMode::Exclusive));
    }

    #[test]
    fn cancelled_waits_are_never_handed_the_lock() {
        let ts = ages(&[("old", 1), ("young", 5)]);
        let age = |id: &TxId| ts.get(id).copied();
        let mut table = LockTable::new();
        let old = "old".to_string();
        let young = "young".to_string();

        table.acquire("a", &young, 5, LockMode::Exclusive, age).unwrap();
        table.acquire("b", &young, 5, LockMode::Exclusive, age).unwrap();
        for key in ["a", "b"] {
            assert_eq!(
                table.acquire(key, &old, 1, LockMode::Exclusive, age).unwrap(),
                LockOutcome::Waiting
            );
        }

        let mut keys = table.cancel_waits(&old);
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(table.release("a", &young).is_empty());
        assert!(table.release("b", &young).is_empty());
        assert!(table.get("a").unwrap().owners.is_empty());
        assert!(table.cancel_waits(&old).is_empty());
    }

    #[test]
    fn shared_to_exclusive_upgrade_is_rejected() {
        let age = |_: &TxId| Some(1);
        let mut table = LockTable::new();
        let a = "a".to_string();
        table.acquire("k", &a, 1, LockMode::Shared, age).unwrap();
        assert!(matches!(
            table.acquire("k", &a, 1, LockMode::Exclusive, age),
            Err(TxError::UnsupportedLockUpgrade { .. })
        ));
        // Exclusive owner may read
        let mut table = LockTable::new();
        table.acquire("k", &a, 1, LockMode::Exclusive, age).unwrap();
        assert_eq!(
            table.acquire("k", &a, 1, LockMode::Shared, age).unwrap(),
            LockOutcome::Granted
        );
    }
}
