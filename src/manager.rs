//! Single-node transaction manager: strict 2PL with wait-die.
//!
//! Store, transaction table and lock table form one mutation domain behind a
//! single coarse mutex. A request that must wait parks on the key's condition
//! variable, which releases the mutex, and re-evaluates on every wake-up.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::clock::LamportClock;
use crate::error::{Result, TxError};
use crate::lock::{LockOutcome, LockSnapshot, LockTable};
use crate::types::{Key, LockMode, NodeId, Transaction, TxId, TxStatus, UndoEntry, Value, WriteSet};

/// Invoked with `(tx_id, writes, commit_ts)` after a local commit is applied.
///
/// Runs while the manager's mutex is held, so it must not call back into the
/// manager. An error is logged; the local commit stands.
pub type ReplicaCallback = Box<dyn Fn(&TxId, &WriteSet, u64) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct ManagerState {
    store: BTreeMap<Key, Value>,
    transactions: HashMap<TxId, Transaction>,
    locks: LockTable,
    /// key -> prepared 2PC transaction holding its staging right
    staged_keys: HashMap<Key, TxId>,
}

impl ManagerState {
    fn require_active(&mut self, tx_id: &str) -> Result<&mut Transaction> {
        let tx = self
            .transactions
            .get_mut(tx_id)
            .ok_or_else(|| TxError::NoSuchTransaction(tx_id.to_string()))?;
        if !tx.is_active() {
            return Err(TxError::InvalidTransactionState {
                tx_id: tx.id.clone(),
                status: tx.status,
            });
        }
        Ok(tx)
    }

    fn try_lock(&mut self, tx_id: &TxId, key: &str, mode: LockMode) -> Result<LockOutcome> {
        let start_ts = self.require_active(tx_id)?.start_ts;
        // A staged key is exclusively held by an owner older than any local one
        if let Some(stager) = self.staged_keys.get(key).filter(|s| *s != tx_id) {
            return Ok(LockOutcome::Died {
                holder: stager.clone(),
            });
        }
        let ManagerState {
            transactions,
            locks,
            ..
        } = self;
        locks.acquire(key, tx_id, start_ts, mode, |owner| {
            transactions
                .get(owner)
                .filter(|tx| tx.is_active())
                .map(|tx| tx.start_ts)
        })
    }

    /// Release every lock `tx_id` holds and record hand-offs on the new owners.
    fn release_all(&mut self, tx_id: &TxId) {
        let Some(tx) = self.transactions.get_mut(tx_id) else {
            return;
        };
        let keys = std::mem::take(&mut tx.locked_keys);
        for key in keys {
            for granted in self.locks.release(&key, tx_id) {
                if let Some(waiter) = self.transactions.get_mut(&granted) {
                    waiter.locked_keys.insert(key.clone());
                    waiter.waiting_on = None;
                }
            }
            self.locks.notify(&key);
        }
    }

    fn abort(&mut self, tx_id: &TxId) -> Result<()> {
        let Some(tx) = self.transactions.get_mut(tx_id) else {
            debug!(tx_id, "abort of unknown transaction ignored");
            return Ok(());
        };
        if !tx.is_active() {
            return Err(TxError::InvalidTransactionState {
                tx_id: tx.id.clone(),
                status: tx.status,
            });
        }

        tx.status = TxStatus::Aborted;
        tx.waiting_on = None;
        let undo = tx.undo_log.clone();

        for (key, entry) in undo {
            match entry {
                UndoEntry::Existed(previous) => {
                    self.store.insert(key, previous);
                }
                UndoEntry::Absent => {
                    self.store.remove(&key);
                }
            }
        }
        self.locks.cancel_waits(tx_id);
        self.release_all(tx_id);
        info!(tx_id, "transaction aborted");
        Ok(())
    }
}

/// Transactional key-value store of one node.
///
/// Constructed explicitly and shared through `Arc`; tests build as many
/// isolated instances as they need.
pub struct TransactionManager {
    node_id: NodeId,
    clock: Arc<LamportClock>,
    state: Mutex<ManagerState>,
    replica_callback: Option<ReplicaCallback>,
}

impl TransactionManager {
    pub fn new(node_id: impl Into<NodeId>, clock: Arc<LamportClock>) -> Self {
        Self {
            node_id: node_id.into(),
            clock,
            state: Mutex::new(ManagerState::default()),
            replica_callback: None,
        }
    }

    pub fn with_replica_callback(mut self, callback: ReplicaCallback) -> Self {
        self.replica_callback = Some(callback);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    /// Start a transaction; its id is `"<node>-<start_ts>"`.
    pub fn begin(&self) -> TxId {
        let mut state = self.state.lock();
        let start_ts = self.clock.tick();
        let tx_id = format!("{}-{}", self.node_id, start_ts);
        state
            .transactions
            .insert(tx_id.clone(), Transaction::new(tx_id.clone(), start_ts));
        debug!(tx_id, start_ts, "transaction started");
        tx_id
    }

    /// Read `key`, seeing this transaction's own buffered writes first.
    ///
    /// Blocks while an older-or-equal transaction waits on a conflicting owner.
    pub fn read(&self, tx_id: &str, key: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        let tx = state.require_active(tx_id)?;
        if let Some(value) = tx.write_set.get(key) {
            return Ok(Some(value.clone()));
        }
        let tx_id = tx.id.clone();
        self.acquire(&mut state, &tx_id, key, LockMode::Shared)?;
        Ok(state.store.get(key).cloned())
    }

    /// Buffer a write of `key`; the store is untouched until commit.
    pub fn write(&self, tx_id: &str, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut state = self.state.lock();
        let tx_id = state.require_active(tx_id)?.id.clone();
        self.acquire(&mut state, &tx_id, key, LockMode::Exclusive)?;

        let previous = state.store.get(key).cloned();
        let tx = state.require_active(&tx_id)?;
        tx.undo_log
            .entry(key.to_string())
            .or_insert_with(|| match previous {
                Some(value) => UndoEntry::Existed(value),
                None => UndoEntry::Absent,
            });
        tx.write_set.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Apply the write set atomically and release all locks.
    ///
    /// Returns the commit timestamp.
    pub fn commit(&self, tx_id: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let tx = state.require_active(tx_id)?;
        let tx_id = tx.id.clone();
        let writes = tx.write_set.clone();

        state
            .store
            .extend(writes.iter().map(|(k, v)| (k.clone(), v.clone())));
        let commit_ts = self.clock.tick();
        if let Some(tx) = state.transactions.get_mut(&tx_id) {
            tx.status = TxStatus::Committed;
            tx.waiting_on = None;
        }
        // Requests still parked on other threads must not be handed a lock
        state.locks.cancel_waits(&tx_id);

        if let Some(callback) = &self.replica_callback {
            if let Err(err) = callback(&tx_id, &writes, commit_ts) {
                warn!(tx_id, commit_ts, "replica apply failed, local commit kept: {err:#}");
            }
        }

        state.release_all(&tx_id);
        info!(tx_id, commit_ts, n_writes = writes.len(), "transaction committed");
        Ok(commit_ts)
    }

    /// Roll back and release. Unknown ids are a no-op; finalized ones an error.
    pub fn abort(&self, tx_id: &str) -> Result<()> {
        self.state.lock().abort(&tx_id.to_string())
    }

    /// Apply a commit already serialized by a remote node, bypassing locks.
    ///
    /// Returns the local Lamport time after merging `commit_ts`.
    pub fn apply_replica_commit(&self, tx_id: &str, writes: &WriteSet, commit_ts: u64) -> u64 {
        let mut state = self.state.lock();
        let local_ts = self.clock.update(commit_ts);
        state
            .store
            .extend(writes.iter().map(|(k, v)| (k.clone(), v.clone())));

        let record = state
            .transactions
            .entry(tx_id.to_string())
            .or_insert_with(|| {
                let mut tx = Transaction::new(tx_id.to_string(), commit_ts);
                tx.status = TxStatus::Committed;
                tx.write_set = writes.clone();
                tx
            });
        if record.status != TxStatus::Committed {
            warn!(tx_id, status = %record.status, "replicated commit collides with a local transaction id");
        }
        debug!(tx_id, commit_ts, local_ts, "applied replicated commit");
        local_ts
    }

    /// Give prepared round `tx_id` the staging right on `key`.
    ///
    /// Until [`release_staged`](Self::release_staged), local reads and writes
    /// of the key die with `WaitDieAbort`. Fails with `StagingConflict` when a
    /// local transaction holds a lock on the key or another round staged it.
    /// A round re-preparing under a new key gives up its previous one.
    pub fn reserve_staged(&self, tx_id: &str, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        let conflict = |holder: String| TxError::StagingConflict {
            tx_id: tx_id.to_string(),
            key: key.to_string(),
            holder,
        };

        if let Some(lock) = state.locks.get(key).filter(|l| !l.owners.is_empty()) {
            let owners: Vec<&str> = lock.owners.iter().map(String::as_str).collect();
            return Err(conflict(owners.join(",")));
        }
        if let Some(holder) = state.staged_keys.get(key).filter(|h| *h != tx_id) {
            return Err(conflict(holder.clone()));
        }

        state
            .staged_keys
            .retain(|staged, owner| owner.as_str() != tx_id || staged.as_str() == key);
        state.staged_keys.insert(key.to_string(), tx_id.to_string());
        debug!(tx_id, key, "staging right reserved");
        Ok(())
    }

    /// Drop every staging right held by `tx_id`.
    pub fn release_staged(&self, tx_id: &str) {
        self.state
            .lock()
            .staged_keys
            .retain(|_, owner| owner.as_str() != tx_id);
    }

    pub fn staged_keys(&self) -> BTreeMap<Key, TxId> {
        self.state
            .lock()
            .staged_keys
            .iter()
            .map(|(k, tx)| (k.clone(), tx.clone()))
            .collect()
    }

    pub fn status(&self, tx_id: &str) -> Option<TxStatus> {
        self.state.lock().transactions.get(tx_id).map(|tx| tx.status)
    }

    pub fn transaction(&self, tx_id: &str) -> Option<Transaction> {
        self.state.lock().transactions.get(tx_id).cloned()
    }

    /// Committed value of `key`, outside any transaction.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().store.get(key).cloned()
    }

    pub fn dump_store(&self) -> BTreeMap<Key, Value> {
        self.state.lock().store.clone()
    }

    /// Local transactions currently holding a lock on `key`.
    pub fn lock_owners(&self, key: &str) -> Vec<TxId> {
        self.state
            .lock()
            .locks
            .get(key)
            .map(|lock| lock.owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn lock_snapshot(&self) -> Vec<LockSnapshot> {
        self.state.lock().locks.snapshot()
    }

    pub fn active_transactions(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self
            .state
            .lock()
            .transactions
            .values()
            .filter(|tx| tx.is_active())
            .map(|tx| tx.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Acquire `mode` on `key`, parking on the key's condvar while queued.
    fn acquire(
        &self,
        state: &mut MutexGuard<'_, ManagerState>,
        tx_id: &TxId,
        key: &str,
        mode: LockMode,
    ) -> Result<()> {
        loop {
            let outcome = match state.try_lock(tx_id, key, mode) {
                Ok(outcome) => outcome,
                Err(err) => {
                    state.locks.cancel_wait(key, tx_id);
                    state.locks.notify(key);
                    if let Some(tx) = state.transactions.get_mut(tx_id) {
                        if tx.waiting_on.as_deref() == Some(key) {
                            tx.waiting_on = None;
                        }
                    }
                    return Err(err);
                }
            };
            match outcome {
                LockOutcome::Granted => {
                    if let Some(tx) = state.transactions.get_mut(tx_id) {
                        tx.locked_keys.insert(key.to_string());
                        tx.waiting_on = None;
                    }
                    return Ok(());
                }
                LockOutcome::Died { holder } => {
                    warn!(tx_id, key, holder, "wait-die: aborting younger transaction");
                    state.abort(tx_id)?;
                    return Err(TxError::WaitDieAbort {
                        tx_id: tx_id.clone(),
                        key: key.to_string(),
                        holder,
                    });
                }
                LockOutcome::Waiting => {
                    if let Some(tx) = state.transactions.get_mut(tx_id) {
                        tx.waiting_on = Some(key.to_string());
                    }
                    let cond = state.locks.condvar(key);
                    cond.wait(state);
                }
            }
        }
    }
}
