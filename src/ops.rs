use crate::types::{Key, ParticipantStatus, TxId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Atomic operations on the participant's staging table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StagingOp {
    /// Record a transaction's 2PC status
    SetStatus {
        tx_id: TxId,
        status: ParticipantStatus,
    },

    /// Stage a write and take the key's staging right
    Stage {
        tx_id: TxId,
        key: Key,
        value: Value,
        /// Wall-clock millis, used for the staging lease
        staged_at: i64,
    },

    /// Drop a transaction's staged write and release its key
    Unstage { tx_id: TxId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedWrite {
    pub key: Key,
    pub value: Value,
    pub staged_at: i64,
}

impl StagedWrite {
    pub fn is_expired(&self, lease_ms: i64, now_ms: i64) -> bool {
        now_ms >= self.staged_at.saturating_add(lease_ms)
    }
}

/// Participant state: who holds each key's staging right, what is staged,
/// and the status of every transaction seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagingState {
    /// key -> transaction holding the staging right
    locks: BTreeMap<Key, TxId>,

    /// transaction -> its staged write
    staged: BTreeMap<TxId, StagedWrite>,

    status: BTreeMap<TxId, ParticipantStatus>,
}

impl StagingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_noop(&self, op: &StagingOp) -> bool {
        match op {
            StagingOp::SetStatus { tx_id, status } => self.status.get(tx_id) == Some(status),
            StagingOp::Stage { .. } => false,
            StagingOp::Unstage { tx_id } => !self.staged.contains_key(tx_id),
        }
    }

    /// Execute a staging operation - the only way to mutate StagingState
    pub fn execute(&mut self, op: StagingOp) {
        match op {
            StagingOp::SetStatus { tx_id, status } => {
                self.status.insert(tx_id, status);
            }
            StagingOp::Stage {
                tx_id,
                key,
                value,
                staged_at,
            } => {
                // A re-prepare under another key gives up the old one
                if let Some(previous) = self.staged.get(&tx_id) {
                    if previous.key != key {
                        let old_key = previous.key.clone();
                        self.release_key(&old_key, &tx_id);
                    }
                }
                self.locks.insert(key.clone(), tx_id.clone());
                self.staged.insert(
                    tx_id.clone(),
                    StagedWrite {
                        key,
                        value,
                        staged_at,
                    },
                );
                self.status.insert(tx_id, ParticipantStatus::Prepared);
            }
            StagingOp::Unstage { tx_id } => {
                if let Some(write) = self.staged.remove(&tx_id) {
                    self.release_key(&write.key, &tx_id);
                }
            }
        }
    }

    fn release_key(&mut self, key: &str, tx_id: &TxId) {
        if self.locks.get(key) == Some(tx_id) {
            self.locks.remove(key);
        }
    }

    pub fn holder(&self, key: &str) -> Option<&TxId> {
        self.locks.get(key)
    }

    pub fn staged_write(&self, tx_id: &str) -> Option<&StagedWrite> {
        self.staged.get(tx_id)
    }

    pub fn status(&self, tx_id: &str) -> Option<ParticipantStatus> {
        self.status.get(tx_id).copied()
    }

    pub fn locks(&self) -> &BTreeMap<Key, TxId> {
        &self.locks
    }

    pub fn staged(&self) -> &BTreeMap<TxId, StagedWrite> {
        &self.staged
    }

    pub fn statuses(&self) -> &BTreeMap<TxId, ParticipantStatus> {
        &self.status
    }

    /// Transactions whose staging lease ran out at `now_ms`
    pub fn expired(&self, lease_ms: i64, now_ms: i64) -> Vec<TxId> {
        self.staged
            .iter()
            .filter(|(_, write)| write.is_expired(lease_ms, now_ms))
            .map(|(tx_id, _)| tx_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(tx: &str, key: &str, at: i64) -> StagingOp {
        StagingOp::Stage {
            tx_id: tx.into(),
            key: key.into(),
            value: "v".into(),
            staged_at: at,
        }
    }

    #[test]
    fn stage_and_unstage_track_key_holder() {
        let mut state = StagingState::new();
        state.execute(stage("t1", "x", 0));
        assert_eq!(state.holder("x"), Some(&"t1".to_string()));
        assert_eq!(state.status("t1"), Some(ParticipantStatus::Prepared));

        assert!(!state.is_noop(&StagingOp::Unstage { tx_id: "t1".into() }));
        state.execute(StagingOp::Unstage { tx_id: "t1".into() });
        assert!(state.holder("x").is_none());
        assert!(state.is_noop(&StagingOp::Unstage { tx_id: "t1".into() }));
    }

    #[test]
    fn restaging_under_new_key_releases_old_key() {
        let mut state = StagingState::new();
        state.execute(stage("t1", "x", 0));
        state.execute(stage("t1", "y", 0));
        assert!(state.holder("x").is_none());
        assert_eq!(state.holder("y"), Some(&"t1".to_string()));
        assert_eq!(state.staged().len(), 1);
    }

    #[test]
    fn lease_expiry() {
        let mut state = StagingState::new();
        state.execute(stage("old", "x", 1_000));
        state.execute(stage("new", "y", 5_000));
        assert_eq!(state.expired(2_000, 3_500), vec!["old".to_string()]);
        assert!(state.expired(10_000, 3_500).is_empty());
    }
}
