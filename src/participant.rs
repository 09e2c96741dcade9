//! 2PC participant: per-key staging rights, votes, and decisions.
//!
//! A key can be staged by at most one in-flight transaction. A conflicting
//! prepare fails fast with a NO vote instead of queueing, unless the current
//! stager's lease has run out, in which case the stale transaction is aborted
//! and the newcomer takes the key. The staging right is mirrored in the
//! [`TransactionManager`], so local transactions touching a staged key die
//! instead of interleaving with the round. Committed writes land in the
//! manager's store through its replica-apply path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::LamportClock;
use crate::error::{Result, TxError};
use crate::manager::TransactionManager;
use crate::ops::{StagedWrite, StagingOp, StagingState};
use crate::protocol::{AckResponse, DecisionRequest, PrepareRequest, VoteResponse};
use crate::types::{Key, NodeId, ParticipantStatus, TxId, TxStatus, Value, Vote, WriteSet};
use crate::wal::{WalEvent, WriteAheadLog};

/// Debug view of a participant.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipantSnapshot {
    pub node: NodeId,
    pub lamport: u64,
    pub store: BTreeMap<Key, Value>,
    pub locks: BTreeMap<Key, TxId>,
    pub staged: BTreeMap<TxId, StagedWrite>,
    pub tx: BTreeMap<TxId, ParticipantStatus>,
}

pub struct Participant {
    node_id: NodeId,
    clock: Arc<LamportClock>,
    manager: Arc<TransactionManager>,
    wal: Arc<WriteAheadLog>,
    staging_lease: Duration,
    state: Mutex<StagingState>,
}

impl Participant {
    pub fn new(
        manager: Arc<TransactionManager>,
        wal: Arc<WriteAheadLog>,
        staging_lease: Duration,
    ) -> Self {
        Self {
            node_id: manager.node_id().to_string(),
            clock: manager.clock().clone(),
            manager,
            wal,
            staging_lease,
            state: Mutex::new(StagingState::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    fn lease_ms(&self) -> i64 {
        self.staging_lease.as_millis() as i64
    }

    fn execute(&self, state: &mut StagingState, ops: Vec<StagingOp>) {
        for op in ops {
            if state.is_noop(&op) {
                continue;
            }
            state.execute(op);
        }
    }

    /// Stage `key = value` for `tx_id`. `Ok` is a YES vote.
    ///
    /// Fails with `StagingConflict` when another live transaction holds the
    /// key's staging right or a local transaction holds a lock on it, and with
    /// `InvalidTransactionState` when `tx_id` was already decided.
    pub fn prepare(&self, tx_id: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        let now_ms = Utc::now().timestamp_millis();

        if let Some(status) = state.status(tx_id).filter(|s| s.is_final()) {
            let status = match status {
                ParticipantStatus::Committed => TxStatus::Committed,
                _ => TxStatus::Aborted,
            };
            self.log_vote(tx_id, key, Vote::No, Some("already decided"));
            return Err(TxError::InvalidTransactionState {
                tx_id: tx_id.to_string(),
                status,
            });
        }

        if let Some(holder) = state.holder(key).filter(|h| *h != tx_id).cloned() {
            let expired = state
                .staged_write(&holder)
                .is_some_and(|w| w.is_expired(self.lease_ms(), now_ms));
            if !expired {
                return Err(self.reject(&mut state, tx_id, key, holder));
            }
            warn!(tx_id, key, holder, "staging lease expired, taking over key");
            self.expire(&mut state, &holder);
        }

        if let Err(err) = self.manager.reserve_staged(tx_id, key) {
            let holder = match err {
                TxError::StagingConflict { holder, .. } => holder,
                other => return Err(other),
            };
            return Err(self.reject(&mut state, tx_id, key, holder));
        }

        self.execute(
            &mut state,
            vec![StagingOp::Stage {
                tx_id: tx_id.to_string(),
                key: key.to_string(),
                value: value.to_string(),
                staged_at: now_ms,
            }],
        );
        self.log_vote(tx_id, key, Vote::Yes, None);
        debug!(tx_id, key, "prepared");
        Ok(())
    }

    fn reject(&self, state: &mut StagingState, tx_id: &str, key: &str, holder: TxId) -> TxError {
        self.execute(
            state,
            vec![StagingOp::SetStatus {
                tx_id: tx_id.to_string(),
                status: ParticipantStatus::Aborted,
            }],
        );
        let err = TxError::StagingConflict {
            tx_id: tx_id.to_string(),
            key: key.to_string(),
            holder,
        };
        self.log_vote(tx_id, key, Vote::No, Some(&err.to_string()));
        info!("voting NO: {err}");
        err
    }

    fn log_vote(&self, tx_id: &str, key: &str, vote: Vote, reason: Option<&str>) {
        self.wal.record(
            self.clock.now(),
            WalEvent::PrepareVote {
                tx: tx_id.to_string(),
                key: key.to_string(),
                vote,
                reason: reason.map(str::to_string),
            },
        );
    }

    fn expire(&self, state: &mut StagingState, tx_id: &TxId) {
        self.manager.release_staged(tx_id);
        self.execute(
            state,
            vec![
                StagingOp::Unstage {
                    tx_id: tx_id.clone(),
                },
                StagingOp::SetStatus {
                    tx_id: tx_id.clone(),
                    status: ParticipantStatus::Aborted,
                },
            ],
        );
        self.wal.record(
            self.clock.now(),
            WalEvent::Abort {
                tx: tx_id.clone(),
                reason: Some("staging lease expired".to_string()),
            },
        );
    }

    /// Apply the staged write, if any, and release the key.
    ///
    /// Returns whether a staged write was applied. Decided transactions are
    /// left untouched.
    pub fn commit(&self, tx_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.status(tx_id) {
            Some(ParticipantStatus::Committed) => {
                debug!(tx_id, "duplicate commit ignored");
                return false;
            }
            Some(ParticipantStatus::Aborted) => {
                warn!(tx_id, "commit for an aborted transaction ignored");
                return false;
            }
            _ => {}
        }

        let staged = state.staged_write(tx_id).cloned();
        if let Some(write) = &staged {
            let writes = WriteSet::from([(write.key.clone(), write.value.clone())]);
            self.manager
                .apply_replica_commit(tx_id, &writes, self.clock.now());
        }
        self.manager.release_staged(tx_id);
        self.execute(
            &mut state,
            vec![
                StagingOp::Unstage {
                    tx_id: tx_id.to_string(),
                },
                StagingOp::SetStatus {
                    tx_id: tx_id.to_string(),
                    status: ParticipantStatus::Committed,
                },
            ],
        );
        let applied = staged.is_some();
        self.wal.record(
            self.clock.now(),
            WalEvent::Commit {
                tx: tx_id.to_string(),
                applied,
            },
        );
        info!(tx_id, applied, "2PC commit");
        applied
    }

    /// Discard the staged write, if any, and release the key.
    ///
    /// Returns whether a staged write was discarded.
    pub fn abort(&self, tx_id: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(status) = state.status(tx_id).filter(|s| s.is_final()) {
            debug!(tx_id, ?status, "abort of decided transaction ignored");
            return false;
        }

        let discarded = state.staged_write(tx_id).is_some();
        self.manager.release_staged(tx_id);
        self.execute(
            &mut state,
            vec![
                StagingOp::Unstage {
                    tx_id: tx_id.to_string(),
                },
                StagingOp::SetStatus {
                    tx_id: tx_id.to_string(),
                    status: ParticipantStatus::Aborted,
                },
            ],
        );
        self.wal.record(
            self.clock.now(),
            WalEvent::Abort {
                tx: tx_id.to_string(),
                reason: None,
            },
        );
        info!(tx_id, discarded, "2PC abort");
        discarded
    }

    /// Mark a transaction this node coordinates as started.
    pub fn begin_round(&self, tx_id: &str) {
        let mut state = self.state.lock();
        if state.status(tx_id).is_none() {
            self.execute(
                &mut state,
                vec![StagingOp::SetStatus {
                    tx_id: tx_id.to_string(),
                    status: ParticipantStatus::Started,
                }],
            );
        }
    }

    /// Abort every staged transaction whose lease has run out.
    pub fn expire_stale(&self) -> Vec<TxId> {
        let mut state = self.state.lock();
        let now_ms = Utc::now().timestamp_millis();
        let expired = state.expired(self.lease_ms(), now_ms);
        for tx_id in &expired {
            warn!(tx_id, "staging lease expired, aborting unilaterally");
            self.expire(&mut state, tx_id);
        }
        expired
    }

    pub fn status(&self, tx_id: &str) -> Option<ParticipantStatus> {
        self.state.lock().status(tx_id)
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        let state = self.state.lock();
        ParticipantSnapshot {
            node: self.node_id.clone(),
            lamport: self.clock.now(),
            store: self.manager.dump_store(),
            locks: state.locks().clone(),
            staged: state.staged().clone(),
            tx: state.statuses().clone(),
        }
    }

    /// Peer-facing prepare: merge the sender's clock, vote, stamp the reply.
    pub fn handle_prepare(&self, req: PrepareRequest) -> VoteResponse {
        self.clock.update(req.lamport_ts);
        let (vote, reason) = match self.prepare(&req.tx_id, &req.key, &req.value) {
            Ok(()) => (Vote::Yes, None),
            Err(e) => (Vote::No, Some(e.to_string())),
        };
        VoteResponse {
            vote,
            node: self.node_id.clone(),
            lamport_ts: self.clock.tick(),
            reason,
        }
    }

    pub fn handle_commit(&self, req: DecisionRequest) -> AckResponse {
        self.clock.update(req.lamport_ts);
        self.commit(&req.tx_id);
        self.ack()
    }

    pub fn handle_abort(&self, req: DecisionRequest) -> AckResponse {
        self.clock.update(req.lamport_ts);
        self.abort(&req.tx_id);
        self.ack()
    }

    fn ack(&self) -> AckResponse {
        AckResponse {
            ok: true,
            node: self.node_id.clone(),
            lamport_ts: self.clock.tick(),
        }
    }
}
