use thiserror::Error;

use crate::types::{TxId, TxStatus};

pub type Result<T, E = TxError> = std::result::Result<T, E>;

/// Errors surfaced by the transaction manager, the participant and the
/// coordinator.
///
/// Only the local transaction errors are ever returned to a caller of
/// the 2PC round; peer failures become NO votes.
#[derive(Debug, Error)]
pub enum TxError {
    /// The transaction id was never issued by (or replicated to) this node.
    #[error("no such transaction: {0}")]
    NoSuchTransaction(TxId),

    /// The transaction exists but is no longer active.
    #[error("transaction {tx_id} is not active ({status})")]
    InvalidTransactionState { tx_id: TxId, status: TxStatus },

    /// The requester was younger than the oldest lock owner and was aborted.
    #[error("transaction {tx_id} aborted by wait-die on key {key:?} (holder {holder})")]
    WaitDieAbort {
        tx_id: TxId,
        key: String,
        holder: TxId,
    },

    /// A shared owner asked for an exclusive lock on the same key.
    #[error("transaction {tx_id} holds a shared lock on {key:?}; upgrade to exclusive is not supported")]
    UnsupportedLockUpgrade { tx_id: TxId, key: String },

    /// Another in-flight transaction already staged the key.
    #[error("key {key:?} is staged by {holder}, rejecting {tx_id}")]
    StagingConflict {
        tx_id: TxId,
        key: String,
        holder: TxId,
    },

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: String, reason: String },

    #[error("peer {peer} did not answer within {timeout_ms} ms")]
    PeerTimeout { peer: String, timeout_ms: u64 },

    #[error("malformed causal tag: {0:?}")]
    MalformedCausalTag(String),

    #[error("write-ahead log: {0}")]
    Wal(#[from] anyhow::Error),
}

impl TxError {
    /// True when the transaction is gone for good and the client should start
    /// a fresh one rather than retry the same id.
    pub fn is_fatal_for_transaction(&self) -> bool {
        matches!(
            self,
            TxError::WaitDieAbort { .. } | TxError::InvalidTransactionState { .. }
        )
    }
}
