use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub type NodeId = String;
pub type TxId = String;
pub type Key = String;
pub type Value = String;

/// Buffered or replicated writes of one transaction, ordered by key.
pub type WriteSet = BTreeMap<Key, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStatus::Active => write!(f, "ACTIVE"),
            TxStatus::Committed => write!(f, "COMMITTED"),
            TxStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Pre-write state of a key, captured on a transaction's first write to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoEntry {
    /// The key held `previous` before the transaction touched it.
    Existed(Value),
    /// The key did not exist; rollback removes it.
    Absent,
}

/// A local 2PL transaction.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: TxId,
    /// Lamport time at `begin`; lower is older and wins wait-die conflicts.
    pub start_ts: u64,
    pub status: TxStatus,
    pub write_set: WriteSet,
    pub undo_log: BTreeMap<Key, UndoEntry>,
    pub locked_keys: BTreeSet<Key>,
    /// Key this transaction is currently queued on, if any.
    #[serde(skip)]
    pub waiting_on: Option<Key>,
}

impl Transaction {
    pub fn new(id: TxId, start_ts: u64) -> Self {
        Self {
            id,
            start_ts,
            status: TxStatus::Active,
            write_set: WriteSet::new(),
            undo_log: BTreeMap::new(),
            locked_keys: BTreeSet::new(),
            waiting_on: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TxStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Yes,
    No,
}

impl Vote {
    pub fn is_yes(self) -> bool {
        self == Vote::Yes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Commit,
    Abort,
}

impl Decision {
    /// Unanimity rule: commit only if every vote is YES.
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        if votes.into_iter().all(|v| v.is_yes()) {
            Decision::Commit
        } else {
            Decision::Abort
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => write!(f, "commit"),
            Decision::Abort => write!(f, "abort"),
        }
    }
}

/// Participant-side status of a 2PC transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Started,
    Prepared,
    Committed,
    Aborted,
}

impl ParticipantStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ParticipantStatus::Committed | ParticipantStatus::Aborted
        )
    }
}
