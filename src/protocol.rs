//! Messages exchanged between coordinators and participants.
//!
//! Every peer message carries the sender's Lamport time; receivers merge it
//! with [`LamportClock::update`](crate::clock::LamportClock::update).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Decision, Key, NodeId, TxId, Value, Vote, WriteSet};

/// Client request to run a 2PC round for one write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub tx_id: Option<TxId>,
    pub key: Key,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOutcome {
    pub tx_id: TxId,
    pub decision: Decision,
    /// Vote per participant: the coordinator's node id and each peer address.
    pub votes: BTreeMap<String, Vote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub tx_id: TxId,
    pub key: Key,
    pub value: Value,
    #[serde(default)]
    pub lamport_ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote: Vote,
    pub node: NodeId,
    #[serde(default)]
    pub lamport_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Commit or abort notification; which one is given by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub tx_id: TxId,
    #[serde(default)]
    pub lamport_ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
    pub node: NodeId,
    #[serde(default)]
    pub lamport_ts: u64,
}

/// A locally committed transaction pushed to a passive replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaApplyRequest {
    pub tx_id: TxId,
    pub writes: WriteSet,
    pub commit_ts: u64,
}

impl DecisionRequest {
    pub fn new(tx_id: impl Into<TxId>, lamport_ts: u64) -> Self {
        Self {
            tx_id: tx_id.into(),
            lamport_ts,
        }
    }
}

/// Endpoint path a decision is delivered to.
pub fn decision_path(decision: Decision) -> &'static str {
    match decision {
        Decision::Commit => "/commit",
        Decision::Abort => "/abort",
    }
}
