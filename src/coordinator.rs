use crate::error::TxError;
use crate::participant::Participant;
use crate::protocol::{AckResponse, DecisionRequest, PrepareRequest, StartOutcome, VoteResponse};
use crate::types::{Decision, TxId, Vote};
use crate::wal::WalEvent;
use anyhow::Result;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

/// Transport used by the coordinator to reach peer participants
pub trait PeerTransport: Send + Sync + 'static {
    fn prepare(
        &self,
        peer: &str,
        req: PrepareRequest,
    ) -> impl Future<Output = Result<VoteResponse>> + Send;

    fn decide(
        &self,
        peer: &str,
        decision: Decision,
        req: DecisionRequest,
    ) -> impl Future<Output = Result<AckResponse>> + Send;
}

/// Drives one 2PC round per logical write.
///
/// The local participant takes part in its own round like any peer: it
/// prepares before the decision and applies the write only through a commit.
pub struct CommitCoordinator<Net: PeerTransport> {
    participant: Arc<Participant>,
    network: Arc<Net>,
    peers: Vec<String>,
    timeout: Duration,
}

impl<Net: PeerTransport> CommitCoordinator<Net> {
    pub fn new(
        participant: Arc<Participant>,
        network: Arc<Net>,
        peers: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            participant,
            network,
            peers,
            timeout,
        }
    }

    /// Fresh id for a round started without one: `"<node>-2pc-<lamport>"`
    pub fn mint_tx_id(&self) -> TxId {
        format!(
            "{}-2pc-{}",
            self.participant.node_id(),
            self.participant.clock().tick()
        )
    }

    /// Run a full round for `key = value`.
    ///
    /// Peer failures and timeouts count as NO votes; they never fail the call.
    #[tracing::instrument(skip(self, value), fields(node = self.participant.node_id()))]
    pub async fn start(&self, tx_id: &str, key: &str, value: &str) -> StartOutcome {
        let clock = self.participant.clock().clone();
        let wal = self.participant.wal().clone();

        self.participant.begin_round(tx_id);
        wal.record(
            clock.tick(),
            WalEvent::Start {
                tx: tx_id.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            },
        );

        let mut votes = BTreeMap::new();
        let local_vote = match self.participant.prepare(tx_id, key, value) {
            Ok(()) => Vote::Yes,
            Err(e) => {
                info!("Local participant voted NO: {e}");
                Vote::No
            }
        };
        votes.insert(self.participant.node_id().to_string(), local_vote);
        votes.extend(self.collect_votes(tx_id, key, value).await);

        let decision = Decision::from_votes(votes.values());
        wal.record(
            clock.now(),
            WalEvent::Decision {
                tx: tx_id.to_string(),
                decision,
                votes: votes.clone(),
            },
        );
        info!("Decision for {tx_id}: {decision} ({votes:?})");

        self.broadcast(tx_id, decision).await;

        match decision {
            Decision::Commit => {
                self.participant.commit(tx_id);
            }
            Decision::Abort => {
                self.participant.abort(tx_id);
            }
        }

        StartOutcome {
            tx_id: tx_id.to_string(),
            decision,
            votes,
        }
    }

    /// Send prepare to every peer concurrently; one vote per peer.
    async fn collect_votes(&self, tx_id: &str, key: &str, value: &str) -> BTreeMap<String, Vote> {
        // Peers that never answer keep this NO
        let mut votes: BTreeMap<String, Vote> =
            self.peers.iter().map(|p| (p.clone(), Vote::No)).collect();
        let clock = self.participant.clock().clone();
        let timeout_ms = self.timeout.as_millis() as u64;

        let mut calls = JoinSet::new();
        for peer in &self.peers {
            let network = self.network.clone();
            let peer = peer.clone();
            let limit = self.timeout;
            let req = PrepareRequest {
                tx_id: tx_id.to_string(),
                key: key.to_string(),
                value: value.to_string(),
                lamport_ts: clock.tick(),
            };
            calls.spawn(async move {
                let result = timeout(limit, network.prepare(&peer, req)).await;
                (peer, result)
            });
        }

        while let Some(joined) = calls.join_next().await {
            let (peer, result) = match joined {
                Ok(answer) => answer,
                Err(e) => {
                    warn!("Prepare task failed: {e}");
                    continue;
                }
            };
            let vote = match result {
                Ok(Ok(resp)) => {
                    clock.update(resp.lamport_ts);
                    if let Some(reason) = &resp.reason {
                        info!("Peer {peer} ({}) voted {:?}: {reason}", resp.node, resp.vote);
                    }
                    resp.vote
                }
                Ok(Err(e)) => {
                    let err = TxError::PeerUnreachable {
                        peer: peer.clone(),
                        reason: format!("{e:#}"),
                    };
                    warn!("{err}; counting as NO");
                    Vote::No
                }
                Err(_) => {
                    let err = TxError::PeerTimeout {
                        peer: peer.clone(),
                        timeout_ms,
                    };
                    warn!("{err}; counting as NO");
                    Vote::No
                }
            };
            votes.insert(peer, vote);
        }
        votes
    }

    /// Deliver the decision to every peer. Failures are logged, not retried.
    async fn broadcast(&self, tx_id: &str, decision: Decision) {
        let clock = self.participant.clock().clone();
        let mut calls = JoinSet::new();
        for peer in &self.peers {
            let network = self.network.clone();
            let peer = peer.clone();
            let limit = self.timeout;
            let req = DecisionRequest::new(tx_id, clock.tick());
            calls.spawn(async move {
                let result = timeout(limit, network.decide(&peer, decision, req)).await;
                (peer, result)
            });
        }

        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok((_, Ok(Ok(ack)))) => {
                    clock.update(ack.lamport_ts);
                }
                Ok((peer, Ok(Err(e)))) => {
                    warn!("Failed to deliver {decision} to peer {peer}: {e:#}");
                }
                Ok((peer, Err(_))) => {
                    warn!("Delivering {decision} to peer {peer} timed out");
                }
                Err(e) => warn!("Decision task failed: {e}"),
            }
        }
    }
}
