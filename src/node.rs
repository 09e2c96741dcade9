use crate::clock::{CausalMessage, LamportClock};
use crate::config::NodeConfig;
use crate::coordinator::{CommitCoordinator, PeerTransport};
use crate::error::TxError;
use crate::manager::{ReplicaCallback, TransactionManager};
use crate::participant::Participant;
use crate::types::NodeId;
use crate::wal::WriteAheadLog;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub lamport: u64,
    pub n_kvs: usize,
    pub active_tx: Vec<String>,
    pub staged: usize,
    pub wal: bool,
    pub peers: Vec<String>,
}

/// One node of the cluster: a transaction manager and a 2PC participant
/// sharing a Lamport clock, a store, and an event log.
pub struct Node {
    config: NodeConfig,
    clock: Arc<LamportClock>,
    manager: Arc<TransactionManager>,
    participant: Arc<Participant>,
    wal: Arc<WriteAheadLog>,
}

impl Node {
    /// Create a node from its configuration, opening the event log if one is
    /// configured.
    pub fn new(config: NodeConfig) -> Result<Self> {
        Self::new_with_replica(config, None)
    }

    /// Like [`Node::new`], pushing every local commit through `callback`.
    pub fn new_with_replica(config: NodeConfig, callback: Option<ReplicaCallback>) -> Result<Self> {
        let wal = match &config.wal_path {
            Some(path) => {
                let wal = WriteAheadLog::new(path)?;
                info!("Event log enabled: {}", wal.path()?.display());
                wal
            }
            None => WriteAheadLog::disabled(),
        };
        Ok(Self::assemble(config, wal, callback))
    }

    /// A node with no peers and no event log.
    pub fn in_memory(node_id: impl Into<NodeId>) -> Self {
        Self::assemble(NodeConfig::new(node_id), WriteAheadLog::disabled(), None)
    }

    fn assemble(config: NodeConfig, wal: WriteAheadLog, callback: Option<ReplicaCallback>) -> Self {
        let clock = Arc::new(LamportClock::new());
        let mut manager = TransactionManager::new(config.node_id.clone(), clock.clone());
        if let Some(callback) = callback {
            manager = manager.with_replica_callback(callback);
        }
        let manager = Arc::new(manager);
        let wal = Arc::new(wal);
        let participant = Arc::new(Participant::new(
            manager.clone(),
            wal.clone(),
            config.staging_lease(),
        ));
        Self {
            config,
            clock,
            manager,
            participant,
            wal,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    pub fn participant(&self) -> &Arc<Participant> {
        &self.participant
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    /// Coordinator for 2PC rounds against the configured peers.
    pub fn coordinator<Net: PeerTransport>(&self, network: Arc<Net>) -> CommitCoordinator<Net> {
        CommitCoordinator::new(
            self.participant.clone(),
            network,
            self.config.peers.clone(),
            self.config.prepare_timeout(),
        )
    }

    /// Merge the clock of a `"<ts>|<payload>"` message and return it.
    pub fn receive_causal(&self, line: &str) -> Result<CausalMessage, TxError> {
        let msg: CausalMessage = line.trim_end().parse()?;
        let local_ts = msg.receive(&self.clock);
        info!(
            "Received causal message at {} (sender {}): {}",
            local_ts, msg.lamport_ts, msg.payload
        );
        Ok(msg)
    }

    /// Get node status (for debugging/monitoring)
    pub fn status(&self) -> NodeStatus {
        let snapshot = self.participant.snapshot();
        NodeStatus {
            id: self.config.node_id.clone(),
            lamport: self.clock.now(),
            n_kvs: snapshot.store.len(),
            active_tx: self.manager.active_transactions(),
            staged: snapshot.staged.len(),
            wal: self.wal.is_enabled(),
            peers: self.config.peers.clone(),
        }
    }
}
