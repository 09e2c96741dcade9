//! WaveTX - A small distributed transaction engine over an in-memory key-value store
//!
//! WaveTX combines three classic building blocks. It focuses on clarity over completeness.
//!
//! # Key Features
//!
//! - **Lamport clocks**: Every node stamps its messages and merges what it receives
//! - **Strict two-phase locking**: Shared/exclusive key locks held until commit or abort
//! - **Wait-die deadlock prevention**: Younger transactions abort instead of waiting on older ones
//! - **Two-phase commit**: Any node coordinates an atomic write across its peers
//! - **Transport-agnostic**: You provide the network layer through [`coordinator::PeerTransport`]
//! - **Event log**: Append-only JSON lines for diagnostics
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use wavetx::clock::LamportClock;
//! use wavetx::manager::TransactionManager;
//!
//! let tm = TransactionManager::new("n1", Arc::new(LamportClock::new()));
//!
//! let tx = tm.begin();
//! tm.write(&tx, "x", "1").unwrap();
//! assert_eq!(tm.read(&tx, "x").unwrap().as_deref(), Some("1"));
//! tm.commit(&tx).unwrap();
//! assert_eq!(tm.get("x").as_deref(), Some("1"));
//! ```
//!
//! # Architecture
//!
//! The core types you'll work with:
//! - [`Node`] - Bundles the clock, manager, participant and event log of one node
//! - [`manager::TransactionManager`] - Local transactions under strict 2PL
//! - [`participant::Participant`] - Votes on prepares and applies decisions
//! - [`coordinator::CommitCoordinator`] - Runs one 2PC round per write
//!
//! # Non-goals
//!
//! WaveTX intentionally does NOT provide:
//! - Crash recovery or log replay
//! - Coordinator failover or a termination protocol for blocked participants
//! - Multi-key 2PC transactions
//! - Lock upgrades from shared to exclusive
//! - Authentication or access control

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod manager;
pub mod node;
pub mod ops;
pub mod participant;
pub mod protocol;
pub mod types;
pub mod wal;

pub use error::{Result, TxError};
pub use node::Node;
