//! Evidence gossip for keel nodes.
//!
//! Validators that misbehave leave [`Evidence`]. This crate pools it and
//! gossips it to every connected peer over the evidence channel until it is
//! committed in a block. The moving parts:
//!
//! - [`types`]: evidence records and the wire message
//! - [`pending`]: the prunable pending list with per-peer cursors
//! - [`pool`]: the [`EvidencePool`] trait and an in-memory implementation
//! - [`reactor`]: the [`EvidenceReactor`] driving gossip over a
//!   [`keel_p2p::Router`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel_evidence::{BroadcastConfig, EvidenceReactor, MemoryPool};
//!
//! # async fn run(router: keel_p2p::Router) -> keel_p2p::Result<()> {
//! let pool = Arc::new(MemoryPool::new());
//! let reactor =
//!     EvidenceReactor::attach(&router, Arc::clone(&pool), BroadcastConfig::default()).await?;
//! tokio::spawn(reactor.run());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod pending;
pub mod pool;
pub mod reactor;
pub mod types;

pub use error::{EvidenceError, Result};
pub use pending::{Cursor, PendingList};
pub use pool::{EvidencePool, MemoryPool};
pub use reactor::{
    evidence_channel_descriptor, BroadcastConfig, EvidenceReactor, EVIDENCE_CHANNEL_ID,
    EVIDENCE_CHANNEL_PRIORITY, MAX_MESSAGE_SIZE,
};
pub use types::{Evidence, EvidenceHash, EvidenceList, EvidenceMessage, MAX_EVIDENCE_PAYLOAD};
