//! Evidence data types and the wire message.

use keel_p2p::Wrapper;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EvidenceError, Result};

/// Largest evidence payload accepted in a single record.
pub const MAX_EVIDENCE_PAYLOAD: usize = 256 * 1024;

/// Proof of validator misbehavior.
///
/// The payload is opaque to the gossip layer; full verification against
/// consensus state belongs to the pool's owner. What this type guarantees
/// is structural: the content hash commits to height, time and payload, so
/// a record can be deduplicated and spot-checked without decoding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Block height the misbehavior happened at.
    pub height: u64,
    /// Wall-clock time of the misbehavior, milliseconds since the epoch.
    pub time_ms: u64,
    /// The encoded proof.
    pub payload: Vec<u8>,
    /// blake3 over (height, time, payload).
    pub hash: [u8; 32],
}

impl Evidence {
    /// Creates a record, computing its content hash.
    #[must_use]
    pub fn new(height: u64, time_ms: u64, payload: Vec<u8>) -> Self {
        let hash = Self::compute_hash(height, time_ms, &payload);
        Self {
            height,
            time_ms,
            payload,
            hash,
        }
    }

    fn compute_hash(height: u64, time_ms: u64, payload: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&height.to_le_bytes());
        hasher.update(&time_ms.to_le_bytes());
        hasher.update(payload);
        *hasher.finalize().as_bytes()
    }

    /// The content hash, as used for deduplication.
    #[must_use]
    pub const fn hash(&self) -> EvidenceHash {
        EvidenceHash(self.hash)
    }

    /// Checks structural validity: a real height, a non-empty payload
    /// under the size cap, and a hash consistent with the content.
    ///
    /// # Errors
    ///
    /// [`EvidenceError::TooLarge`] for an oversized payload,
    /// [`EvidenceError::Invalid`] for everything else.
    pub fn verify_basic(&self) -> Result<()> {
        if self.height == 0 {
            return Err(EvidenceError::Invalid("height is zero".into()));
        }
        if self.payload.is_empty() {
            return Err(EvidenceError::Invalid("payload is empty".into()));
        }
        if self.payload.len() > MAX_EVIDENCE_PAYLOAD {
            return Err(EvidenceError::TooLarge {
                size: self.payload.len(),
                max: MAX_EVIDENCE_PAYLOAD,
            });
        }
        if self.hash != Self::compute_hash(self.height, self.time_ms, &self.payload) {
            return Err(EvidenceError::Invalid("hash does not match content".into()));
        }
        Ok(())
    }
}

/// Content hash identifying a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceHash(pub [u8; 32]);

impl fmt::Display for EvidenceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A batch of evidence, the unit the gossip protocol ships. Each record is
/// processed independently by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceList(pub Vec<Evidence>);

/// The evidence channel's wire message.
///
/// A single-variant enum today; the wrapper exists so the wire format can
/// grow new message types without breaking old peers at the codec level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidenceMessage {
    /// A batch of evidence records.
    List(EvidenceList),
}

impl From<EvidenceList> for EvidenceMessage {
    fn from(list: EvidenceList) -> Self {
        Self::List(list)
    }
}

impl Wrapper<EvidenceList> for EvidenceMessage {
    fn try_unwrap(self) -> std::result::Result<EvidenceList, Self> {
        match self {
            Self::List(list) => Ok(list),
        }
    }
}
