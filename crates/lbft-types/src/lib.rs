//! # lbft-types: Core types for `lbft`
//!
//! This crate contains the value types shared by every layer of the
//! multi-chain ordering core:
//! - Identifiers ([`ChainId`], [`ReplicaId`])
//! - Sequencing ([`SeqNo`])
//! - Content binding ([`struct@Digest`])
//! - Batches ([`Transaction`], [`Request`], [`BatchName`])
//! - Admission ([`AdmissionError`], [`EMPTY_REQUEST`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

mod request;

pub use request::{AdmissionError, BatchName, EMPTY_REQUEST, Request, Transaction};

// ============================================================================
// Identifiers - Clone (string-backed)
// ============================================================================

/// Identifier of an independently ordered chain (ledger partition).
///
/// Consensus runs one independent instance per chain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChainId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ChainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a replica in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ReplicaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Sequence Numbers - Copy (4-byte value)
// ============================================================================

/// Per-chain consensus round index.
///
/// Sequence numbers start at 1; [`SeqNo::ZERO`] means "nothing committed yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SeqNo(u32);

impl SeqNo {
    /// The sequence number before the first round.
    pub const ZERO: SeqNo = SeqNo(0);

    pub fn new(seq: u32) -> Self {
        Self(seq)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the following sequence number (saturating).
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns `self + n` (saturating).
    pub fn advance(self, n: u32) -> Self {
        Self(self.0.saturating_add(n))
    }

    /// Number of rounds between `self` and a later `other`; zero if `other` is not later.
    pub fn distance_to(self, other: SeqNo) -> u32 {
        other.0.saturating_sub(self.0)
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNo {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SeqNo> for u32 {
    fn from(seq: SeqNo) -> Self {
        seq.0
    }
}

// ============================================================================
// Digest - Copy (32-byte value)
// ============================================================================

/// Length of a content digest in bytes (BLAKE3).
pub const DIGEST_LENGTH: usize = 32;

/// A 32-byte BLAKE3 content hash binding a vote to an exact proposal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// The all-zero digest, used where nothing has been committed yet.
    pub const ZERO: Digest = Digest([0u8; DIGEST_LENGTH]);

    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Hashes arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LENGTH]
    }

    /// First 8 bytes as hex, for log fields.
    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}...)", self.short())
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_no_next_and_distance() {
        let seq = SeqNo::new(7);
        assert_eq!(seq.next(), SeqNo::new(8));
        assert_eq!(seq.distance_to(SeqNo::new(10)), 3);
        assert_eq!(SeqNo::new(10).distance_to(seq), 0);
        assert_eq!(SeqNo::new(u32::MAX).next(), SeqNo::new(u32::MAX));
    }

    #[test]
    fn digest_display_is_full_hex() {
        let digest = Digest::of(b"lbft");
        assert_eq!(digest.to_string().len(), DIGEST_LENGTH * 2);
        assert!(digest.to_string().starts_with(&digest.short()));
        assert!(!digest.is_zero());
        assert!(Digest::default().is_zero());
    }

    #[test]
    fn identifiers_serialize_as_plain_strings() {
        let chain = ChainId::from("X");
        let json = serde_json::to_string(&chain).unwrap();
        assert_eq!(json, "\"X\"");

        let replica: ReplicaId = serde_json::from_str("\"node-1\"").unwrap();
        assert_eq!(replica.as_str(), "node-1");
    }
}
