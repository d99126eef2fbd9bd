//! Protocol messages.
//!
//! ## Ordering
//! - [`Request`] - Any → Primary: order this batch
//! - [`PrePrepare`] - Primary → All: batch proposed at a sequence number
//! - [`Prepare`] - All → All: I accept the proposal's digest
//! - [`Commit`] - All → All: I saw a prepare quorum for the digest
//!
//! ## Catch-up
//! - [`Committed`] - Replica → All/Requester: this entry is durably committed
//! - [`FetchCommitted`] - Lagging → All: send me the entry at this sequence number
//!
//! ## View Change
//! - [`ViewChange`] - All → All: I suspect the primary; here is my candidacy
//!
//! On the wire every message travels as a [`Message`] envelope: a numeric
//! [`MessageType`] plus an opaque, self-tagged payload. Decoding is
//! fallible; a malformed payload is an error for the caller to drop, never a
//! crash.

use std::fmt::Display;

use bytes::Bytes;
use lbft_types::{ChainId, Digest, ReplicaId, Request, SeqNo};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};

// ============================================================================
// Message Type
// ============================================================================

/// Numeric message kind carried by the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum MessageType {
    Undefined = 0,
    Request = 1,
    PrePrepare = 2,
    Prepare = 3,
    Commit = 4,
    Committed = 5,
    FetchCommitted = 6,
    ViewChange = 7,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Request => "Request",
            Self::PrePrepare => "PrePrepare",
            Self::Prepare => "Prepare",
            Self::Commit => "Commit",
            Self::Committed => "Committed",
            Self::FetchCommitted => "FetchCommitted",
            Self::ViewChange => "ViewChange",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<MessageType> for u32 {
    fn from(kind: MessageType) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for MessageType {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Undefined,
            1 => Self::Request,
            2 => Self::PrePrepare,
            3 => Self::Prepare,
            4 => Self::Commit,
            5 => Self::Committed,
            6 => Self::FetchCommitted,
            7 => Self::ViewChange,
            other => return Err(CodecError::UnknownType(other)),
        })
    }
}

// ============================================================================
// Payload Structs
// ============================================================================

/// Primary → All: proposes `request` at `seq_no`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub primary_id: ReplicaId,
    pub seq_no: SeqNo,
    /// Quorum size the sender operates under.
    pub quorum: u32,
    pub request: Request,
    pub chain: ChainId,
    pub replica_id: ReplicaId,
}

/// All → All: first-phase vote for a proposal's digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub primary_id: ReplicaId,
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub quorum: u32,
    pub chain: ChainId,
    pub replica_id: ReplicaId,
}

/// All → All: second-phase vote, sent once a prepare quorum is observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub primary_id: ReplicaId,
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub quorum: u32,
    pub chain: ChainId,
    pub replica_id: ReplicaId,
}

/// A durably committed sequence entry.
///
/// Broadcast after a local commit, and sent point-to-point in answer to
/// [`FetchCommitted`] or to stale votes for an already committed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub seq_no: SeqNo,
    pub request: Request,
    pub chain: ChainId,
    pub replica_id: ReplicaId,
}

impl Committed {
    pub fn digest(&self) -> Digest {
        self.request.digest()
    }
}

/// Lagging replica → All: asks for the committed entry at `seq_no`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCommitted {
    pub seq_no: SeqNo,
    pub chain: ChainId,
    pub replica_id: ReplicaId,
}

/// All → All: vote to replace `primary_id`, carrying the voter's candidacy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// Candidate identity; must equal `replica_id`.
    pub id: ReplicaId,
    /// Candidacy priority; the highest eligible priority wins.
    pub priority: i64,
    /// The primary being replaced.
    pub primary_id: ReplicaId,
    /// Voter's last durably committed sequence number.
    pub seq_no: SeqNo,
    /// Height of the voter's last committed batch.
    pub height: u32,
    /// Digest of the voter's last committed batch.
    pub hash: Digest,
    pub replica_id: ReplicaId,
    pub chain: ChainId,
}

// ============================================================================
// Typed Payload
// ============================================================================

/// A decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Request(Request),
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    Committed(Committed),
    FetchCommitted(FetchCommitted),
    ViewChange(ViewChange),
}

impl MessagePayload {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::PrePrepare(_) => MessageType::PrePrepare,
            Self::Prepare(_) => MessageType::Prepare,
            Self::Commit(_) => MessageType::Commit,
            Self::Committed(_) => MessageType::Committed,
            Self::FetchCommitted(_) => MessageType::FetchCommitted,
            Self::ViewChange(_) => MessageType::ViewChange,
        }
    }

    /// Returns the message type name for logging.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Chain the message belongs to.
    ///
    /// Requests carry no chain field; they are routed by their
    /// transactions' source and destination chains.
    pub fn chain(&self) -> Option<&ChainId> {
        match self {
            Self::Request(_) => None,
            Self::PrePrepare(m) => Some(&m.chain),
            Self::Prepare(m) => Some(&m.chain),
            Self::Commit(m) => Some(&m.chain),
            Self::Committed(m) => Some(&m.chain),
            Self::FetchCommitted(m) => Some(&m.chain),
            Self::ViewChange(m) => Some(&m.chain),
        }
    }

    /// Replica the payload claims to come from.
    pub fn replica_id(&self) -> Option<&ReplicaId> {
        match self {
            Self::Request(_) => None,
            Self::PrePrepare(m) => Some(&m.replica_id),
            Self::Prepare(m) => Some(&m.replica_id),
            Self::Commit(m) => Some(&m.replica_id),
            Self::Committed(m) => Some(&m.replica_id),
            Self::FetchCommitted(m) => Some(&m.replica_id),
            Self::ViewChange(m) => Some(&m.replica_id),
        }
    }

    pub fn seq_no(&self) -> Option<SeqNo> {
        match self {
            Self::Request(_) => None,
            Self::PrePrepare(m) => Some(m.seq_no),
            Self::Prepare(m) => Some(m.seq_no),
            Self::Commit(m) => Some(m.seq_no),
            Self::Committed(m) => Some(m.seq_no),
            Self::FetchCommitted(m) => Some(m.seq_no),
            Self::ViewChange(m) => Some(m.seq_no),
        }
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// Wire envelope: a type tag and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Bytes,
}

macro_rules! typed_getter {
    ($(#[$doc:meta])* $fn_name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $fn_name(&self) -> Result<$ty, CodecError> {
            self.expect_kind(MessageType::$variant)?;
            codec::decode_tagged(self.kind, &self.payload)
        }
    };
}

impl Message {
    /// Wraps a typed payload in an envelope.
    pub fn encode(payload: &MessagePayload) -> Result<Self, CodecError> {
        let kind = payload.kind();
        let bytes = match payload {
            MessagePayload::Request(m) => codec::encode_tagged(kind, m),
            MessagePayload::PrePrepare(m) => codec::encode_tagged(kind, m),
            MessagePayload::Prepare(m) => codec::encode_tagged(kind, m),
            MessagePayload::Commit(m) => codec::encode_tagged(kind, m),
            MessagePayload::Committed(m) => codec::encode_tagged(kind, m),
            MessagePayload::FetchCommitted(m) => codec::encode_tagged(kind, m),
            MessagePayload::ViewChange(m) => codec::encode_tagged(kind, m),
        }?;
        Ok(Self {
            kind,
            payload: bytes,
        })
    }

    /// Decodes the payload according to the envelope type.
    pub fn decode(&self) -> Result<MessagePayload, CodecError> {
        Ok(match self.kind {
            MessageType::Undefined => return Err(CodecError::Undefined),
            MessageType::Request => MessagePayload::Request(self.request()?),
            MessageType::PrePrepare => MessagePayload::PrePrepare(self.pre_prepare()?),
            MessageType::Prepare => MessagePayload::Prepare(self.prepare()?),
            MessageType::Commit => MessagePayload::Commit(self.commit()?),
            MessageType::Committed => MessagePayload::Committed(self.committed()?),
            MessageType::FetchCommitted => {
                MessagePayload::FetchCommitted(self.fetch_committed()?)
            }
            MessageType::ViewChange => MessagePayload::ViewChange(self.view_change()?),
        })
    }

    typed_getter!(
        /// Decodes a `Request` payload.
        request, Request, Request
    );
    typed_getter!(pre_prepare, PrePrepare, PrePrepare);
    typed_getter!(prepare, Prepare, Prepare);
    typed_getter!(commit, Commit, Commit);
    typed_getter!(committed, Committed, Committed);
    typed_getter!(fetch_committed, FetchCommitted, FetchCommitted);
    typed_getter!(view_change, ViewChange, ViewChange);

    /// Serializes the whole envelope for a byte-oriented transport.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        codec::encode(self)
    }

    /// Parses an envelope; the payload stays undecoded.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }

    fn expect_kind(&self, expected: MessageType) -> Result<(), CodecError> {
        match self.kind {
            MessageType::Undefined => Err(CodecError::Undefined),
            actual if actual == expected => Ok(()),
            actual => Err(CodecError::TypeMismatch { expected, actual }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbft_types::Transaction;
    use test_case::test_case;

    fn request() -> Request {
        Request::new(1, 100, 7, vec![Transaction::new("X", "Y", 0, vec![1, 2, 3])])
    }

    fn prepare() -> Prepare {
        Prepare {
            primary_id: "p".into(),
            seq_no: SeqNo::new(4),
            digest: request().digest(),
            quorum: 3,
            chain: "X".into(),
            replica_id: "a".into(),
        }
    }

    #[test]
    fn envelope_roundtrip_preserves_payload() {
        let payload = MessagePayload::Prepare(prepare());
        let message = Message::encode(&payload).unwrap();
        assert_eq!(message.kind, MessageType::Prepare);

        let wire = message.to_bytes().unwrap();
        let parsed = Message::from_bytes(&wire).unwrap();
        assert_eq!(parsed.decode().unwrap(), payload);
    }

    #[test]
    fn wrong_getter_is_a_type_mismatch() {
        let message = Message::encode(&MessagePayload::Prepare(prepare())).unwrap();
        assert!(matches!(
            message.commit(),
            Err(CodecError::TypeMismatch {
                expected: MessageType::Commit,
                actual: MessageType::Prepare,
            })
        ));
    }

    #[test]
    fn relabelled_envelope_is_rejected() {
        // Prepare and Commit share a layout; only the embedded tag tells them apart.
        let mut message = Message::encode(&MessagePayload::Prepare(prepare())).unwrap();
        message.kind = MessageType::Commit;
        assert!(matches!(
            message.decode(),
            Err(CodecError::TagMismatch { .. })
        ));
    }

    #[test]
    fn undefined_type_never_decodes() {
        let message = Message {
            kind: MessageType::Undefined,
            payload: Bytes::new(),
        };
        assert!(matches!(message.decode(), Err(CodecError::Undefined)));
        assert!(matches!(message.request(), Err(CodecError::Undefined)));
    }

    #[test]
    fn garbage_payload_is_an_error_not_a_panic() {
        let message = Message {
            kind: MessageType::PrePrepare,
            payload: Bytes::from_static(&[2, 0xff, 0xff, 0xff]),
        };
        assert!(message.decode().is_err());
    }

    #[test_case(0, Some(MessageType::Undefined); "undefined")]
    #[test_case(1, Some(MessageType::Request); "request")]
    #[test_case(5, Some(MessageType::Committed); "committed")]
    #[test_case(7, Some(MessageType::ViewChange); "view change")]
    #[test_case(8, None; "out of range")]
    fn message_type_from_u32(raw: u32, expected: Option<MessageType>) {
        assert_eq!(MessageType::try_from(raw).ok(), expected);
    }

    #[test]
    fn unknown_type_on_the_wire_is_rejected() {
        let mut wire = Message::encode(&MessagePayload::Request(request()))
            .unwrap()
            .to_bytes()
            .unwrap()
            .to_vec();
        wire[0] = 42;
        assert!(Message::from_bytes(&wire).is_err());
    }

    #[test]
    fn payload_accessors() {
        let payload = MessagePayload::Prepare(prepare());
        assert_eq!(payload.chain(), Some(&ChainId::from("X")));
        assert_eq!(payload.replica_id(), Some(&ReplicaId::from("a")));
        assert_eq!(payload.seq_no(), Some(SeqNo::new(4)));
        assert_eq!(MessagePayload::Request(request()).chain(), None);
    }
}
