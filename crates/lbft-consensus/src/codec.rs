//! Canonical binary encoding for payload bodies.
//!
//! Every payload is serialized with `postcard`, which is deterministic: the
//! same value always produces the same bytes. Decoding rejects trailing
//! bytes so one buffer cannot smuggle a second value past a reader.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::message::MessageType;

/// Errors from encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The envelope carries the reserved `Undefined` type.
    #[error("message type is undefined")]
    Undefined,

    /// The envelope type is outside the known range.
    #[error("unknown message type {0}")]
    UnknownType(u32),

    /// A typed getter was called on an envelope of another type.
    #[error("expected {expected} message, found {actual}")]
    TypeMismatch {
        expected: MessageType,
        actual: MessageType,
    },

    /// The tag embedded in the payload disagrees with the envelope type.
    #[error("payload tagged {embedded} inside a {declared} envelope")]
    TagMismatch { declared: MessageType, embedded: u32 },

    /// Bytes remained after the value was decoded.
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("failed to encode payload: {0}")]
    Encode(#[source] postcard::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] postcard::Error),
}

/// Serializes a value into its canonical byte form.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    postcard::to_allocvec(value)
        .map(Bytes::from)
        .map_err(CodecError::Encode)
}

/// Deserializes a value, rejecting trailing bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, rest) = postcard::take_from_bytes(bytes).map_err(CodecError::Decode)?;
    if !rest.is_empty() {
        return Err(CodecError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

/// Encodes `(tag, body)` so the body carries its own type.
pub(crate) fn encode_tagged<T: Serialize>(tag: MessageType, body: &T) -> Result<Bytes, CodecError> {
    encode(&(u32::from(tag), body))
}

/// Decodes a `(tag, body)` pair after checking the tag against `declared`.
pub(crate) fn decode_tagged<T: DeserializeOwned>(
    declared: MessageType,
    bytes: &[u8],
) -> Result<T, CodecError> {
    let (embedded, body) = postcard::take_from_bytes::<u32>(bytes).map_err(CodecError::Decode)?;
    if embedded != u32::from(declared) {
        return Err(CodecError::TagMismatch { declared, embedded });
    }
    decode(body)
}
