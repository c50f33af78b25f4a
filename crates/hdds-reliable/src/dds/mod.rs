// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application-facing layer: typed writers/readers, the participant that wires
//! engines to a transport, and the crate error type.

mod participant;
mod reader;
mod writer;

pub use participant::Participant;
pub use reader::{DataReader, Sample};
pub use writer::DataWriter;

use crate::core::guid::GUID;
use crate::reliability::{KeyHash, RejectReason};

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reliable-delivery engine.
///
/// Stale, duplicate and out-of-window protocol traffic is never reported
/// here: it is discarded locally. Lost samples are reported through
/// [`crate::engine::ReaderEvent::SampleLost`], not as an error.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Admission / Blocking
    // ========================================================================
    /// History refused the sample (oversized payload or resource limits).
    Rejected(RejectReason),
    /// A blocking call exceeded its deadline.
    Timeout,

    // ========================================================================
    // Protocol
    // ========================================================================
    /// Malformed or inconsistent submessage. The submessage is dropped.
    ProtocolViolation(String),

    // ========================================================================
    // Configuration / Entity
    // ========================================================================
    /// QoS policy is invalid (e.g. zero depth, depth above per-instance limit).
    InvalidQos(String),
    /// Invalid state for the requested operation.
    InvalidState(String),
    /// Remote endpoint is already matched.
    AlreadyMatched(GUID),
    /// Remote endpoint is not matched.
    NotMatched(GUID),

    // ========================================================================
    // Collaborators
    // ========================================================================
    /// User type serialization failed.
    Serialization(String),
    /// Transport refused the message.
    Transport(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Rejected(reason) => write!(f, "Sample rejected: {}", reason),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Error::InvalidQos(msg) => write!(f, "Invalid QoS: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::AlreadyMatched(guid) => write!(f, "Endpoint already matched: {}", guid),
            Error::NotMatched(guid) => write!(f, "Endpoint not matched: {}", guid),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<RejectReason> for Error {
    fn from(reason: RejectReason) -> Self {
        Error::Rejected(reason)
    }
}

/// Trait for types that can travel through a `DataWriter` / `DataReader`.
///
/// Payload encoding is owned by the type: the engine only moves bytes.
pub trait DDS: Sized + Send + Sync + 'static {
    /// Encode the sample to its wire payload.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the value cannot be represented.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Decode a sample from its wire payload.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the buffer is truncated or contains invalid data.
    fn deserialize(buf: &[u8]) -> Result<Self>;

    /// Instance key. Unkeyed types use the default (all zeros) key.
    fn instance_key(&self) -> KeyHash {
        KeyHash::default()
    }
}

impl DDS for Vec<u8> {
    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        Ok(buf.to_vec())
    }
}

impl DDS for String {
    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.as_bytes().to_vec())
    }

    fn deserialize(buf: &[u8]) -> Result<Self> {
        String::from_utf8(buf.to_vec()).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_rejected() {
        let err = Error::Rejected(RejectReason::MaxSamples);
        assert!(err.to_string().contains("max_samples"));
    }

    #[test]
    fn test_string_roundtrip_through_dds_trait() {
        let value = "temperature=21.5".to_string();
        let bytes = value.serialize().expect("serialize should succeed");
        let decoded = String::deserialize(&bytes).expect("deserialize should succeed");
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_string_deserialize_invalid_utf8() {
        let result = String::deserialize(&[0xff, 0xfe]);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
