//! # Message Envelope and Framing Primitives
//!
//! This module defines the single message format carried between the broker
//! and every child process. It is intentionally minimal: the payload is
//! opaque to the core, and only the envelope fields needed for routing and
//! correlation are interpreted here.
//!
//! ## Framing
//!
//! On the wire, one marshaled envelope occupies exactly one line: the
//! serialized form followed by `\n`. [`Message::marshal`] rejects payloads
//! whose encoding would embed a newline, and [`Message::unmarshal`] never
//! panics on malformed input — parse failures come back as a typed error so
//! a read loop can log and keep going rather than be poisoned by one bad
//! frame.

use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};

/// Classification of a [`Message`], mirroring the four message kinds the
/// broker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A message awaiting a correlated response.
    Request,
    /// A message answering a prior `Request`, carrying its `correlation_id`.
    Response,
    /// A fire-and-forget notification; never answered.
    Event,
    /// An error answering a prior `Request`, carrying its `correlation_id`.
    Error,
}

/// The broker's single wire-level envelope.
///
/// `id` doubles as the RPC method name when a `Request` targets `"broker"`
/// (see the router); for other messages it is simply an application-assigned
/// identifier and is not guaranteed globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub correlation_id: String,
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    /// Construct a `request` message, serializing `payload` to bytes.
    pub fn new_request<T: Serialize>(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: &T,
    ) -> BrokerResult<Self> {
        Self::new_with_payload(
            MessageType::Request,
            id,
            source,
            target,
            correlation_id,
            payload,
        )
    }

    /// Construct a `response` message. Callers are responsible for carrying
    /// forward the originating request's `correlation_id` (see invariant in
    /// §3 of the design).
    pub fn new_response<T: Serialize>(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: &T,
    ) -> BrokerResult<Self> {
        Self::new_with_payload(
            MessageType::Response,
            id,
            source,
            target,
            correlation_id,
            payload,
        )
    }

    /// Construct an `event` message (no response expected, no correlation).
    pub fn new_event<T: Serialize>(
        id: impl Into<String>,
        source: impl Into<String>,
        payload: &T,
    ) -> BrokerResult<Self> {
        Self::new_with_payload(MessageType::Event, id, source, "", "", payload)
    }

    /// Construct an `error` message answering `correlation_id`. Infallible:
    /// the payload is always an empty byte string and the human-readable
    /// text lives in `error`.
    pub fn new_error(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        correlation_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            message_type: MessageType::Error,
            id: id.into(),
            source: source.into(),
            target: target.into(),
            correlation_id: correlation_id.into(),
            payload: Vec::new(),
            error: Some(error.into()),
        }
    }

    fn new_with_payload<T: Serialize>(
        message_type: MessageType,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: &T,
    ) -> BrokerResult<Self> {
        let payload = serde_json::to_vec(payload)
            .map_err(|e| BrokerError::invalid_argument(format!("payload encoding: {e}")))?;
        Ok(Self {
            message_type,
            id: id.into(),
            source: source.into(),
            target: target.into(),
            correlation_id: correlation_id.into(),
            payload,
            error: None,
        })
    }

    /// Deserialize `payload` as `T`.
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> BrokerResult<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| BrokerError::invalid_argument(format!("payload decoding: {e}")))
    }

    /// Serialize the envelope to its wire representation (without the
    /// trailing newline terminator the transport appends).
    ///
    /// Rejects any encoding that would embed a literal newline, preserving
    /// the framing invariant that one envelope occupies exactly one line.
    pub fn marshal(&self) -> BrokerResult<Vec<u8>> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| BrokerError::transport_io(format!("marshal failed: {e}")))?;
        if bytes.contains(&b'\n') {
            return Err(BrokerError::transport_io(
                "marshaled message contains an embedded newline",
            ));
        }
        Ok(bytes)
    }

    /// Reconstruct a `Message` from its wire representation.
    pub fn unmarshal(bytes: &[u8]) -> BrokerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| BrokerError::transport_io(format!("unmarshal failed: {e}")))
    }

    /// Approximate wire size: the serialized form plus the newline
    /// terminator, matching the `wireSize` convention used by the optimizer
    /// metrics.
    pub fn wire_size(&self) -> BrokerResult<usize> {
        Ok(self.marshal()?.len() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_all_fields() {
        let msg = Message::new_request("RPCGetMessageCount", "src", "broker", "corr-1", &json!({}))
            .unwrap();
        let bytes = msg.marshal().unwrap();
        let decoded = Message::unmarshal(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn response_and_error_carry_correlation_id() {
        let response = Message::new_response("m1", "t", "src", "corr-7", &json!({"ok": true}))
            .unwrap();
        assert_eq!(response.correlation_id, "corr-7");

        let error = Message::new_error("m1", "broker", "src", "corr-7", "boom");
        assert_eq!(error.correlation_id, "corr-7");
        assert_eq!(error.error.as_deref(), Some("boom"));
        assert_eq!(error.message_type, MessageType::Error);
    }

    #[test]
    fn unmarshal_of_garbage_is_a_typed_error_not_a_panic() {
        let err = Message::unmarshal(b"not json at all").unwrap_err();
        assert!(matches!(err, BrokerError::TransportIo(_)));
    }

    #[test]
    fn decode_payload_round_trips_typed_values() {
        let msg = Message::new_event("process_exited", "broker", &json!({"id": "p1", "pid": 42, "exit_code": 0})).unwrap();
        let decoded: serde_json::Value = msg.decode_payload().unwrap();
        assert_eq!(decoded["id"], "p1");
        assert_eq!(decoded["pid"], 42);
    }

    #[test]
    fn wire_size_accounts_for_terminator() {
        let msg = Message::new_event("e", "broker", &json!(null)).unwrap();
        let marshaled_len = msg.marshal().unwrap().len();
        assert_eq!(msg.wire_size().unwrap(), marshaled_len + 1);
    }
}
