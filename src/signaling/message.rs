//! Wire envelope for relay signaling.
//!
//! The relay vocabulary is deliberately small: five message types are enough
//! for two-party call setup and teardown. Frames are JSON text; payloads
//! (session descriptions, network candidates) stay opaque to this layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Message type tag. `store_user` registers an identity with the relay;
/// the rest are directed at a named peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    StoreUser,
    Offer,
    Answer,
    IceCandidate,
    EndCall,
}

impl MessageType {
    /// Parse the wire tag.
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "store_user" => Some(Self::StoreUser),
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice_candidate" => Some(Self::IceCandidate),
            "end_call" => Some(Self::EndCall),
            _ => None,
        }
    }

    /// Whether this type carries a mandatory payload.
    fn requires_payload(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    fn tag(self) -> &'static str {
        match self {
            Self::StoreUser => "store_user",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice_candidate",
            Self::EndCall => "end_call",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Failure to turn an inbound frame into a message. The channel logs these
/// and drops the frame; the connection stays open.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no usable `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("`{0}` message without payload")]
    MissingPayload(MessageType),
}

/// One signaling frame. Immutable; constructed per send/receive and
/// discarded after dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Sender identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Recipient identity (absent for `store_user`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Session description or network candidate, opaque to this layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SignalingMessage {
    /// Registration message, sent once after every successful connect.
    pub fn store_user(name: impl Into<String>) -> Self {
        Self {
            kind: MessageType::StoreUser,
            name: Some(name.into()),
            target: None,
            payload: None,
        }
    }

    pub fn offer(name: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self::directed(MessageType::Offer, name, target, Some(payload))
    }

    pub fn answer(name: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self::directed(MessageType::Answer, name, target, Some(payload))
    }

    pub fn ice_candidate(
        name: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::directed(MessageType::IceCandidate, name, target, Some(payload))
    }

    pub fn end_call(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::directed(MessageType::EndCall, name, target, None)
    }

    fn directed(
        kind: MessageType,
        name: impl Into<String>,
        target: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            kind,
            name: Some(name.into()),
            target: Some(target.into()),
            payload,
        }
    }

    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a wire frame, validating the type tag and payload presence.
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(frame)?;

        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let kind = MessageType::from_tag(tag)
            .ok_or_else(|| DecodeError::UnknownType(tag.to_string()))?;

        let message: SignalingMessage = serde_json::from_value(value)?;
        if kind.requires_payload() && message.payload.is_none() {
            return Err(DecodeError::MissingPayload(kind));
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_all_types() {
        let messages = [
            SignalingMessage::store_user("alice"),
            SignalingMessage::offer("alice", "bob", json!({"type": "offer", "sdp": "v=0"})),
            SignalingMessage::answer("bob", "alice", json!({"type": "answer", "sdp": "v=0"})),
            SignalingMessage::ice_candidate("alice", "bob", json!({"candidate": "candidate:1"})),
            SignalingMessage::end_call("alice", "bob"),
        ];

        for message in messages {
            let frame = message.encode().unwrap();
            let decoded = SignalingMessage::decode(&frame).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_decode_missing_type() {
        let err = SignalingMessage::decode(r#"{"name":"alice"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingType));

        // Non-string type tags are equally unusable.
        let err = SignalingMessage::decode(r#"{"type":5,"name":"alice"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingType));
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = SignalingMessage::decode(r#"{"type":"broadcast","name":"alice"}"#).unwrap_err();
        match err {
            DecodeError::UnknownType(tag) => assert_eq!(tag, "broadcast"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed_json() {
        let err = SignalingMessage::decode("{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_offer_without_payload() {
        let err =
            SignalingMessage::decode(r#"{"type":"offer","name":"alice","target":"bob"}"#)
                .unwrap_err();
        assert!(matches!(err, DecodeError::MissingPayload(MessageType::Offer)));
    }

    #[test]
    fn test_decode_end_call_without_payload_is_fine() {
        let message =
            SignalingMessage::decode(r#"{"type":"end_call","name":"alice","target":"bob"}"#)
                .unwrap();
        assert_eq!(message.kind, MessageType::EndCall);
        assert_eq!(message.payload, None);
    }

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        let message = SignalingMessage::decode(
            r#"{"type":"store_user","name":"alice","extra":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(message, SignalingMessage::store_user("alice"));
    }

    #[test]
    fn test_store_user_omits_absent_fields() {
        let frame = SignalingMessage::store_user("alice").encode().unwrap();
        assert!(!frame.contains("target"));
        assert!(!frame.contains("payload"));
    }
}
