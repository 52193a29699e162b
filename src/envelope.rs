//! The signaling envelope catalogue exchanged over the persistent connection.
//!
//! Every message is a JSON object with a `type` tag. Using a closed enum
//! instead of stringly-typed event names means an unknown or misspelled
//! envelope fails to parse in exactly one place.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub type RoomId = String;
pub type UserId = String;

/// Identifier shared by both peers of a call, generated by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(generate_id("CALL"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-generated key that makes chat message retransmission safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn generate() -> Self {
        Self(generate_id("MSG"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates a unique identifier by hashing the current timestamp plus
/// random bytes, truncated to 18 hex chars under a readable prefix.
fn generate_id(prefix: &str) -> String {
    let mut data = Vec::with_capacity(8 + 16);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    data.extend_from_slice(&timestamp.to_be_bytes());

    let mut random_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut random_bytes);
    data.extend_from_slice(&random_bytes);

    let hash = Sha256::digest(&data);
    format!("{}-{}", prefix, hex::encode(&hash[..9]).to_uppercase())
}

/// Which side of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A peer's offered or accepted media configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A single ICE candidate as relayed between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Why a call ended. Carried on the wire and surfaced to users as a
/// single human-readable string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEndReason {
    Hangup,
    Declined,
    Network,
    Timeout,
    Error,
}

impl CallEndReason {
    pub fn description(&self) -> &'static str {
        match self {
            CallEndReason::Hangup => "call ended",
            CallEndReason::Declined => "call declined",
            CallEndReason::Network => "network connection lost",
            CallEndReason::Timeout => "call timed out",
            CallEndReason::Error => "call failed",
        }
    }
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Everything that can travel over the signaling connection, in either
/// direction. Fields marked `Option` are filled in by the server when it
/// fans an envelope out to room participants (e.g. the sender of a typing
/// notification).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: RoomId,
        idempotency_key: IdempotencyKey,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_seq: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessageAck {
        idempotency_key: IdempotencyKey,
        server_seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    TypingStart {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    #[serde(rename_all = "camelCase")]
    TypingStop {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    #[serde(rename_all = "camelCase")]
    CallOffer {
        session_id: SessionId,
        room_id: RoomId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    CallAnswer {
        session_id: SessionId,
        sdp: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    CallIce {
        session_id: SessionId,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    CallEnd {
        session_id: SessionId,
        reason: CallEndReason,
    },
    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        user_id: UserId,
        status: PresenceStatus,
    },
    #[serde(rename_all = "camelCase")]
    HeartbeatPing { sent_at: i64 },
    #[serde(rename_all = "camelCase")]
    HeartbeatPong { sent_at: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_tags_match_wire_catalogue() {
        let cases: Vec<(Envelope, &str)> = vec![
            (
                Envelope::JoinRoom {
                    room_id: "room-1".into(),
                },
                "join-room",
            ),
            (
                Envelope::ChatMessageAck {
                    idempotency_key: IdempotencyKey::new("k1"),
                    server_seq: 7,
                },
                "chat-message-ack",
            ),
            (
                Envelope::TypingStart {
                    room_id: "room-1".into(),
                    user_id: None,
                },
                "typing-start",
            ),
            (
                Envelope::CallIce {
                    session_id: SessionId::new("s1"),
                    candidate: IceCandidate {
                        candidate: "candidate:0 1 UDP 1 10.0.0.1 50000 typ host".into(),
                        sdp_mid: Some("0".into()),
                        sdp_mline_index: Some(0),
                    },
                },
                "call-ice",
            ),
            (Envelope::HeartbeatPing { sent_at: 123 }, "heartbeat-ping"),
        ];

        for (envelope, tag) in cases {
            let json = serde_json::to_value(&envelope).unwrap();
            assert_eq!(json["type"], tag, "wrong tag for {envelope:?}");
        }
    }

    #[test]
    fn test_field_names_are_camel_case() {
        let envelope = Envelope::ChatMessage {
            room_id: "room-1".into(),
            idempotency_key: IdempotencyKey::new("key-1"),
            content: "hello".into(),
            sender_id: None,
            server_seq: None,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("roomId").is_some());
        assert!(json.get("idempotencyKey").is_some());
        assert!(json.get("senderId").is_none(), "None fields must be omitted");
    }

    #[test]
    fn test_round_trip() {
        let envelope = Envelope::CallOffer {
            session_id: SessionId::generate(),
            room_id: "room-9".into(),
            sdp: SessionDescription::offer("v=0\r\n"),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_malformed_envelope_is_an_error() {
        assert!(serde_json::from_str::<Envelope>(r#"{"type":"no-such-thing"}"#).is_err());
        assert!(serde_json::from_str::<Envelope>(r#"{"roomId":"x"}"#).is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = IdempotencyKey::generate();
        let b = IdempotencyKey::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("MSG-"));
        assert!(SessionId::generate().as_str().starts_with("CALL-"));
    }
}
