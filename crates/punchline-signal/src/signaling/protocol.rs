//! Signaling protocol message definitions.
//!
//! Messages are JSON objects tagged by a kebab-case `type` field with
//! camelCase members, carried one per WebSocket text frame.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque peer metadata
pub type Metadata = Map<String, Value>;

/// Addressed payload forwarded verbatim by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Sender, stamped by the relay on delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Target peer
    pub to: String,
    /// Uninterpreted payload
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Envelope addressed to `to`
    #[must_use]
    pub fn new(to: impl Into<String>, payload: Value) -> Self {
        Self {
            from: None,
            to: to.into(),
            payload,
        }
    }
}

/// Directed message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectedKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
    /// Connectivity candidate
    IceCandidate,
    /// Free-form signal
    Signal,
}

impl DirectedKind {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Signal => "signal",
        }
    }

    /// Wrap an envelope as a client request
    #[must_use]
    pub fn request(self, envelope: Envelope) -> ClientMessage {
        match self {
            Self::Offer => ClientMessage::Offer(envelope),
            Self::Answer => ClientMessage::Answer(envelope),
            Self::IceCandidate => ClientMessage::IceCandidate(envelope),
            Self::Signal => ClientMessage::Signal(envelope),
        }
    }

    /// Wrap an envelope as a relay delivery
    #[must_use]
    pub fn delivery(self, envelope: Envelope) -> ServerMessage {
        match self {
            Self::Offer => ServerMessage::Offer(envelope),
            Self::Answer => ServerMessage::Answer(envelope),
            Self::IceCandidate => ServerMessage::IceCandidate(envelope),
            Self::Signal => ServerMessage::Signal(envelope),
        }
    }
}

impl fmt::Display for DirectedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent by peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind a peer identity to this connection
    Register {
        /// Caller-chosen unique identifier
        peer_id: String,
        /// Metadata merged into any existing entry
        #[serde(default)]
        metadata: Metadata,
    },
    /// Join a room
    JoinRoom {
        /// Room name
        room_id: String,
    },
    /// Leave a room
    LeaveRoom {
        /// Room name
        room_id: String,
    },
    /// Directed offer
    Offer(Envelope),
    /// Directed answer
    Answer(Envelope),
    /// Directed candidate
    IceCandidate(Envelope),
    /// Directed free-form signal
    Signal(Envelope),
    /// Fan-out to every other member of a room
    Broadcast {
        /// Room name
        room_id: String,
        /// Uninterpreted data
        #[serde(default)]
        data: Value,
    },
    /// Liveness probe, answered with `pong`
    Ping {
        /// Echoed back untouched when present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientMessage {
    /// Wire name of the message type
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::JoinRoom { .. } => "join-room",
            Self::LeaveRoom { .. } => "leave-room",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Signal(_) => "signal",
            Self::Broadcast { .. } => "broadcast",
            Self::Ping { .. } => "ping",
        }
    }
}

/// Peer projection exposed to other peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    /// Peer identifier
    pub peer_id: String,
    /// Peer metadata
    #[serde(default)]
    pub metadata: Metadata,
}

/// Error codes carried by `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Connection has no registered peer
    NotRegistered,
    /// Directed target is not registered
    PeerNotFound,
    /// Peer is not a member of the named room
    NotInRoom,
    /// Named room does not exist
    RoomNotFound,
    /// Message could not be parsed or has invalid fields
    InvalidMessage,
    /// Peer identifier is empty
    InvalidPeerId,
    /// Registry is at capacity
    ServerFull,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotRegistered => "not-registered",
            Self::PeerNotFound => "peer-not-found",
            Self::NotInRoom => "not-in-room",
            Self::RoomNotFound => "room-not-found",
            Self::InvalidMessage => "invalid-message",
            Self::InvalidPeerId => "invalid-peer-id",
            Self::ServerFull => "server-full",
        };
        f.write_str(name)
    }
}

/// Messages sent by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection
    Welcome {
        /// Relay-assigned connection identifier
        connection_id: u64,
    },
    /// Registration accepted
    Registered {
        /// Bound identifier
        peer_id: String,
        /// Metadata after merging
        metadata: Metadata,
    },
    /// Join accepted; lists the members present before the joiner
    RoomJoined {
        /// Room name
        room_id: String,
        /// Existing members
        peers: Vec<PeerSummary>,
    },
    /// Another peer joined a room we are in
    PeerJoined {
        /// Room name
        room_id: String,
        /// The new member
        peer: PeerSummary,
    },
    /// A peer left a room we are in
    PeerLeft {
        /// Room name
        room_id: String,
        /// The departed member
        peer_id: String,
    },
    /// Forwarded offer
    Offer(Envelope),
    /// Forwarded answer
    Answer(Envelope),
    /// Forwarded candidate
    IceCandidate(Envelope),
    /// Forwarded signal
    Signal(Envelope),
    /// Room fan-out
    Broadcast {
        /// Room name
        room_id: String,
        /// Sender
        from: String,
        /// Uninterpreted data
        data: Value,
    },
    /// Answer to `ping`
    Pong {
        /// Client timestamp if supplied, otherwise relay time in ms
        timestamp: u64,
    },
    /// Request rejected
    Error {
        /// Stable error code
        code: ErrorCode,
        /// Human-readable description
        message: String,
        /// Type of the rejected request
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
    },
    /// Relay is stopping; the connection closes next
    ServerShutdown {
        /// Why the relay is stopping
        #[serde(default)]
        reason: String,
    },
}

impl ServerMessage {
    /// Wire name of the message type
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Registered { .. } => "registered",
            Self::RoomJoined { .. } => "room-joined",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice-candidate",
            Self::Signal(_) => "signal",
            Self::Broadcast { .. } => "broadcast",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::ServerShutdown { .. } => "server-shutdown",
        }
    }

    /// Split a forwarded directed message into kind and envelope
    ///
    /// # Errors
    ///
    /// Returns the message unchanged when it is not a directed delivery.
    pub fn into_directed(self) -> Result<(DirectedKind, Envelope), Self> {
        match self {
            Self::Offer(env) => Ok((DirectedKind::Offer, env)),
            Self::Answer(env) => Ok((DirectedKind::Answer, env)),
            Self::IceCandidate(env) => Ok((DirectedKind::IceCandidate, env)),
            Self::Signal(env) => Ok((DirectedKind::Signal, env)),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_wire_format() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "register",
            "peerId": "alice",
            "metadata": { "role": "seeder" }
        }))
        .unwrap();

        match &msg {
            ClientMessage::Register { peer_id, metadata } => {
                assert_eq!(peer_id, "alice");
                assert_eq!(metadata["role"], "seeder");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(msg.message_type(), "register");
    }

    #[test]
    fn test_register_without_metadata() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"register","peerId":"bob"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Register {
                peer_id: "bob".into(),
                metadata: Metadata::new()
            }
        );
    }

    #[test]
    fn test_directed_envelope_is_flat() {
        let msg = DirectedKind::IceCandidate.request(Envelope::new("bob", json!({"c": 1})));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({ "type": "ice-candidate", "to": "bob", "payload": { "c": 1 } })
        );
    }

    #[test]
    fn test_server_message_field_casing() {
        let value = serde_json::to_value(ServerMessage::Error {
            code: ErrorCode::PeerNotFound,
            message: "peer carol is not registered".into(),
            request_type: Some("offer".into()),
        })
        .unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "peer-not-found");
        assert_eq!(value["requestType"], "offer");

        let value = serde_json::to_value(ServerMessage::Welcome { connection_id: 7 }).unwrap();
        assert_eq!(value, json!({ "type": "welcome", "connectionId": 7 }));

        let value = serde_json::to_value(ServerMessage::ServerShutdown {
            reason: "maintenance".into(),
        })
        .unwrap();
        assert_eq!(value["type"], "server-shutdown");
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"peerId":"x"}"#).is_err());
    }

    #[test]
    fn test_into_directed() {
        let env = Envelope {
            from: Some("alice".into()),
            to: "bob".into(),
            payload: json!("sdp"),
        };
        let (kind, back) = ServerMessage::Answer(env.clone()).into_directed().unwrap();
        assert_eq!(kind, DirectedKind::Answer);
        assert_eq!(back, env);
        assert!(ServerMessage::Pong { timestamp: 1 }.into_directed().is_err());
    }
}
