//! Tagged control datagrams exchanged while punching.
//!
//! Layout: 4-byte magic, 1-byte kind, 16-byte attempt token. Both sides learn
//! the token through signaling, so stray traffic on a punched port is never
//! mistaken for the peer.

use rand::RngCore;
use std::fmt;

/// Datagram magic
pub const PACKET_MAGIC: [u8; 4] = *b"PNCH";

/// Token length in bytes
pub const TOKEN_LEN: usize = 16;

/// Encoded control datagram length
pub const PACKET_LEN: usize = PACKET_MAGIC.len() + 1 + TOKEN_LEN;

/// Attempt token shared by both sides of a punch
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PunchToken([u8; TOKEN_LEN]);

impl PunchToken {
    /// Generate a random token
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Token from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Lowercase hex form used in signaling payloads
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; TOKEN_LEN];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for PunchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PunchToken({})", &self.to_hex()[..8])
    }
}

impl fmt::Display for PunchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Control datagram kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    /// Sent repeatedly until the peer answers
    Punch = 1,
    /// Answer to a received punch
    PunchAck = 2,
    /// Keeps the NAT binding open after establishment
    Keepalive = 3,
    /// Hairpin self-test
    Hairpin = 4,
}

impl PacketKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Punch),
            2 => Some(Self::PunchAck),
            3 => Some(Self::Keepalive),
            4 => Some(Self::Hairpin),
            _ => None,
        }
    }
}

/// Decoded control datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPacket {
    /// Datagram kind
    pub kind: PacketKind,
    /// Attempt token
    pub token: PunchToken,
}

impl ControlPacket {
    /// Create a control packet
    #[must_use]
    pub const fn new(kind: PacketKind, token: PunchToken) -> Self {
        Self { kind, token }
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut out = [0u8; PACKET_LEN];
        out[..4].copy_from_slice(&PACKET_MAGIC);
        out[4] = self.kind as u8;
        out[5..].copy_from_slice(self.token.as_bytes());
        out
    }

    /// Decode a datagram, returning `None` for anything that is not ours
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PACKET_LEN || bytes[..4] != PACKET_MAGIC {
            return None;
        }
        let kind = PacketKind::from_u8(bytes[4])?;
        let mut token = [0u8; TOKEN_LEN];
        token.copy_from_slice(&bytes[5..]);
        Some(Self {
            kind,
            token: PunchToken(token),
        })
    }

    /// Whether this packet belongs to `token`
    #[must_use]
    pub fn matches(&self, token: &PunchToken) -> bool {
        self.token == *token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_layout() {
        let token = PunchToken::from_bytes([0xAB; TOKEN_LEN]);
        let bytes = ControlPacket::new(PacketKind::PunchAck, token).encode();

        assert_eq!(&bytes[..4], b"PNCH");
        assert_eq!(bytes[4], 2);
        assert_eq!(&bytes[5..], &[0xAB; TOKEN_LEN]);
    }

    #[test]
    fn test_decode_rejects_foreign_datagrams() {
        assert!(ControlPacket::decode(b"hello").is_none());

        let mut bytes = ControlPacket::new(PacketKind::Punch, PunchToken::random()).encode();
        bytes[4] = 9;
        assert!(ControlPacket::decode(&bytes).is_none());

        let mut app_data = bytes.to_vec();
        app_data[4] = 1;
        app_data.push(0);
        assert!(ControlPacket::decode(&app_data).is_none());
    }

    #[test]
    fn test_token_hex() {
        let token = PunchToken::random();
        assert_eq!(PunchToken::from_hex(&token.to_hex()), Some(token));
        assert!(PunchToken::from_hex("zz").is_none());
        assert!(PunchToken::from_hex("abcd").is_none());
    }

    #[test]
    fn test_token_matching() {
        let token = PunchToken::random();
        let packet = ControlPacket::new(PacketKind::Punch, token);
        assert!(packet.matches(&token));
        assert!(!packet.matches(&PunchToken::random()));
    }
}
