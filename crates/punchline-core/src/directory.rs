//! Remote peers learned from room notices.
//!
//! Peers publish their addressing inside registration metadata under
//! [`PUBLIC_ENDPOINT_KEY`] and [`NAT_INFO_KEY`]. An entry lives as long as we
//! share at least one room with the peer.

use punchline_nat::{NatInfo, NatType};
use punchline_signal::signaling::{Metadata, PeerSummary};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Metadata key carrying the `ip:port` a peer can be punched at
pub const PUBLIC_ENDPOINT_KEY: &str = "publicEndpoint";

/// Metadata key carrying the peer's [`NatInfo`]
pub const NAT_INFO_KEY: &str = "natInfo";

/// Add our addressing to registration metadata
#[must_use]
pub fn advertise(mut metadata: Metadata, endpoint: SocketAddr, nat: &NatInfo) -> Metadata {
    metadata.insert(
        PUBLIC_ENDPOINT_KEY.to_string(),
        Value::String(endpoint.to_string()),
    );
    match serde_json::to_value(nat) {
        Ok(value) => {
            metadata.insert(NAT_INFO_KEY.to_string(), value);
        }
        Err(e) => debug!("not publishing NAT info: {e}"),
    }
    metadata
}

/// What we know about a remote peer
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    /// Peer identifier
    pub peer_id: String,
    /// Last metadata seen
    pub metadata: Metadata,
    /// Published public endpoint
    pub endpoint: Option<SocketAddr>,
    /// Published NAT behavior
    pub nat: Option<NatInfo>,
    rooms: BTreeSet<String>,
}

impl RemotePeer {
    fn from_metadata(peer_id: &str, metadata: Metadata) -> Self {
        let endpoint = metadata
            .get(PUBLIC_ENDPOINT_KEY)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let nat = metadata
            .get(NAT_INFO_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok());
        if endpoint.is_none() {
            trace!("peer {peer_id} published no usable {PUBLIC_ENDPOINT_KEY}");
        }
        Self {
            peer_id: peer_id.to_string(),
            metadata,
            endpoint,
            nat,
            rooms: BTreeSet::new(),
        }
    }

    /// Published NAT type, `Unknown` when absent
    #[must_use]
    pub fn nat_type(&self) -> NatType {
        self.nat.as_ref().map_or(NatType::Unknown, |nat| nat.nat_type)
    }

    /// Rooms we share with the peer
    pub fn rooms(&self) -> impl Iterator<Item = &str> {
        self.rooms.iter().map(String::as_str)
    }
}

/// Directory of peers in our rooms
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<String, RemotePeer>,
}

impl PeerDirectory {
    /// Empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `summary` as a member of `room_id`, replacing its metadata
    pub fn upsert(&mut self, room_id: &str, summary: &PeerSummary) {
        let mut peer = RemotePeer::from_metadata(&summary.peer_id, summary.metadata.clone());
        if let Some(previous) = self.peers.remove(&summary.peer_id) {
            peer.rooms = previous.rooms;
            if peer.endpoint.is_none() {
                peer.endpoint = previous.endpoint;
            }
        }
        peer.rooms.insert(room_id.to_string());
        self.peers.insert(summary.peer_id.clone(), peer);
    }

    /// Remove `peer_id` from `room_id`; returns whether the entry is gone
    pub fn depart(&mut self, room_id: &str, peer_id: &str) -> bool {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return false;
        };
        peer.rooms.remove(room_id);
        if peer.rooms.is_empty() {
            self.peers.remove(peer_id);
            true
        } else {
            false
        }
    }

    /// Forget every membership in `room_id`
    pub fn forget_room(&mut self, room_id: &str) {
        self.peers.retain(|_, peer| {
            peer.rooms.remove(room_id);
            !peer.rooms.is_empty()
        });
    }

    /// Refresh a known peer's addressing from a punch announcement
    pub fn observe(&mut self, peer_id: &str, endpoint: SocketAddr, nat: Option<NatInfo>) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.endpoint = Some(endpoint);
            if nat.is_some() {
                peer.nat = nat;
            }
        }
    }

    /// Look up a peer
    #[must_use]
    pub fn get(&self, peer_id: &str) -> Option<&RemotePeer> {
        self.peers.get(peer_id)
    }

    /// Every known peer id
    #[must_use]
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary(peer_id: &str, endpoint: Option<&str>) -> PeerSummary {
        let mut metadata = Metadata::new();
        if let Some(endpoint) = endpoint {
            metadata.insert(PUBLIC_ENDPOINT_KEY.into(), json!(endpoint));
        }
        PeerSummary {
            peer_id: peer_id.into(),
            metadata,
        }
    }

    #[test]
    fn test_advertise_round_trips_through_metadata() {
        let endpoint: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        let nat = NatInfo::open(endpoint);
        let mut extra = Metadata::new();
        extra.insert("name".into(), json!("alice"));

        let metadata = advertise(extra, endpoint, &nat);
        assert_eq!(metadata["name"], json!("alice"));

        let mut directory = PeerDirectory::new();
        directory.upsert(
            "lobby",
            &PeerSummary {
                peer_id: "alice".into(),
                metadata,
            },
        );
        let peer = directory.get("alice").unwrap();
        assert_eq!(peer.endpoint, Some(endpoint));
        assert_eq!(peer.nat_type(), NatType::Open);
    }

    #[test]
    fn test_entry_lives_while_a_room_is_shared() {
        let mut directory = PeerDirectory::new();
        directory.upsert("a", &summary("bob", Some("192.0.2.1:5000")));
        directory.upsert("b", &summary("bob", None));
        let peer = directory.get("bob").unwrap();
        assert_eq!(peer.rooms().collect::<Vec<_>>(), vec!["a", "b"]);
        // Metadata without an endpoint keeps the last known one
        assert!(peer.endpoint.is_some());

        assert!(!directory.depart("a", "bob"));
        assert!(directory.depart("b", "bob"));
        assert!(directory.is_empty());
        assert!(!directory.depart("b", "bob"));
    }

    #[test]
    fn test_forget_room() {
        let mut directory = PeerDirectory::new();
        directory.upsert("a", &summary("bob", None));
        directory.upsert("a", &summary("carol", None));
        directory.upsert("b", &summary("carol", None));
        directory.forget_room("a");
        assert_eq!(directory.peer_ids(), vec!["carol".to_string()]);
    }

    #[test]
    fn test_unparseable_addressing_is_ignored() {
        let mut metadata = Metadata::new();
        metadata.insert(PUBLIC_ENDPOINT_KEY.into(), json!("not an address"));
        metadata.insert(NAT_INFO_KEY.into(), json!({ "type": "bogus" }));
        let mut directory = PeerDirectory::new();
        directory.upsert(
            "a",
            &PeerSummary {
                peer_id: "dave".into(),
                metadata,
            },
        );
        let peer = directory.get("dave").unwrap();
        assert!(peer.endpoint.is_none());
        assert_eq!(peer.nat_type(), NatType::Unknown);

        directory.observe("dave", "192.0.2.9:1234".parse().unwrap(), None);
        assert!(directory.get("dave").unwrap().endpoint.is_some());
        directory.observe("nobody", "192.0.2.9:1234".parse().unwrap(), None);
        assert_eq!(directory.len(), 1);
    }
}
