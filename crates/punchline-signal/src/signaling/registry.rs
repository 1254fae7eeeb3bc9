//! Peer and room bookkeeping for the signaling relay.
//!
//! The registry is a plain table with no I/O. Every mutating operation
//! returns the deliveries it produced, so the caller can hold one lock across
//! the mutation and the fan-out. Invariant: a room never names a peer that is
//! absent from the peer table, and empty rooms do not exist.

use super::protocol::{DirectedKind, Envelope, ErrorCode, Metadata, PeerSummary, ServerMessage};
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, trace};

/// Relay-assigned transport connection identifier
pub type ConnId = u64;

/// A message queued for one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Target connection
    pub conn: ConnId,
    /// Message to send
    pub message: ServerMessage,
}

/// Registry rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Connection has no bound peer
    #[error("connection is not registered")]
    NotRegistered,
    /// Directed target absent
    #[error("peer {0} is not registered")]
    PeerNotFound(String),
    /// Not a member of the room
    #[error("not a member of room {0}")]
    NotInRoom(String),
    /// No such room
    #[error("room {0} does not exist")]
    RoomNotFound(String),
    /// Empty peer identifier
    #[error("peer id must not be empty")]
    InvalidPeerId,
    /// Empty room identifier
    #[error("room id must not be empty")]
    InvalidRoomId,
    /// Capacity reached
    #[error("relay is full ({0} peers)")]
    ServerFull(usize),
}

impl RegistryError {
    /// Wire error code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotRegistered => ErrorCode::NotRegistered,
            Self::PeerNotFound(_) => ErrorCode::PeerNotFound,
            Self::NotInRoom(_) => ErrorCode::NotInRoom,
            Self::RoomNotFound(_) => ErrorCode::RoomNotFound,
            Self::InvalidPeerId => ErrorCode::InvalidPeerId,
            Self::InvalidRoomId => ErrorCode::InvalidMessage,
            Self::ServerFull(_) => ErrorCode::ServerFull,
        }
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    metadata: Metadata,
    conn: Option<ConnId>,
    rooms: BTreeSet<String>,
    registered_at: Instant,
    last_seen: Instant,
}

/// Room listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    /// Room name
    pub room_id: String,
    /// Member count
    pub peer_count: usize,
}

/// Peer listing entry for introspection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    /// Peer identifier
    pub peer_id: String,
    /// Peer metadata
    pub metadata: Metadata,
    /// Whether a live connection is bound
    pub connected: bool,
    /// Seconds since registration
    pub registered_secs: u64,
    /// Seconds since last activity
    pub idle_secs: u64,
}

/// Result of a liveness sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Evicted peer identifiers
    pub evicted: Vec<String>,
    /// Connections that must be closed
    pub closed: Vec<ConnId>,
    /// `peer-left` notices for remaining members
    pub deliveries: Vec<Delivery>,
}

/// Peer and room tables
#[derive(Debug)]
pub struct Registry {
    peers: HashMap<String, PeerEntry>,
    bindings: HashMap<ConnId, String>,
    rooms: BTreeMap<String, BTreeSet<String>>,
    max_peers: usize,
}

impl Registry {
    /// Create an empty registry admitting at most `max_peers` peers
    #[must_use]
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            bindings: HashMap::new(),
            rooms: BTreeMap::new(),
            max_peers,
        }
    }

    /// Number of registered peers
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of non-empty rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Peer bound to `conn`
    #[must_use]
    pub fn peer_for(&self, conn: ConnId) -> Option<&str> {
        self.bindings.get(&conn).map(String::as_str)
    }

    /// Upsert the peer bound to `conn`
    ///
    /// Re-registering an existing `peer_id` rebinds it to `conn` and merges
    /// metadata; room memberships are kept. A connection switching to a new
    /// identity releases its previous one first.
    ///
    /// # Errors
    ///
    /// Rejects empty identifiers and new peers beyond capacity.
    pub fn register(
        &mut self,
        conn: ConnId,
        peer_id: String,
        metadata: Metadata,
        now: Instant,
    ) -> Result<Vec<Delivery>, RegistryError> {
        if peer_id.is_empty() {
            return Err(RegistryError::InvalidPeerId);
        }
        if !self.peers.contains_key(&peer_id) && self.peers.len() >= self.max_peers {
            return Err(RegistryError::ServerFull(self.max_peers));
        }

        let mut deliveries = Vec::new();
        if let Some(previous) = self.bindings.get(&conn).cloned() {
            if previous != peer_id {
                info!("connection {conn} re-registering as {peer_id}, releasing {previous}");
                deliveries.extend(self.remove_peer(&previous));
            }
        }

        let entry = match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if let Some(old_conn) = entry.conn.filter(|old| *old != conn) {
                    info!("peer {peer_id} rebound from connection {old_conn} to {conn}");
                    self.bindings.remove(&old_conn);
                }
                entry.metadata.extend(metadata);
                entry.conn = Some(conn);
                entry.last_seen = now;
                entry
            }
            Entry::Vacant(vacant) => {
                info!("peer {peer_id} registered on connection {conn}");
                vacant.insert(PeerEntry {
                    metadata,
                    conn: Some(conn),
                    rooms: BTreeSet::new(),
                    registered_at: now,
                    last_seen: now,
                })
            }
        };
        let metadata = entry.metadata.clone();
        self.bindings.insert(conn, peer_id.clone());

        deliveries.push(Delivery {
            conn,
            message: ServerMessage::Registered { peer_id, metadata },
        });
        Ok(deliveries)
    }

    /// Add the peer bound to `conn` to `room_id`
    ///
    /// The joiner first receives `room-joined` with the existing members,
    /// then each existing member receives `peer-joined`. Joining a room the
    /// peer is already in only repeats `room-joined`.
    ///
    /// # Errors
    ///
    /// Requires a registered connection and a non-empty room name.
    pub fn join_room(
        &mut self,
        conn: ConnId,
        room_id: String,
        now: Instant,
    ) -> Result<Vec<Delivery>, RegistryError> {
        if room_id.is_empty() {
            return Err(RegistryError::InvalidRoomId);
        }
        let peer_id = self.bound_peer(conn, now)?;

        let members = self.rooms.entry(room_id.clone()).or_default();
        let already_member = !members.insert(peer_id.clone());
        let existing: Vec<String> = members
            .iter()
            .filter(|member| **member != peer_id)
            .cloned()
            .collect();

        let mut deliveries = vec![Delivery {
            conn,
            message: ServerMessage::RoomJoined {
                room_id: room_id.clone(),
                peers: existing.iter().filter_map(|id| self.summary(id)).collect(),
            },
        }];

        if already_member {
            return Ok(deliveries);
        }

        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.rooms.insert(room_id.clone());
        }
        info!("peer {peer_id} joined room {room_id}");

        if let Some(joiner) = self.summary(&peer_id) {
            deliveries.extend(self.fan_out(&existing, |_| ServerMessage::PeerJoined {
                room_id: room_id.clone(),
                peer: joiner.clone(),
            }));
        }
        Ok(deliveries)
    }

    /// Remove the peer bound to `conn` from `room_id`
    ///
    /// # Errors
    ///
    /// Requires a registered connection that is a member of the room.
    pub fn leave_room(
        &mut self,
        conn: ConnId,
        room_id: &str,
        now: Instant,
    ) -> Result<Vec<Delivery>, RegistryError> {
        let peer_id = self.bound_peer(conn, now)?;
        self.require_member(room_id, &peer_id)?;

        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.rooms.remove(room_id);
        }
        info!("peer {peer_id} left room {room_id}");
        Ok(self.depart(&peer_id, room_id))
    }

    /// Forward a directed envelope to its target, stamping the sender
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::PeerNotFound`] when the target has no live
    /// connection.
    pub fn relay(
        &mut self,
        conn: ConnId,
        kind: DirectedKind,
        envelope: Envelope,
        now: Instant,
    ) -> Result<Vec<Delivery>, RegistryError> {
        let from = self.bound_peer(conn, now)?;
        let target = self
            .peers
            .get(&envelope.to)
            .and_then(|entry| entry.conn)
            .ok_or_else(|| RegistryError::PeerNotFound(envelope.to.clone()))?;

        trace!("relaying {kind} {from} -> {}", envelope.to);
        Ok(vec![Delivery {
            conn: target,
            message: kind.delivery(Envelope {
                from: Some(from),
                ..envelope
            }),
        }])
    }

    /// Fan `data` out to every other member of `room_id`
    ///
    /// # Errors
    ///
    /// The sender must be a member of the room.
    pub fn broadcast(
        &mut self,
        conn: ConnId,
        room_id: &str,
        data: Value,
        now: Instant,
    ) -> Result<Vec<Delivery>, RegistryError> {
        let from = self.bound_peer(conn, now)?;
        let members = self.require_member(room_id, &from)?;

        let others: Vec<String> = members.iter().filter(|m| **m != from).cloned().collect();
        Ok(self.fan_out(&others, |_| ServerMessage::Broadcast {
            room_id: room_id.to_string(),
            from: from.clone(),
            data: data.clone(),
        }))
    }

    /// Refresh `last_seen` for the peer bound to `conn`
    pub fn touch(&mut self, conn: ConnId, now: Instant) {
        if let Some(peer_id) = self.bindings.get(&conn) {
            if let Some(entry) = self.peers.get_mut(peer_id) {
                entry.last_seen = now;
            }
        }
    }

    /// Drop whatever peer is bound to a closed transport connection
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Delivery> {
        match self.bindings.get(&conn).cloned() {
            Some(peer_id) => {
                info!("peer {peer_id} disconnected");
                self.remove_peer(&peer_id)
            }
            None => Vec::new(),
        }
    }

    /// Evict every peer idle for longer than `inactivity`
    pub fn sweep(&mut self, now: Instant, inactivity: Duration) -> SweepOutcome {
        let stale: Vec<(String, Option<ConnId>)> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > inactivity)
            .map(|(id, entry)| (id.clone(), entry.conn))
            .collect();

        let mut outcome = SweepOutcome::default();
        for (peer_id, conn) in stale {
            info!("evicting inactive peer {peer_id}");
            outcome.deliveries.extend(self.remove_peer(&peer_id));
            outcome.closed.extend(conn);
            outcome.evicted.push(peer_id);
        }
        outcome
    }

    /// All rooms with their member counts
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.rooms
            .iter()
            .map(|(room_id, members)| RoomSummary {
                room_id: room_id.clone(),
                peer_count: members.len(),
            })
            .collect()
    }

    /// Members of `room_id`, or `None` if the room does not exist
    #[must_use]
    pub fn room_peers(&self, room_id: &str, now: Instant) -> Option<Vec<PeerStatus>> {
        let members = self.rooms.get(room_id)?;
        Some(
            members
                .iter()
                .filter_map(|id| {
                    let entry = self.peers.get(id)?;
                    Some(PeerStatus {
                        peer_id: id.clone(),
                        metadata: entry.metadata.clone(),
                        connected: entry.conn.is_some(),
                        registered_secs: now.saturating_duration_since(entry.registered_at).as_secs(),
                        idle_secs: now.saturating_duration_since(entry.last_seen).as_secs(),
                    })
                })
                .collect(),
        )
    }

    fn bound_peer(&mut self, conn: ConnId, now: Instant) -> Result<String, RegistryError> {
        let peer_id = self
            .bindings
            .get(&conn)
            .cloned()
            .ok_or(RegistryError::NotRegistered)?;
        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.last_seen = now;
        }
        Ok(peer_id)
    }

    fn require_member(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> Result<&BTreeSet<String>, RegistryError> {
        let members = self
            .rooms
            .get(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.to_string()))?;
        if members.contains(peer_id) {
            Ok(members)
        } else {
            Err(RegistryError::NotInRoom(room_id.to_string()))
        }
    }

    fn summary(&self, peer_id: &str) -> Option<PeerSummary> {
        self.peers.get(peer_id).map(|entry| PeerSummary {
            peer_id: peer_id.to_string(),
            metadata: entry.metadata.clone(),
        })
    }

    fn fan_out(
        &self,
        members: &[String],
        make: impl Fn(&str) -> ServerMessage,
    ) -> Vec<Delivery> {
        members
            .iter()
            .filter_map(|id| {
                let conn = self.peers.get(id)?.conn?;
                Some(Delivery {
                    conn,
                    message: make(id),
                })
            })
            .collect()
    }

    /// Remove `peer_id` from `room_id`, notify the rest, drop the room if empty
    fn depart(&mut self, peer_id: &str, room_id: &str) -> Vec<Delivery> {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        members.remove(peer_id);
        let remaining: Vec<String> = members.iter().cloned().collect();
        if remaining.is_empty() {
            self.rooms.remove(room_id);
            info!("room {room_id} deleted");
        }

        self.fan_out(&remaining, |_| ServerMessage::PeerLeft {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
        })
    }

    fn remove_peer(&mut self, peer_id: &str) -> Vec<Delivery> {
        let Some(entry) = self.peers.remove(peer_id) else {
            return Vec::new();
        };
        if let Some(conn) = entry.conn {
            self.bindings.remove(&conn);
        }

        let mut deliveries = Vec::new();
        for room_id in &entry.rooms {
            deliveries.extend(self.depart(peer_id, room_id));
        }
        deliveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => Metadata::new(),
        }
    }

    fn registered(registry: &mut Registry, conn: ConnId, peer: &str, now: Instant) {
        registry
            .register(conn, peer.to_string(), Metadata::new(), now)
            .unwrap();
    }

    #[test]
    fn test_join_lists_existing_then_notifies() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "A", now);
        registered(&mut registry, 2, "B", now);

        let joined_a = registry.join_room(1, "R1".into(), now).unwrap();
        assert_eq!(
            joined_a,
            vec![Delivery {
                conn: 1,
                message: ServerMessage::RoomJoined {
                    room_id: "R1".into(),
                    peers: vec![]
                }
            }]
        );

        let joined_b = registry.join_room(2, "R1".into(), now).unwrap();
        assert_eq!(joined_b.len(), 2);
        assert_eq!(joined_b[0].conn, 2);
        match &joined_b[0].message {
            ServerMessage::RoomJoined { peers, .. } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id, "A");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(joined_b[1].conn, 1);
        assert!(matches!(
            &joined_b[1].message,
            ServerMessage::PeerJoined { peer, .. } if peer.peer_id == "B"
        ));
    }

    #[test]
    fn test_rejoin_does_not_rebroadcast() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "A", now);
        registered(&mut registry, 2, "B", now);
        registry.join_room(1, "R1".into(), now).unwrap();
        registry.join_room(2, "R1".into(), now).unwrap();

        let again = registry.join_room(2, "R1".into(), now).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(registry.rooms()[0].peer_count, 2);
    }

    #[test]
    fn test_last_leave_deletes_room() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "A", now);
        registered(&mut registry, 2, "B", now);
        registry.join_room(1, "R1".into(), now).unwrap();
        registry.join_room(2, "R1".into(), now).unwrap();

        let left = registry.leave_room(1, "R1", now).unwrap();
        assert_eq!(
            left,
            vec![Delivery {
                conn: 2,
                message: ServerMessage::PeerLeft {
                    room_id: "R1".into(),
                    peer_id: "A".into()
                }
            }]
        );
        assert_eq!(registry.room_count(), 1);

        assert!(registry.leave_room(2, "R1", now).unwrap().is_empty());
        assert_eq!(registry.room_count(), 0);
        assert!(registry.room_peers("R1", now).is_none());
        assert_eq!(
            registry.leave_room(2, "R1", now),
            Err(RegistryError::RoomNotFound("R1".into()))
        );
    }

    #[test]
    fn test_reregister_merges_metadata_without_duplicates() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registry
            .register(1, "A".into(), meta(json!({"v": 1, "keep": true})), now)
            .unwrap();
        registry.join_room(1, "R1".into(), now).unwrap();

        let out = registry
            .register(1, "A".into(), meta(json!({"v": 2})), now)
            .unwrap();
        assert_eq!(registry.peer_count(), 1);
        match &out[0].message {
            ServerMessage::Registered { metadata, .. } => {
                assert_eq!(metadata["v"], 2);
                assert_eq!(metadata["keep"], true);
            }
            other => panic!("unexpected {other:?}"),
        }

        registry.join_room(1, "R1".into(), now).unwrap();
        let peers = registry.room_peers("R1", now).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].metadata["v"], 2);
    }

    #[test]
    fn test_rebind_to_new_connection() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "A", now);
        registered(&mut registry, 2, "B", now);
        registry.join_room(1, "R1".into(), now).unwrap();

        registered(&mut registry, 9, "A", now);
        assert_eq!(registry.peer_for(9), Some("A"));
        assert_eq!(registry.peer_for(1), None);

        // The old transport closing must not evict the rebound peer
        assert!(registry.disconnect(1).is_empty());
        assert_eq!(registry.peer_count(), 2);

        let out = registry
            .relay(2, DirectedKind::Offer, Envelope::new("A", json!("sdp")), now)
            .unwrap();
        assert_eq!(out[0].conn, 9);
    }

    #[test]
    fn test_connection_switching_identity_releases_old() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "A", now);
        registered(&mut registry, 2, "B", now);
        registry.join_room(1, "R1".into(), now).unwrap();
        registry.join_room(2, "R1".into(), now).unwrap();

        let out = registry
            .register(1, "A2".into(), Metadata::new(), now)
            .unwrap();
        assert!(out.iter().any(|d| d.conn == 2
            && matches!(&d.message, ServerMessage::PeerLeft { peer_id, .. } if peer_id == "A")));
        assert_eq!(registry.peer_count(), 2);
        assert_eq!(registry.peer_for(1), Some("A2"));
    }

    #[test]
    fn test_relay_stamps_sender_and_rejects_unknown_target() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "A", now);
        registered(&mut registry, 2, "B", now);

        let out = registry
            .relay(
                1,
                DirectedKind::Signal,
                Envelope {
                    from: Some("spoofed".into()),
                    to: "B".into(),
                    payload: json!({"x": 1}),
                },
                now,
            )
            .unwrap();
        assert_eq!(
            out[0].message,
            ServerMessage::Signal(Envelope {
                from: Some("A".into()),
                to: "B".into(),
                payload: json!({"x": 1})
            })
        );

        assert_eq!(
            registry.relay(1, DirectedKind::Offer, Envelope::new("Z", Value::Null), now),
            Err(RegistryError::PeerNotFound("Z".into()))
        );
        assert_eq!(
            registry.relay(7, DirectedKind::Offer, Envelope::new("B", Value::Null), now),
            Err(RegistryError::NotRegistered)
        );
    }

    #[test]
    fn test_broadcast_requires_membership() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        for (conn, id) in [(1, "A"), (2, "B"), (3, "C")] {
            registered(&mut registry, conn, id, now);
            registry.join_room(conn, "R1".into(), now).unwrap();
        }
        registered(&mut registry, 4, "D", now);

        let out = registry.broadcast(1, "R1", json!("hi"), now).unwrap();
        let mut targets: Vec<ConnId> = out.iter().map(|d| d.conn).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![2, 3]);

        assert_eq!(
            registry.broadcast(4, "R1", json!("hi"), now),
            Err(RegistryError::NotInRoom("R1".into()))
        );
    }

    #[test]
    fn test_disconnect_cleans_rooms() {
        let now = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "A", now);
        registered(&mut registry, 2, "B", now);
        registry.join_room(1, "R1".into(), now).unwrap();
        registry.join_room(1, "R2".into(), now).unwrap();
        registry.join_room(2, "R1".into(), now).unwrap();

        let out = registry.disconnect(1);
        assert_eq!(out.len(), 1);
        assert_eq!(registry.peer_count(), 1);
        assert_eq!(
            registry.rooms(),
            vec![RoomSummary {
                room_id: "R1".into(),
                peer_count: 1
            }]
        );
    }

    #[test]
    fn test_sweep_evicts_only_idle_peers() {
        let start = Instant::now();
        let mut registry = Registry::new(100);
        registered(&mut registry, 1, "idle", start);
        registered(&mut registry, 2, "busy", start);
        registry.join_room(1, "R1".into(), start).unwrap();
        registry.join_room(2, "R1".into(), start).unwrap();

        let later = start + Duration::from_secs(200);
        registry.touch(2, later);

        let outcome = registry.sweep(start + Duration::from_secs(301), Duration::from_secs(300));
        assert_eq!(outcome.evicted, vec!["idle".to_string()]);
        assert_eq!(outcome.closed, vec![1]);
        assert_eq!(outcome.deliveries.len(), 1);
        assert_eq!(registry.peer_count(), 1);
        assert_eq!(registry.peer_for(1), None);
    }

    #[test]
    fn test_capacity_and_validation() {
        let now = Instant::now();
        let mut registry = Registry::new(1);
        registered(&mut registry, 1, "A", now);

        assert_eq!(
            registry.register(2, "B".into(), Metadata::new(), now),
            Err(RegistryError::ServerFull(1))
        );
        // Re-registering an existing peer is still allowed at capacity
        assert!(registry.register(1, "A".into(), Metadata::new(), now).is_ok());
        assert_eq!(
            registry.register(3, String::new(), Metadata::new(), now),
            Err(RegistryError::InvalidPeerId)
        );
        assert_eq!(
            registry.join_room(1, String::new(), now),
            Err(RegistryError::InvalidRoomId)
        );
        assert_eq!(
            registry.join_room(5, "R".into(), now),
            Err(RegistryError::NotRegistered)
        );
    }
}
