//! Peer identities and the registry of known peers.
//!
//! A peer is identified by its public key and nothing else: equality and
//! hashing ignore the endpoint and the display name, so a peer survives
//! address and port churn. The registry is an arena of peer records addressed
//! by the SHA-256 digest of the key. Every mutation goes through its async API,
//! which holds the lock only for the in-memory update and never across I/O.
//! Join, leave and profile changes are published as [`MeshEvent`]s.

use crate::crypto::{constant_time_equal, short_id, SessionKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use tokio::sync::{mpsc, RwLock};

/// Digest of a public key, used to address registry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the id for a public key
    pub fn of(public_key: &[u8]) -> Self {
        Self(Sha256::digest(public_key).into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

/// A remote node as seen by the local mesh
#[derive(Debug, Clone, Serialize)]
pub struct PeerIdentity {
    #[serde(serialize_with = "hex::serde::serialize")]
    public_key: Vec<u8>,
    /// Where the peer accepts connections
    pub endpoint: SocketAddr,
    /// Name supplied by the peer; may change on every handshake
    pub display_name: Option<String>,
    /// Opaque profile image bytes supplied by the peer
    #[serde(skip)]
    pub profile_image: Option<Vec<u8>>,
    /// When this node first admitted the peer
    pub first_seen: DateTime<Utc>,
}

impl PeerIdentity {
    /// Create a peer with no profile
    pub fn new(public_key: impl Into<Vec<u8>>, endpoint: SocketAddr) -> Self {
        Self {
            public_key: public_key.into(),
            endpoint,
            display_name: None,
            profile_image: None,
            first_seen: Utc::now(),
        }
    }

    /// The peer's public key, its identity
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Registry address of this peer
    pub fn id(&self) -> PeerId {
        PeerId::of(&self.public_key)
    }

    /// Short printable fingerprint
    pub fn short_id(&self) -> String {
        short_id(&self.public_key)
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        constant_time_equal(&self.public_key, &other.public_key)
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.public_key.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.short_id()),
            None => write!(f, "{} @ {}", self.short_id(), self.endpoint),
        }
    }
}

/// Notifications published by the mesh for presentation layers
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A peer was admitted to the registry
    PeerJoined(PeerIdentity),
    /// A peer withdrew from the mesh
    PeerLeft(PeerIdentity),
    /// A handshake changed a peer's display name or profile image
    ProfileUpdated(PeerIdentity),
    /// An authenticated message was decrypted
    MessageReceived {
        /// Sender as stored in the registry
        sender: PeerIdentity,
        /// Decrypted payload
        payload: Vec<u8>,
        /// Local receive time
        received_at: DateTime<Utc>,
    },
}

/// Result of offering a session key to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAttach {
    /// The peer had no key; the offered key is now attached
    Attached,
    /// The peer already held exactly this key
    Unchanged,
    /// A different key was replaced by the offered one
    Replaced,
    /// A different key was kept and the offered one discarded
    KeptExisting,
}

#[derive(Debug)]
struct PeerRecord {
    peer: PeerIdentity,
    session_key: Option<SessionKey>,
}

/// The set of known peers, owned by one mesh instance
#[derive(Debug)]
pub struct PeerRegistry {
    records: RwLock<HashMap<PeerId, PeerRecord>>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl PeerRegistry {
    /// Create an empty registry publishing to `events`
    pub fn new(events: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Find a peer by public key
    pub async fn lookup(&self, public_key: &[u8]) -> Option<PeerIdentity> {
        let records = self.records.read().await;
        find(&records, public_key).map(|record| record.peer.clone())
    }

    /// Admit `peer` unless a peer with the same key is already known.
    ///
    /// Returns the stored identity and whether it was newly inserted. A known
    /// peer is left untouched.
    pub async fn insert_if_absent(&self, peer: PeerIdentity) -> (PeerIdentity, bool) {
        let mut records = self.records.write().await;

        if let Some(record) = find(&records, &peer.public_key) {
            return (record.peer.clone(), false);
        }

        let stored = peer.clone();
        records.insert(
            peer.id(),
            PeerRecord {
                peer,
                session_key: None,
            },
        );
        drop(records);

        log::info!("Peer joined: {}", stored);
        self.publish(MeshEvent::PeerJoined(stored.clone()));
        (stored, true)
    }

    /// Record a new endpoint for a known peer
    pub async fn update_endpoint(&self, public_key: &[u8], endpoint: SocketAddr) -> Option<PeerIdentity> {
        let mut records = self.records.write().await;
        let record = find_mut(&mut records, public_key)?;
        if record.peer.endpoint != endpoint {
            log::debug!(
                "Peer {} moved from {} to {}",
                record.peer.short_id(),
                record.peer.endpoint,
                endpoint
            );
            record.peer.endpoint = endpoint;
        }
        Some(record.peer.clone())
    }

    /// Remove a peer and its session key
    pub async fn remove(&self, public_key: &[u8]) -> Option<PeerIdentity> {
        let mut records = self.records.write().await;
        find(&records, public_key)?;
        let removed = records.remove(&PeerId::of(public_key))?.peer;
        drop(records);

        log::info!("Peer left: {}", removed);
        self.publish(MeshEvent::PeerLeft(removed.clone()));
        Some(removed)
    }

    /// Store the profile a peer presented during a handshake
    pub async fn update_profile(
        &self,
        public_key: &[u8],
        display_name: Option<String>,
        profile_image: Option<Vec<u8>>,
    ) -> Option<PeerIdentity> {
        let mut records = self.records.write().await;
        let record = find_mut(&mut records, public_key)?;

        let changed =
            record.peer.display_name != display_name || record.peer.profile_image != profile_image;
        record.peer.display_name = display_name;
        record.peer.profile_image = profile_image;
        let updated = record.peer.clone();
        drop(records);

        if changed {
            self.publish(MeshEvent::ProfileUpdated(updated.clone()));
        }
        Some(updated)
    }

    /// Offer a session key for a known peer.
    ///
    /// A peer without a key always takes the offered key. A peer holding a
    /// different key only switches when `replace_existing` is set. Returns
    /// `None` when the peer is unknown.
    pub async fn attach_session_key(
        &self,
        public_key: &[u8],
        key: SessionKey,
        replace_existing: bool,
    ) -> Option<KeyAttach> {
        let mut records = self.records.write().await;
        let record = find_mut(&mut records, public_key)?;

        let outcome = match record.session_key {
            None => KeyAttach::Attached,
            Some(existing) if existing == key => KeyAttach::Unchanged,
            Some(_) if replace_existing => KeyAttach::Replaced,
            Some(_) => KeyAttach::KeptExisting,
        };
        if matches!(outcome, KeyAttach::Attached | KeyAttach::Replaced) {
            record.session_key = Some(key);
        }
        Some(outcome)
    }

    /// Session key shared with a peer, if a handshake has completed
    pub async fn session_key(&self, public_key: &[u8]) -> Option<SessionKey> {
        let records = self.records.read().await;
        find(&records, public_key).and_then(|record| record.session_key)
    }

    /// Snapshot of every known peer
    pub async fn peers(&self) -> Vec<PeerIdentity> {
        let records = self.records.read().await;
        records.values().map(|record| record.peer.clone()).collect()
    }

    /// Snapshot of peers holding a session key
    pub async fn peers_with_session(&self) -> Vec<PeerIdentity> {
        let records = self.records.read().await;
        records
            .values()
            .filter(|record| record.session_key.is_some())
            .map(|record| record.peer.clone())
            .collect()
    }

    /// Number of known peers
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether no peer is known
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Publish an event; a dropped subscriber is not an error
    pub(crate) fn publish(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

fn find<'a>(records: &'a HashMap<PeerId, PeerRecord>, public_key: &[u8]) -> Option<&'a PeerRecord> {
    records
        .get(&PeerId::of(public_key))
        .filter(|record| constant_time_equal(&record.peer.public_key, public_key))
}

fn find_mut<'a>(
    records: &'a mut HashMap<PeerId, PeerRecord>,
    public_key: &[u8],
) -> Option<&'a mut PeerRecord> {
    records
        .get_mut(&PeerId::of(public_key))
        .filter(|record| constant_time_equal(&record.peer.public_key, public_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use std::collections::HashSet;

    fn registry() -> (PeerRegistry, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerRegistry::new(tx), rx)
    }

    fn peer(identity: &Identity, port: u16) -> PeerIdentity {
        PeerIdentity::new(
            identity.public_key_bytes(),
            SocketAddr::from(([192, 168, 1, 10], port)),
        )
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent() {
        let (registry, mut events) = registry();
        let alice = Identity::generate();

        let (first, is_new) = registry.insert_if_absent(peer(&alice, 6969)).await;
        assert!(is_new);
        let (second, is_new) = registry.insert_if_absent(peer(&alice, 6969)).await;
        assert!(!is_new);

        assert_eq!(first, second);
        assert_eq!(first.first_seen, second.first_seen);
        assert_eq!(registry.len().await, 1);

        assert!(matches!(events.try_recv(), Ok(MeshEvent::PeerJoined(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_endpoint() {
        let (registry, _events) = registry();
        let alice = Identity::generate();

        registry.insert_if_absent(peer(&alice, 6969)).await;
        let (stored, _) = registry.insert_if_absent(peer(&alice, 7000)).await;
        assert_eq!(stored.endpoint.port(), 6969);

        let moved = registry
            .update_endpoint(&alice.public_key_bytes(), SocketAddr::from(([10, 0, 0, 5], 6969)))
            .await
            .unwrap();
        assert_eq!(moved.endpoint.ip().to_string(), "10.0.0.5");
        assert!(registry
            .update_endpoint(&Identity::generate().public_key_bytes(), moved.endpoint)
            .await
            .is_none());
    }

    #[test]
    fn test_json_shape() {
        let alice = Identity::generate();
        let mut stored = peer(&alice, 6969);
        stored.profile_image = Some(vec![1, 2, 3]);

        let json = serde_json::to_value(&stored).unwrap();
        assert_eq!(json["public_key"], hex::encode(alice.public_key_bytes()));
        assert_eq!(json["endpoint"], "192.168.1.10:6969");
        assert!(json.get("profile_image").is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let (registry, mut events) = registry();
        let alice = Identity::generate();
        registry.insert_if_absent(peer(&alice, 6969)).await;
        let _ = events.try_recv();

        assert!(registry.remove(&alice.public_key_bytes()).await.is_some());
        assert!(registry.remove(&alice.public_key_bytes()).await.is_none());
        assert!(registry.is_empty().await);

        assert!(matches!(events.try_recv(), Ok(MeshEvent::PeerLeft(_))));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_equality_ignores_endpoint_and_name() {
        let alice = Identity::generate();
        let mut a = peer(&alice, 1);
        let mut b = peer(&alice, 2);
        a.display_name = Some("alice".to_string());
        b.endpoint = SocketAddr::from(([10, 0, 0, 1], 9));

        assert_eq!(a, b);
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_distinct_keys_are_distinct_peers() {
        let peers: HashSet<_> = (0..32)
            .map(|_| peer(&Identity::generate(), 6969))
            .collect();
        assert_eq!(peers.len(), 32);
    }

    #[tokio::test]
    async fn test_update_profile_emits_on_change_only() {
        let (registry, mut events) = registry();
        let alice = Identity::generate();
        let key = alice.public_key_bytes();
        registry.insert_if_absent(peer(&alice, 6969)).await;
        let _ = events.try_recv();

        let updated = registry
            .update_profile(&key, Some("alice".to_string()), None)
            .await
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("alice"));
        assert!(matches!(events.try_recv(), Ok(MeshEvent::ProfileUpdated(_))));

        registry
            .update_profile(&key, Some("alice".to_string()), None)
            .await;
        assert!(events.try_recv().is_err());

        let stranger = Identity::generate();
        assert!(registry
            .update_profile(&stranger.public_key_bytes(), None, None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_attach_session_key() {
        let (registry, _events) = registry();
        let alice = Identity::generate();
        let key = alice.public_key_bytes();

        let first = SessionKey::generate();
        let second = SessionKey::generate();
        assert_eq!(registry.attach_session_key(&key, first, false).await, None);

        registry.insert_if_absent(peer(&alice, 6969)).await;
        assert_eq!(
            registry.attach_session_key(&key, first, false).await,
            Some(KeyAttach::Attached)
        );
        assert_eq!(
            registry.attach_session_key(&key, first, true).await,
            Some(KeyAttach::Unchanged)
        );
        assert_eq!(
            registry.attach_session_key(&key, second, false).await,
            Some(KeyAttach::KeptExisting)
        );
        assert_eq!(registry.session_key(&key).await, Some(first));

        assert_eq!(
            registry.attach_session_key(&key, second, true).await,
            Some(KeyAttach::Replaced)
        );
        assert_eq!(registry.session_key(&key).await, Some(second));
        assert_eq!(registry.peers_with_session().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_admit_once() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let registry = std::sync::Arc::new(PeerRegistry::new(tx));
        let alice = Identity::generate();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                let candidate = peer(&alice, 6000 + i);
                tokio::spawn(async move { registry.insert_if_absent(candidate).await.1 })
            })
            .collect();

        let mut new_count = 0;
        for handle in handles {
            if handle.await.unwrap() {
                new_count += 1;
            }
        }
        assert_eq!(new_count, 1);
        assert!(matches!(events.try_recv(), Ok(MeshEvent::PeerJoined(_))));
        assert!(events.try_recv().is_err());
    }
}
