//! Mesh lifecycle and coordination.
//!
//! [`Mesh`] owns one node's identity, peer registry, trust policy and the
//! background tasks serving it: the connection listener, the discovery
//! receiver and the optional periodic announcer. Everything those tasks share
//! lives in one context value behind an `Arc`; there is no process-global
//! state, so several meshes can run in one process.

use crate::{
    crypto::{self, Identity, KeyDecoder, RawKeyDecoder, TrustPolicy},
    network::{
        discovery::{self, AnnounceKind},
        MeshEvent, PeerIdentity, PeerRegistry,
    },
    session::handshake,
    transport::{listener, messaging, wire::Profile},
    utils::{MeshConfig, MeshError, NetworkConfig, NetworkError, ProtocolError, Result},
};
use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// State shared by the mesh and its background tasks
pub(crate) struct MeshContext {
    pub(crate) identity: Identity,
    pub(crate) registry: PeerRegistry,
    pub(crate) trust: Arc<dyn TrustPolicy>,
    pub(crate) network: NetworkConfig,
    pub(crate) profile: Profile,
    shutdown: watch::Sender<bool>,
}

impl MeshContext {
    pub(crate) fn new(
        identity: Identity,
        trust: Arc<dyn TrustPolicy>,
        network: NetworkConfig,
        profile: Profile,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let context = Arc::new(Self {
            identity,
            registry: PeerRegistry::new(event_sender),
            trust,
            network,
            profile,
            shutdown,
        });
        (context, event_receiver)
    }

    /// A context on loopback with broadcast disabled
    #[cfg(test)]
    pub(crate) fn for_tests(
        trust: Arc<dyn TrustPolicy>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MeshEvent>) {
        let network = NetworkConfig {
            bind_address: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            port: 0,
            broadcast: false,
            ..NetworkConfig::default()
        };
        Self::new(Identity::generate(), trust, network, Profile::default())
    }

    pub(crate) fn is_self(&self, public_key: &[u8]) -> bool {
        crypto::constant_time_equal(&self.identity.public_key_bytes(), public_key)
    }

    /// Endpoint assumed for a peer seen at `ip`
    pub(crate) fn peer_endpoint(&self, ip: IpAddr) -> SocketAddr {
        SocketAddr::new(ip, self.network.remote_port())
    }

    /// Reject our own key, and unknown keys the trust policy refuses
    pub(crate) fn vet(&self, public_key: &[u8], known: bool) -> Result<()> {
        if self.is_self(public_key) {
            return Err(ProtocolError::UntrustedKey.into());
        }
        if !known && !self.trust.approve(public_key) {
            log::debug!("Trust policy rejected {}", crypto::short_id(public_key));
            return Err(ProtocolError::UntrustedKey.into());
        }
        Ok(())
    }

    /// Vet a key and add it to the registry if it is new
    pub(crate) async fn admit(&self, public_key: &[u8], endpoint: SocketAddr) -> Result<PeerIdentity> {
        if let Some(known) = self.registry.lookup(public_key).await {
            self.vet(public_key, true)?;
            return Ok(known);
        }
        self.vet(public_key, false)?;
        let (peer, _) = self
            .registry
            .insert_if_absent(PeerIdentity::new(public_key, endpoint))
            .await;
        Ok(peer)
    }

    pub(crate) async fn connect(&self, endpoint: SocketAddr) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.network.connect_timeout(), TcpStream::connect(endpoint))
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: format!("connect to {}", endpoint),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run `task` in the background until it finishes or the mesh shuts down.
    /// Failures are logged, never propagated.
    pub(crate) fn spawn<F>(self: &Arc<Self>, what: String, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            tokio::select! {
                result = task => {
                    if let Err(e) = result {
                        report(&what, &e);
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    log::trace!("Abandoned {} at shutdown", what);
                }
            }
        });
    }
}

/// Resolve once the shutdown flag is raised or its sender is gone
pub(crate) async fn wait_for_shutdown(signal: &mut watch::Receiver<bool>) {
    while !*signal.borrow_and_update() {
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Log a contained failure at a level matching its cause
pub(crate) fn report(what: &str, error: &MeshError) {
    match error {
        e if e.is_security_violation() => log::warn!("{}: {}", what, e),
        MeshError::Protocol(_) => log::debug!("{}: {}", what, error),
        e if e.is_recoverable() => log::debug!("{}: {}", what, e),
        e => log::warn!("{}: {}", what, e),
    }
}

/// Snapshot of a running mesh
#[derive(Debug, Clone)]
pub struct MeshStats {
    /// Short fingerprint of the local key
    pub node_id: String,
    /// Bound listener address, if started
    pub local_addr: Option<SocketAddr>,
    /// Peers in the registry
    pub known_peers: usize,
    /// Peers holding a session key
    pub peers_with_session: usize,
    /// Time since construction
    pub uptime: chrono::Duration,
}

struct Running {
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

/// One node of the LAN mesh
pub struct Mesh {
    context: Arc<MeshContext>,
    events: Option<mpsc::UnboundedReceiver<MeshEvent>>,
    running: Option<Running>,
    created_at: DateTime<Utc>,
}

impl Mesh {
    /// Create a mesh node; nothing touches the network until [`Mesh::start`]
    ///
    /// # Errors
    ///
    /// A profile larger than peers accept is a configuration error.
    pub fn new(
        identity: Identity,
        trust: Arc<dyn TrustPolicy>,
        network: NetworkConfig,
        profile: Profile,
    ) -> Result<Self> {
        profile.validate()?;
        let (context, events) = MeshContext::new(identity, trust, network, profile);
        Ok(Self {
            context,
            events: Some(events),
            running: None,
            created_at: Utc::now(),
        })
    }

    /// Build a node from configuration: keys from `identity.keys_dir`, the
    /// configured trust policy and the profile image file, if any
    pub fn from_config(config: &MeshConfig) -> Result<Self> {
        config.validate()?;
        config.ensure_directories()?;

        let (identity, _) = Identity::load_or_generate(&config.identity.keys_dir)?;
        let trust = crypto::trust::from_config(&config.trust)?;
        let profile_image = match &config.identity.profile_image {
            Some(path) => Some(std::fs::read(path)?),
            None => None,
        };
        let profile = Profile {
            display_name: config.identity.display_name.clone(),
            profile_image,
        };

        Self::new(identity, trust, config.network.clone(), profile)
    }

    /// Bind the listener and datagram socket, spawn the background tasks,
    /// announce this node and contact bootstrap peers.
    ///
    /// Returns the bound listener address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }
        let network = &self.context.network;

        // Nobody will read events that were not claimed before start
        if self.events.take().is_some() {
            log::debug!("Event stream not taken; mesh events will be discarded");
        }

        let bind = SocketAddr::new(network.bind_address, network.port);
        let tcp = TcpListener::bind(bind).await.map_err(|e| NetworkError::Bind {
            address: bind.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = tcp.local_addr()?;

        // Datagrams use the same port number as the listener
        let udp = UdpSocket::bind(local_addr).await.map_err(|e| NetworkError::Bind {
            address: local_addr.to_string(),
            reason: e.to_string(),
        })?;
        udp.set_broadcast(true)?;

        let mut tasks = vec![
            tokio::spawn(listener::run(self.context.clone(), tcp)),
            tokio::spawn(discovery::run_receiver(self.context.clone(), udp)),
        ];
        if network.broadcast && network.announce_interval_secs > 0 {
            tasks.push(tokio::spawn(discovery::run_announcer(self.context.clone())));
        }

        log::info!(
            "Mesh node {} listening on {}",
            self.context.identity.short_id(),
            local_addr
        );
        self.running = Some(Running { local_addr, tasks });

        if network.broadcast {
            if let Err(e) = discovery::broadcast(&self.context, AnnounceKind::Join).await {
                log::warn!("Initial announce failed: {}", e);
            }
        }

        for bootstrap in &network.bootstrap_peers {
            let public_key = match general_purpose::STANDARD.decode(&bootstrap.public_key) {
                Ok(key) => key,
                Err(e) => {
                    log::warn!("Skipping bootstrap peer {}: {}", bootstrap.address, e);
                    continue;
                }
            };
            let context = self.context.clone();
            let endpoint = bootstrap.address;
            self.context.spawn(
                format!("bootstrap handshake with {}", endpoint),
                async move {
                    let peer = context.admit(&public_key, endpoint).await?;
                    handshake::initiate(&context, &peer).await
                },
            );
        }

        Ok(local_addr)
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// The local identity
    pub fn identity(&self) -> &Identity {
        &self.context.identity
    }

    /// Take the event stream.
    ///
    /// Only the first call before [`Mesh::start`] returns `Some`; a stream not
    /// taken by then is closed so undelivered events cannot pile up.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events.take()
    }

    /// Snapshot of known peers
    pub async fn peers(&self) -> Vec<PeerIdentity> {
        self.context.registry.peers().await
    }

    /// Look up one peer by public key
    pub async fn peer(&self, public_key: &[u8]) -> Option<PeerIdentity> {
        self.context.registry.lookup(public_key).await
    }

    /// Whether a handshake with this peer has produced a session key
    pub async fn has_session(&self, public_key: &[u8]) -> bool {
        self.context.registry.session_key(public_key).await.is_some()
    }

    /// Add a peer at a known endpoint and perform the handshake with it,
    /// bypassing broadcast discovery.
    ///
    /// The trust policy still decides whether an unknown key is admitted.
    pub async fn introduce(&self, public_key: &[u8], endpoint: SocketAddr) -> Result<PeerIdentity> {
        RawKeyDecoder.decode_public_key(public_key)?;
        let peer = self.context.admit(public_key, endpoint).await?;
        handshake::initiate(&self.context, &peer).await?;
        Ok(self.context.registry.lookup(public_key).await.unwrap_or(peer))
    }

    /// Encrypt and deliver one message to a peer
    pub async fn send(&self, public_key: &[u8], payload: &[u8]) -> Result<()> {
        messaging::send(&self.context, public_key, payload).await
    }

    /// Send one message to every peer holding a session key, concurrently
    pub async fn send_to_all(&self, payload: &[u8]) -> Vec<(PeerIdentity, Result<()>)> {
        let peers = self.context.registry.peers_with_session().await;
        let deliveries = peers
            .iter()
            .map(|peer| messaging::send(&self.context, peer.public_key(), payload));
        let results = futures::future::join_all(deliveries).await;
        peers.into_iter().zip(results).collect()
    }

    /// Broadcast a fresh announcement; the node must be started
    pub async fn announce(&self) -> Result<usize> {
        if self.running.is_none() {
            return Err(NetworkError::NotRunning.into());
        }
        discovery::broadcast(&self.context, AnnounceKind::Join).await
    }

    /// Current statistics
    pub async fn stats(&self) -> MeshStats {
        MeshStats {
            node_id: self.context.identity.short_id(),
            local_addr: self.local_addr(),
            known_peers: self.context.registry.len().await,
            peers_with_session: self.context.registry.peers_with_session().await.len(),
            uptime: Utc::now().signed_duration_since(self.created_at),
        }
    }

    /// Stop the listeners, announce withdrawal and wait for the tasks to end.
    ///
    /// Outbound handshakes still in flight are cancelled.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        log::info!("Shutting down mesh node {}", self.context.identity.short_id());

        self.context.signal_shutdown();
        if self.context.network.broadcast {
            if let Err(e) = discovery::broadcast(&self.context, AnnounceKind::Leave).await {
                log::warn!("Withdrawal announce failed: {}", e);
            }
        }

        for task in running.tasks {
            if let Err(e) = task.await {
                log::debug!("Background task ended abnormally: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            self.context.signal_shutdown();
            for task in running.tasks {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AllowAll, TrustList};
    use std::net::Ipv4Addr;

    fn test_network() -> NetworkConfig {
        NetworkConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            broadcast: false,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_vet() {
        let identity = Identity::generate();
        let own_key = identity.public_key_bytes();
        let (context, _events) = MeshContext::new(
            identity,
            Arc::new(TrustList::default()),
            test_network(),
            Profile::default(),
        );

        assert!(context.vet(&own_key, true).is_err());
        let stranger = Identity::generate().public_key_bytes();
        assert!(context.vet(&stranger, false).is_err());
        assert!(context.vet(&stranger, true).is_ok());
    }

    #[tokio::test]
    async fn test_admit_unknown_and_known() {
        let (context, mut events) = MeshContext::for_tests(Arc::new(AllowAll));
        let peer_key = Identity::generate().public_key_bytes();
        let endpoint = context.peer_endpoint(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));

        let first = context.admit(&peer_key, endpoint).await.unwrap();
        let second = context.admit(&peer_key, endpoint).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.endpoint.port(), context.network.remote_port());
        assert_eq!(first.endpoint.port(), 0);

        assert!(matches!(events.try_recv(), Ok(MeshEvent::PeerJoined(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut mesh = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::named("solo"),
        )
        .unwrap();
        assert!(mesh.local_addr().is_none());

        let addr = mesh.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(mesh.start().await.unwrap(), addr);
        assert_eq!(mesh.stats().await.known_peers, 0);

        mesh.shutdown().await.unwrap();
        assert!(mesh.local_addr().is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let mesh = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::default(),
        )
        .unwrap();
        let err = mesh
            .send(&Identity::generate().public_key_bytes(), b"hello")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::Network(NetworkError::PeerNotFound { .. })
        ));
        assert!(mesh.send_to_all(b"hello").await.is_empty());
        assert!(matches!(
            mesh.announce().await.unwrap_err(),
            MeshError::Network(NetworkError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_take_events_once() {
        let mut mesh = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::default(),
        )
        .unwrap();
        assert!(mesh.take_events().is_some());
        assert!(mesh.take_events().is_none());
    }

    #[tokio::test]
    async fn test_unclaimed_events_are_discarded() {
        let mut mesh = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::default(),
        )
        .unwrap();
        mesh.start().await.unwrap();
        assert!(mesh.take_events().is_none());

        // Publishing into a closed stream is a no-op
        let peer = mesh
            .context
            .admit(&Identity::generate().public_key_bytes(), "127.0.0.1:9".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(mesh.peers().await, vec![peer]);
        mesh.shutdown().await.unwrap();
    }

    #[test]
    fn test_oversized_profile_is_rejected() {
        let result = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::named("a".repeat(crate::transport::wire::MAX_NAME_LENGTH + 1)),
        );
        assert!(matches!(
            result,
            Err(MeshError::Config(crate::utils::ConfigError::InvalidValue { .. }))
        ));
    }

    struct Pair {
        alice: Mesh,
        alice_events: mpsc::UnboundedReceiver<MeshEvent>,
        bob: Mesh,
        bob_addr: SocketAddr,
        bob_events: mpsc::UnboundedReceiver<MeshEvent>,
    }

    /// Two started nodes on loopback; `bob` reaches learned peers on alice's port
    async fn pair(bob_trust: Arc<dyn TrustPolicy>) -> Pair {
        let mut alice = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::named("alice"),
        )
        .unwrap();
        let alice_events = alice.take_events().unwrap();
        let alice_addr = alice.start().await.unwrap();

        let mut bob = Mesh::new(
            Identity::generate(),
            bob_trust,
            NetworkConfig {
                peer_port: Some(alice_addr.port()),
                ..test_network()
            },
            Profile::named("bob"),
        )
        .unwrap();
        let bob_events = bob.take_events().unwrap();
        let bob_addr = bob.start().await.unwrap();

        Pair {
            alice,
            alice_events,
            bob,
            bob_addr,
            bob_events,
        }
    }

    async fn next_message(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> (PeerIdentity, Vec<u8>) {
        let deadline = std::time::Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            loop {
                match events.recv().await {
                    Some(MeshEvent::MessageReceived { sender, payload, .. }) => {
                        return (sender, payload)
                    }
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("no message within deadline")
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_messages() {
        let Pair {
            mut alice,
            mut alice_events,
            mut bob,
            bob_addr,
            mut bob_events,
        } = pair(Arc::new(AllowAll)).await;
        let alice_key = alice.identity().public_key_bytes();
        let bob_key = bob.identity().public_key_bytes();

        let introduced = alice.introduce(&bob_key, bob_addr).await.unwrap();
        assert_eq!(introduced.display_name.as_deref(), Some("bob"));

        // Both sides hold the same key once the initiator returns
        let alice_session = alice.context.registry.session_key(&bob_key).await;
        let bob_session = bob.context.registry.session_key(&alice_key).await;
        assert!(alice_session.is_some());
        assert_eq!(alice_session, bob_session);
        assert_eq!(
            bob.peer(&alice_key).await.unwrap().display_name.as_deref(),
            Some("alice")
        );

        alice.send(&bob_key, b"hello bob").await.unwrap();
        let (sender, payload) = next_message(&mut bob_events).await;
        assert_eq!(sender.public_key(), alice_key);
        assert_eq!(payload, b"hello bob");

        let results = bob.send_to_all(b"hello alice").await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        let (sender, payload) = next_message(&mut alice_events).await;
        assert_eq!(sender.public_key(), bob_key);
        assert_eq!(payload, b"hello alice");

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_introduction_is_rejected() {
        let Pair {
            alice, bob, bob_addr, ..
        } = pair(Arc::new(TrustList::default())).await;
        let bob_key = bob.identity().public_key_bytes();

        assert!(alice.introduce(&bob_key, bob_addr).await.is_err());
        assert!(bob.peers().await.is_empty());
        assert!(!alice.has_session(&bob_key).await);

        let err = alice.send(&bob_key, b"anyone there?").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::Network(NetworkError::NoSessionKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_introduce_rejects_bad_key() {
        let mesh = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::default(),
        )
        .unwrap();
        let endpoint: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(mesh.introduce(&[1, 2, 3], endpoint).await.is_err());
        let own_key = mesh.identity().public_key_bytes();
        assert!(mesh.introduce(&own_key, endpoint).await.is_err());
        assert!(mesh.peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_peer_handshake() {
        let mut alice = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            test_network(),
            Profile::named("alice"),
        )
        .unwrap();
        let alice_addr = alice.start().await.unwrap();
        let alice_key = alice.identity().public_key_bytes();

        let mut bob = Mesh::new(
            Identity::generate(),
            Arc::new(AllowAll),
            NetworkConfig {
                bootstrap_peers: vec![crate::utils::BootstrapPeer {
                    address: alice_addr,
                    public_key: alice.identity().public_key_base64(),
                }],
                ..test_network()
            },
            Profile::named("bob"),
        )
        .unwrap();
        bob.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !bob.has_session(&alice_key).await {
            assert!(tokio::time::Instant::now() < deadline, "bootstrap handshake never completed");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(
            bob.peer(&alice_key).await.unwrap().display_name.as_deref(),
            Some("alice")
        );

        bob.shutdown().await.unwrap();
        alice.shutdown().await.unwrap();
    }
}
