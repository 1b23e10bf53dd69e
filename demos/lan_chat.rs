//! Two-node chat example demonstrating the mesh on a single machine.
//!
//! This example shows how to:
//! - Create two mesh nodes with fresh identities
//! - Introduce one node to the other without broadcast discovery
//! - Exchange encrypted messages
//! - Consume the event stream

use lan_mesh::{
    utils::NetworkConfig, AllowAll, Identity, Mesh, MeshEvent, Profile,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::time::{timeout, Duration};

fn loopback(peer_port: Option<u16>) -> NetworkConfig {
    NetworkConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        peer_port,
        broadcast: false,
        ..NetworkConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    println!("LAN Mesh - Two Node Chat Example");
    println!("================================");

    let mut alice = Mesh::new(
        Identity::generate(),
        Arc::new(AllowAll),
        loopback(None),
        Profile::named("alice"),
    )?;
    let alice_addr = alice.start().await?;

    // Bob reaches peers it learns about on Alice's port
    let mut bob = Mesh::new(
        Identity::generate(),
        Arc::new(AllowAll),
        loopback(Some(alice_addr.port())),
        Profile::named("bob"),
    )?;
    let mut bob_events = bob.take_events().ok_or("event stream taken")?;
    let bob_addr = bob.start().await?;

    println!("alice: {} on {}", alice.identity().short_id(), alice_addr);
    println!("bob:   {} on {}", bob.identity().short_id(), bob_addr);

    let peer = alice
        .introduce(&bob.identity().public_key_bytes(), bob_addr)
        .await?;
    println!("alice completed a handshake with {}", peer);

    alice
        .send(&bob.identity().public_key_bytes(), b"hello from alice")
        .await?;

    while let Ok(Some(event)) = timeout(Duration::from_secs(2), bob_events.recv()).await {
        match event {
            MeshEvent::PeerJoined(peer) => println!("bob sees {} join", peer),
            MeshEvent::ProfileUpdated(peer) => println!("bob learns the name of {}", peer),
            MeshEvent::MessageReceived { sender, payload, .. } => {
                println!("bob received from {}: {}", sender, String::from_utf8_lossy(&payload));
                break;
            }
            MeshEvent::PeerLeft(peer) => println!("bob sees {} leave", peer),
        }
    }

    let stats = bob.stats().await;
    println!("bob knows {} peer(s), {} with a session", stats.known_peers, stats.peers_with_session);

    alice.shutdown().await?;
    bob.shutdown().await?;
    println!("Shutdown complete");
    Ok(())
}
