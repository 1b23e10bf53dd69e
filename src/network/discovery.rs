//! Broadcast peer discovery on the local network.
//!
//! A node announces itself with a signed datagram sent to the limited
//! broadcast address from every non-loopback IPv4 interface:
//!
//! ```text
//! [sigLen: i32 LE][signature][pkLen: i32 LE][public key]
//! ```
//!
//! An announcement signs the public key itself. A withdrawal uses the same
//! layout but signs `"lan-mesh/withdraw:" || public key`, so a captured
//! announcement cannot be replayed as a withdrawal. Receivers verify the
//! signature, ignore their own datagrams, consult the trust policy for new
//! keys and then start a handshake with the sender.

use crate::crypto::{verify, Identity};
use crate::mesh::{report, wait_for_shutdown, MeshContext};
use crate::network::PeerIdentity;
use crate::session::handshake;
use crate::transport::wire::{PacketReader, PacketWriter, MAX_KEY_FIELD};
use crate::utils::{MeshError, NetworkError, ProtocolError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use if_addrs::IfAddr;
use tokio::net::UdpSocket;
use tokio::time::{interval_at, Instant};

const WITHDRAW_CONTEXT: &[u8] = b"lan-mesh/withdraw:";

/// Largest datagram the receiver reads
const MAX_DATAGRAM: usize = 4096;

/// Whether a datagram announces or withdraws its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceKind {
    /// The sender is joining or still present
    Join,
    /// The sender is leaving the mesh
    Leave,
}

/// A verified discovery datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Join or leave
    pub kind: AnnounceKind,
    /// The sender's public key, proven by the signature
    pub public_key: Vec<u8>,
}

/// What the receiver did with a datagram
#[derive(Debug, Clone)]
pub enum DatagramOutcome {
    /// A new peer was admitted
    Joined(PeerIdentity),
    /// A known peer announced again
    Refreshed(PeerIdentity),
    /// A peer withdrew; `None` if it was not known
    Withdrawn(Option<PeerIdentity>),
    /// The datagram came from this node
    OwnAnnouncement,
}

fn signed_bytes(kind: AnnounceKind, public_key: &[u8]) -> Vec<u8> {
    match kind {
        AnnounceKind::Join => public_key.to_vec(),
        AnnounceKind::Leave => [WITHDRAW_CONTEXT, public_key].concat(),
    }
}

/// Build a signed discovery datagram
pub fn encode_announcement(identity: &Identity, kind: AnnounceKind) -> Result<Vec<u8>> {
    let public_key = identity.public_key_bytes();
    let signature = identity.sign(&signed_bytes(kind, &public_key));

    let mut writer = PacketWriter::new();
    writer.put_prefixed(&signature)?.put_prefixed(&public_key)?;
    Ok(writer.into_bytes())
}

/// Parse a discovery datagram and verify its signature
///
/// # Errors
///
/// `MalformedPacket` or `MessageTooLarge` for bad framing,
/// `AuthenticationFailure` when the signature matches neither form.
pub fn decode_announcement(datagram: &[u8]) -> Result<Announcement> {
    let mut reader = PacketReader::new(datagram);
    let signature = reader.prefixed(MAX_KEY_FIELD, "signature")?;
    let public_key = reader.prefixed(MAX_KEY_FIELD, "public key")?;

    [AnnounceKind::Join, AnnounceKind::Leave]
        .into_iter()
        .find(|kind| verify(public_key, &signed_bytes(*kind, public_key), signature))
        .map(|kind| Announcement {
            kind,
            public_key: public_key.to_vec(),
        })
        .ok_or_else(|| ProtocolError::AuthenticationFailure.into())
}

/// Apply one received datagram to the registry.
///
/// Starting the follow-up handshake is left to the caller.
pub(crate) async fn handle_datagram(
    context: &MeshContext,
    datagram: &[u8],
    source: SocketAddr,
) -> Result<DatagramOutcome> {
    let announcement = decode_announcement(datagram)?;
    let public_key = &announcement.public_key;
    if context.is_self(public_key) {
        return Ok(DatagramOutcome::OwnAnnouncement);
    }

    match announcement.kind {
        AnnounceKind::Leave => Ok(DatagramOutcome::Withdrawn(
            context.registry.remove(public_key).await,
        )),
        AnnounceKind::Join => match context.registry.lookup(public_key).await {
            Some(known) if known.endpoint.ip() != source.ip() => {
                let moved = SocketAddr::new(source.ip(), known.endpoint.port());
                let peer = context
                    .registry
                    .update_endpoint(public_key, moved)
                    .await
                    .unwrap_or(known);
                Ok(DatagramOutcome::Refreshed(peer))
            }
            Some(known) => Ok(DatagramOutcome::Refreshed(known)),
            None => {
                let peer = context
                    .admit(public_key, context.peer_endpoint(source.ip()))
                    .await?;
                Ok(DatagramOutcome::Joined(peer))
            }
        },
    }
}

/// Receive datagrams until the mesh shuts down
pub(crate) async fn run_receiver(context: Arc<MeshContext>, socket: UdpSocket) {
    let mut shutdown = context.shutdown_signal();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => match handle_datagram(&context, &buf[..len], source).await {
                    Ok(DatagramOutcome::Joined(peer) | DatagramOutcome::Refreshed(peer)) => {
                        let task_context = context.clone();
                        context.spawn(format!("handshake with {}", peer), async move {
                            handshake::initiate(&task_context, &peer).await
                        });
                    }
                    Ok(_) => {}
                    Err(e) => log_dropped(source, &e),
                },
                Err(e) => log::warn!("Datagram receive failed: {}", e),
            }
        }
    }

    log::debug!("Discovery receiver stopped");
}

/// Level for a dropped datagram. Broadcast is shared with arbitrary LAN
/// traffic, so garbage is trace noise and rejected senders are debug.
fn dropped_datagram_level(error: &MeshError) -> Option<log::Level> {
    match error {
        MeshError::Protocol(ProtocolError::MalformedPacket { .. }) => Some(log::Level::Trace),
        MeshError::Protocol(ProtocolError::AuthenticationFailure | ProtocolError::UntrustedKey) => {
            Some(log::Level::Debug)
        }
        _ => None,
    }
}

fn log_dropped(source: SocketAddr, error: &MeshError) {
    match dropped_datagram_level(error) {
        Some(level) => log::log!(level, "Dropped datagram from {}: {}", source, error),
        None => report(&format!("Datagram from {}", source), error),
    }
}

/// Re-announce this node on the configured interval
pub(crate) async fn run_announcer(context: Arc<MeshContext>) {
    let period = Duration::from_secs(context.network.announce_interval_secs);
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut shutdown = context.shutdown_signal();

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                if let Err(e) = broadcast(&context, AnnounceKind::Join).await {
                    log::debug!("Periodic announce failed: {}", e);
                }
            }
        }
    }
}

/// Addresses to send broadcasts from.
///
/// With a wildcard bind this is every non-loopback IPv4 interface that has a
/// broadcast address. The interface listing carries no link state or
/// multicast flag, so an interface that is down simply fails its send.
fn broadcast_sources(bind_address: IpAddr) -> Result<Vec<Ipv4Addr>> {
    match bind_address {
        IpAddr::V4(ip) if !ip.is_unspecified() => return Ok(vec![ip]),
        IpAddr::V6(_) => {
            return Err(NetworkError::Broadcast {
                reason: "broadcast discovery needs an IPv4 bind address".to_string(),
            }
            .into())
        }
        _ => {}
    }

    let interfaces = if_addrs::get_if_addrs().map_err(|e| NetworkError::Broadcast {
        reason: format!("cannot list interfaces: {}", e),
    })?;

    Ok(interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) if v4.broadcast.is_some() => Some(v4.ip),
            _ => None,
        })
        .collect())
}

/// Send a signed announcement or withdrawal on every interface.
///
/// Returns the number of interfaces the datagram left on. Failure on one
/// interface does not stop the others.
pub(crate) async fn broadcast(context: &MeshContext, kind: AnnounceKind) -> Result<usize> {
    let packet = encode_announcement(&context.identity, kind)?;
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, context.network.remote_port()));

    let mut sent = 0;
    for source in broadcast_sources(context.network.bind_address)? {
        match send_from(source, &packet, target).await {
            Ok(()) => sent += 1,
            Err(e) => log::debug!("Broadcast from {} failed: {}", source, e),
        }
    }

    if sent == 0 {
        return Err(NetworkError::Broadcast {
            reason: "no interface could send the datagram".to_string(),
        }
        .into());
    }
    log::debug!("Sent {:?} announcement on {} interface(s)", kind, sent);
    Ok(sent)
}

async fn send_from(source: Ipv4Addr, packet: &[u8], target: SocketAddr) -> std::io::Result<()> {
    let socket = UdpSocket::bind((source, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(packet, target).await?;
    Ok(())
}
