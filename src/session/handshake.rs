//! The Identify exchange: identity proof, session key delivery and profiles.
//!
//! ```text
//! acceptor  -> nonce[16]
//! initiator -> [sigLen][sig][pkLen][pk][keyLen][sealed key][profile]
//! acceptor  -> [profile]
//! ```
//!
//! The initiator always sends a session key sealed to the acceptor: the one
//! it already holds for that peer, or a fresh one. When both sides generate
//! keys concurrently, the key from the node with the lexicographically smaller
//! public key wins. The higher node adopts whatever the lower node sends, and
//! the lower node keeps its own key and pushes it back with a new handshake,
//! so both registries converge on one key.

use crate::crypto::{asym_decrypt, asym_encrypt, SessionKey};
use crate::mesh::MeshContext;
use crate::network::{KeyAttach, PeerIdentity};
use crate::session::proof::{answer_challenge, issue_challenge, read_proof};
use crate::transport::wire::{read_prefixed, read_profile, Command, PacketWriter, Profile, MAX_KEY_FIELD};
use crate::utils::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Connect to `peer` and run the exchange as initiator
pub(crate) async fn initiate(context: &Arc<MeshContext>, peer: &PeerIdentity) -> Result<()> {
    log::debug!("Starting handshake with {}", peer);
    let mut stream = context.connect(peer.endpoint).await?;

    let (key, profile) = tokio::time::timeout(
        context.network.io_timeout(),
        run_initiator(context, &mut stream, peer.public_key()),
    )
    .await??;
    let _ = stream.shutdown().await;

    complete(context, peer.public_key(), key, profile).await
}

/// Initiator side over an already connected stream, starting with the
/// command byte. Returns the key that was sent and the acceptor's profile.
pub(crate) async fn run_initiator<S>(
    context: &MeshContext,
    stream: &mut S,
    remote_key: &[u8],
) -> Result<(SessionKey, Profile)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u8(Command::Identify as u8).await?;
    let mut frame = answer_challenge(stream, &context.identity).await?;

    let key = match context.registry.session_key(remote_key).await {
        Some(existing) => existing,
        None => SessionKey::generate(),
    };
    let sealed = asym_encrypt(remote_key, key.as_bytes())?;
    frame.put_prefixed(&sealed)?.put_profile(&context.profile)?;
    stream.write_all(&frame.into_bytes()).await?;
    stream.flush().await?;

    let profile = read_profile(stream).await?;
    Ok((key, profile))
}

/// Record what a finished initiator exchange produced
async fn complete(
    context: &MeshContext,
    remote_key: &[u8],
    key: SessionKey,
    profile: Profile,
) -> Result<()> {
    let Some(peer) = context
        .registry
        .update_profile(remote_key, profile.display_name, profile.profile_image)
        .await
    else {
        log::debug!("Peer withdrew during handshake; discarding session key");
        return Ok(());
    };

    let local_wins = context.identity.public_key_bytes().as_slice() < remote_key;
    match context.registry.attach_session_key(remote_key, key, local_wins).await {
        Some(KeyAttach::KeptExisting) => {
            log::debug!("Kept session key pushed by {}", peer);
        }
        Some(_) => log::info!("Handshake with {} complete", peer),
        None => log::debug!("Peer {} vanished before key attach", peer),
    }
    Ok(())
}

/// Acceptor side, after the listener has consumed the command byte.
///
/// Any failure closes the connection without a reply: a rejected initiator
/// cannot tell an untrusted key from a network fault.
pub(crate) async fn accept<S>(context: &Arc<MeshContext>, stream: &mut S, remote: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = issue_challenge(stream).await?;
    let public_key = read_proof(stream, &nonce).await?;

    let known = context.registry.lookup(&public_key).await.is_some();
    context.vet(&public_key, known)?;

    let sealed = read_prefixed(stream, MAX_KEY_FIELD, "session key").await?;
    let profile = read_profile(stream).await?;
    let key = SessionKey::from_slice(&asym_decrypt(&context.identity, &sealed)?)?;

    let (peer, _) = context
        .registry
        .insert_if_absent(PeerIdentity::new(
            public_key.clone(),
            context.peer_endpoint(remote.ip()),
        ))
        .await;

    let remote_wins = public_key.as_slice() < context.identity.public_key_bytes().as_slice();
    if let Some(KeyAttach::KeptExisting) =
        context.registry.attach_session_key(&public_key, key, remote_wins).await
    {
        log::debug!("Session key collision with {}; pushing ours back", peer);
        let task_context = context.clone();
        let target = peer.clone();
        context.spawn(format!("key push to {}", peer), async move {
            initiate(&task_context, &target).await
        });
    }
    context
        .registry
        .update_profile(&public_key, profile.display_name, profile.profile_image)
        .await;

    let mut reply = PacketWriter::new();
    reply.put_profile(&context.profile)?;
    stream.write_all(&reply.into_bytes()).await?;
    stream.flush().await?;

    log::info!("Accepted handshake from {}", peer);
    Ok(())
}
