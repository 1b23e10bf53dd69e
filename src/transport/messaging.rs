//! MessageBlob delivery.
//!
//! One connection carries one message. The sender proves its identity against
//! the receiver's nonce, then sends the payload XORed with the session key
//! both sides agreed on during the handshake.

use crate::crypto::{keystream_apply, short_id, Identity, SessionKey};
use crate::mesh::MeshContext;
use crate::network::MeshEvent;
use crate::session::proof::{answer_challenge, issue_challenge, read_proof};
use crate::transport::wire::{read_prefixed, Command};
use crate::utils::{NetworkError, ProtocolError, Result};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Encrypt `payload` for a known peer and deliver it
///
/// # Errors
///
/// `PeerNotFound` or `NoSessionKey` when the peer cannot be addressed yet,
/// `MessageTooLarge` above the configured ceiling, and network errors from
/// the delivery itself.
pub(crate) async fn send(context: &MeshContext, public_key: &[u8], payload: &[u8]) -> Result<()> {
    let max = context.network.max_message_size;
    if payload.len() > max {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max,
        }
        .into());
    }

    let peer = context
        .registry
        .lookup(public_key)
        .await
        .ok_or_else(|| NetworkError::PeerNotFound {
            peer_id: short_id(public_key),
        })?;
    let key = context
        .registry
        .session_key(public_key)
        .await
        .ok_or_else(|| NetworkError::NoSessionKey {
            peer_id: peer.short_id(),
        })?;

    let mut stream = context.connect(peer.endpoint).await?;
    tokio::time::timeout(
        context.network.io_timeout(),
        deliver(&context.identity, &mut stream, &key, payload),
    )
    .await??;

    log::debug!("Sent {} bytes to {}", payload.len(), peer);
    Ok(())
}

/// Sender side over a connected stream, starting with the command byte
pub(crate) async fn deliver<S>(
    identity: &Identity,
    stream: &mut S,
    key: &SessionKey,
    payload: &[u8],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_u8(Command::MessageBlob as u8).await?;
    let mut frame = answer_challenge(stream, identity).await?;

    let mut ciphertext = payload.to_vec();
    keystream_apply(&mut ciphertext, key.as_bytes());
    frame.put_prefixed(&ciphertext)?;

    stream.write_all(&frame.into_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

/// Receiver side, after the listener has consumed the command byte.
///
/// Senders that are not in the registry or hold no session key are dropped
/// before the payload is read.
pub(crate) async fn receive<S>(context: &MeshContext, stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = issue_challenge(stream).await?;
    let public_key = read_proof(stream, &nonce).await?;

    let unknown = || ProtocolError::UnknownSender {
        peer_id: short_id(&public_key),
    };
    let sender = context.registry.lookup(&public_key).await.ok_or_else(unknown)?;
    let key = context
        .registry
        .session_key(&public_key)
        .await
        .ok_or_else(unknown)?;

    let mut payload = read_prefixed(stream, context.network.max_message_size, "payload").await?;
    keystream_apply(&mut payload, key.as_bytes());

    log::debug!("Received {} bytes from {}", payload.len(), sender);
    context.registry.publish(MeshEvent::MessageReceived {
        sender,
        payload,
        received_at: Utc::now(),
    });
    Ok(())
}
