//! Nonce challenge-response proof of key possession.
//!
//! The accepting side of every stream connection writes a fresh random nonce.
//! The initiating side answers with a signature over that nonce followed by
//! its public key. Because the nonce is never reused, a recorded proof cannot
//! be replayed on another connection.

use crate::crypto::{verify, Identity};
use crate::transport::wire::{read_nonce, read_prefixed, PacketWriter, MAX_KEY_FIELD, NONCE_LENGTH};
use crate::utils::{ProtocolError, Result};
use rand::RngCore;
use rand_core::OsRng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Generate a nonce and send it to the initiator
pub async fn issue_challenge<S>(stream: &mut S) -> Result<[u8; NONCE_LENGTH]>
where
    S: AsyncWrite + Unpin,
{
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    stream.write_all(&nonce).await?;
    stream.flush().await?;
    Ok(nonce)
}

/// Read the acceptor's nonce and start a frame holding the signed answer.
///
/// The caller appends its command-specific fields before writing the frame.
pub async fn answer_challenge<S>(stream: &mut S, identity: &Identity) -> Result<PacketWriter>
where
    S: AsyncRead + Unpin,
{
    let nonce = read_nonce(stream).await?;
    let mut frame = PacketWriter::new();
    frame
        .put_prefixed(&identity.sign(&nonce))?
        .put_prefixed(&identity.public_key_bytes())?;
    Ok(frame)
}

/// Read the initiator's answer and return the proven public key.
///
/// Fails with `AuthenticationFailure` when the signature does not cover
/// `nonce` under the claimed key.
pub async fn read_proof<S>(stream: &mut S, nonce: &[u8; NONCE_LENGTH]) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let signature = read_prefixed(stream, MAX_KEY_FIELD, "signature").await?;
    let public_key = read_prefixed(stream, MAX_KEY_FIELD, "public key").await?;

    if !verify(&public_key, nonce, &signature) {
        return Err(ProtocolError::AuthenticationFailure.into());
    }
    Ok(public_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MeshError;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_proof_exchange() {
        let identity = Identity::generate();
        let (mut initiator, mut acceptor) = duplex(4096);

        let accept = tokio::spawn(async move {
            let nonce = issue_challenge(&mut acceptor).await?;
            read_proof(&mut acceptor, &nonce).await
        });

        let frame = answer_challenge(&mut initiator, &identity).await.unwrap();
        initiator.write_all(&frame.into_bytes()).await.unwrap();

        let proven = accept.await.unwrap().unwrap();
        assert_eq!(proven, identity.public_key_bytes());
    }

    #[tokio::test]
    async fn test_replayed_proof_fails() {
        let identity = Identity::generate();

        // Capture an answer to one nonce...
        let (mut initiator, mut acceptor) = duplex(4096);
        issue_challenge(&mut acceptor).await.unwrap();
        let recorded = answer_challenge(&mut initiator, &identity)
            .await
            .unwrap()
            .into_bytes();

        // ...and replay it against a fresh challenge
        let (mut attacker, mut acceptor) = duplex(4096);
        let nonce = issue_challenge(&mut acceptor).await.unwrap();
        attacker.write_all(&recorded).await.unwrap();

        let err = read_proof(&mut acceptor, &nonce).await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::AuthenticationFailure)
        ));
    }

    #[tokio::test]
    async fn test_claimed_key_mismatch_fails() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let (mut initiator, mut acceptor) = duplex(4096);

        let nonce = issue_challenge(&mut acceptor).await.unwrap();
        let received = read_nonce(&mut initiator).await.unwrap();
        assert_eq!(received, nonce);

        let mut frame = PacketWriter::new();
        frame
            .put_prefixed(&mallory.sign(&nonce))
            .unwrap()
            .put_prefixed(&alice.public_key_bytes())
            .unwrap();
        initiator.write_all(&frame.into_bytes()).await.unwrap();

        assert!(read_proof(&mut acceptor, &nonce).await.is_err());
    }
}
