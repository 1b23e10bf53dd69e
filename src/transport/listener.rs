//! Inbound connection listener.
//!
//! Each accepted connection is served on its own task under the configured
//! I/O timeout. A failing connection is logged and closed; it never stops the
//! accept loop.

use crate::mesh::{report, wait_for_shutdown, MeshContext};
use crate::session::handshake;
use crate::transport::{messaging, wire::Command};
use crate::utils::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;

/// Accept connections until the mesh shuts down
pub(crate) async fn run(context: Arc<MeshContext>, listener: TcpListener) {
    let mut shutdown = context.shutdown_signal();

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((mut stream, remote)) => {
                    let context = context.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve(&context, &mut stream, remote).await {
                            report(&format!("Connection from {}", remote), &e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    log::debug!("Connection listener stopped");
}

/// Serve one inbound connection: read the command byte and dispatch
pub(crate) async fn serve<S>(context: &Arc<MeshContext>, stream: &mut S, remote: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(context.network.io_timeout(), async {
        let command = Command::try_from(stream.read_u8().await?)?;
        log::trace!("{:?} from {}", command, remote);

        match command {
            Command::Identify => handshake::accept(context, stream, remote).await,
            Command::MessageBlob => messaging::receive(context, stream).await,
        }
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AllowAll;
    use crate::utils::{MeshError, ProtocolError};
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_unknown_command_closes() {
        let (context, _) = MeshContext::for_tests(Arc::new(AllowAll));
        let (mut near, mut far) = duplex(1024);
        near.write_u8(9).await.unwrap();

        let err = serve(&context, &mut far, "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::UnknownCommand { tag: 9 })
        ));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let network = crate::utils::NetworkConfig {
            io_timeout_ms: 50,
            ..crate::utils::NetworkConfig::default()
        };
        let (context, _) = MeshContext::new(
            crate::crypto::Identity::generate(),
            Arc::new(AllowAll),
            network,
            Default::default(),
        );
        let (_near, mut far) = duplex(1024);

        let err = serve(&context, &mut far, "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_dispatches_identify() {
        let (context, _) = MeshContext::for_tests(Arc::new(AllowAll));
        let (mut near, mut far) = duplex(1024);
        near.write_u8(Command::Identify as u8).await.unwrap();
        near.shutdown().await.unwrap();

        // The acceptor sends its nonce, then hits end of stream reading the proof
        let err = serve(&context, &mut far, "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::MalformedPacket { .. })
        ));
    }
}
