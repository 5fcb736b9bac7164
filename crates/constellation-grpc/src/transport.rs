//! aTLS transports for tonic
//!
//! Servers feed [`incoming`] into `Server::serve_with_incoming`; clients use
//! [`connect_atls`] as the connector of a tonic `Endpoint`.

use std::io;
use std::path::PathBuf;

use constellation_atls::{AttestedClientConfig, AttestedServerConfig};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::{client, server};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Uri;
use tracing::{debug, warn};

use crate::{HANDSHAKE_FAILED, HANDSHAKE_TIMEOUT};

/// Accepted connections waiting to be picked up by the gRPC server
const ACCEPT_BACKLOG: usize = 16;

/// Stream of aTLS connections accepted on `listener`.
///
/// Handshakes run concurrently on their own tasks so a slow or hostile peer
/// cannot stall the accept loop. Failed handshakes are logged and dropped.
/// The accept loop ends once the returned stream is dropped.
pub fn incoming(
    listener: TcpListener,
    config: AttestedServerConfig,
) -> ReceiverStream<io::Result<server::TlsStream<TcpStream>>> {
    let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = listener.accept() => accepted,
            };
            let (tcp, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    if tx.send(Err(e)).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let tx = tx.clone();
            let config = config.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, config.accept(tcp)).await {
                    Ok(Ok(tls)) => {
                        let _ = tx.send(Ok(tls)).await;
                    }
                    Ok(Err(e)) => warn!(peer = %peer, error = %e, "aTLS handshake failed"),
                    Err(_) => warn!(peer = %peer, "aTLS handshake timed out"),
                }
            });
        }
        debug!("aTLS accept loop stopped");
    });

    ReceiverStream::new(rx)
}

/// Connect to the host and port of `uri` and run the aTLS client handshake.
///
/// Handshake failures are reported as errors containing
/// [`HANDSHAKE_FAILED`] so callers can tell them apart from unreachable
/// endpoints.
pub async fn connect_atls(
    config: AttestedClientConfig,
    uri: Uri,
) -> io::Result<TokioIo<client::TlsStream<TcpStream>>> {
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no host"))?;
    let port = uri
        .port_u16()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no port"))?;

    let tcp = TcpStream::connect((host, port)).await?;
    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, config.connect(tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{HANDSHAKE_FAILED}: timeout")))?
        .map_err(|e| io::Error::other(format!("{HANDSHAKE_FAILED}: {e}")))?;
    Ok(TokioIo::new(tls))
}

/// Connect to a unix domain socket, ignoring the URI
pub async fn connect_unix(path: PathBuf, _uri: Uri) -> io::Result<TokioIo<UnixStream>> {
    Ok(TokioIo::new(UnixStream::connect(path).await?))
}
