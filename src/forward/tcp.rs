//! TCP engine (§4.3.1): one overlay byte-stream session per local TCP socket.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::error::StartupError;
use crate::forward::bridge::{bridge_duplex, Bridge};
use crate::forward::probe::probe;
use crate::keys::SubKeyPair;
use crate::overlay::{EndpointKind, OverlayNode};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Listen on `sub`'s public key; for each inbound overlay session, open a
/// TCP connection to `(host, remote_port)` and bridge the two. Returns once
/// the listener is bound (per C4's contract: a server spec returns
/// immediately after `Listener` is bound).
pub async fn run_server(
    node: OverlayNode,
    sub: SubKeyPair,
    host: String,
    remote_port: u16,
) -> Result<(), StartupError> {
    let mut listener = node.listen(&sub, EndpointKind::Stream).await?;
    tokio::spawn(async move {
        let mut seq: u64 = 0;
        while let Some(endpoint) = listener.accept().await {
            seq += 1;
            let host = host.clone();
            let name = format!("tcp-server-{}-{}", remote_port, seq);
            tokio::spawn(async move {
                if let Err(e) = serve_one(name, endpoint, host, remote_port).await {
                    warn!(error = %e, "tcp server connection failed");
                }
            });
        }
    });
    Ok(())
}

async fn serve_one(
    name: String,
    endpoint: crate::overlay::OverlayEndpoint,
    host: String,
    remote_port: u16,
) -> std::io::Result<()> {
    let local = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), remote_port)))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    info!(bridge = %name, "tcp server bridge established");
    let overlay_stream = endpoint.into_byte_stream();
    let bridge = Bridge::new(name);
    let (local_r, local_w) = tokio::io::split(local);
    let (remote_r, remote_w) = tokio::io::split(overlay_stream);
    bridge_duplex(bridge, local_r, local_w, remote_r, remote_w, IDLE_TIMEOUT, true).await;
    Ok(())
}

/// Probe the peer once, then bind a local TCP listener; for each inbound
/// local connection, open a fresh overlay session and bridge it.
pub async fn run_client(
    node: OverlayNode,
    peer_sub_public: crate::keys::SubPublicKey,
    local_port: u16,
) -> Result<(), crate::error::TunnelError> {
    probe(&node, peer_sub_public, EndpointKind::Stream, PROBE_TIMEOUT).await?;

    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|e| StartupError::LocalBind {
            addr: format!("127.0.0.1:{}", local_port),
            source: e,
        })?;
    info!(local_port, "tcp client listener bound");

    tokio::spawn(async move {
        let mut seq: u64 = 0;
        loop {
            let (socket, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tcp client accept failed");
                    continue;
                }
            };
            seq += 1;
            let node = node.clone();
            let name = format!("tcp-client-{}-{}", local_port, seq);
            tokio::spawn(async move {
                let endpoint = match node.connect(peer_sub_public, EndpointKind::Stream).await {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "tcp client connect failed");
                        return;
                    }
                };
                let bridge = Bridge::new(name);
                let overlay_stream = endpoint.into_byte_stream();
                let (local_r, local_w) = tokio::io::split(socket);
                let (remote_r, remote_w) = tokio::io::split(overlay_stream);
                bridge_duplex(bridge, local_r, local_w, remote_r, remote_w, IDLE_TIMEOUT, true).await;
            });
        }
    });

    Ok(())
}
