//! UDP engine (§4.3.2): best-effort, one local UDP datagram per overlay
//! datagram, approximating a one-to-one NAT for a single UDP peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StartupError;
use crate::forward::bridge::Bridge;
use crate::keys::{SubKeyPair, SubPublicKey};
use crate::overlay::{EndpointKind, OverlayNode};

const MAX_DATAGRAM: usize = 64 * 1024;

pub async fn run_server(
    node: OverlayNode,
    sub: SubKeyPair,
    host: String,
    remote_port: u16,
) -> Result<(), StartupError> {
    let mut listener = node.listen(&sub, EndpointKind::Datagram).await?;
    tokio::spawn(async move {
        let mut seq: u64 = 0;
        while let Some(endpoint) = listener.accept().await {
            seq += 1;
            let host = host.clone();
            let name = format!("udp-server-{}-{}", remote_port, seq);
            tokio::spawn(async move {
                if let Err(e) = serve_one(name, endpoint, host, remote_port).await {
                    warn!(error = %e, "udp server session failed");
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
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host.as_str(), remote_port)).await?;
    info!(bridge = %name, "udp server session established");
    let bridge = Bridge::new(name);
    let mut dgram = endpoint.into_datagram();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            res = socket.recv(&mut buf) => {
                match res {
                    Ok(n) => {
                        if let Err(e) = dgram.send(&buf[..n]).await {
                            bridge.note_error(e);
                            break;
                        }
                    }
                    Err(e) => { bridge.note_error(e); break; }
                }
            }
            res = dgram.recv() => {
                match res {
                    Ok(Some(datagram)) => {
                        if let Err(e) = socket.send(&datagram).await {
                            bridge.note_error(e);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => { bridge.note_error(e); break; }
                }
            }
            _ = bridge.shutdown_requested() => break,
        }
    }
    bridge.mark_destroyed();
    Ok(())
}

/// Open one persistent overlay session, then bind a local UDP socket. The
/// first inbound local datagram's source port is latched for the lifetime
/// of the session (§9: single-peer contract chosen explicitly, not
/// per-(ip,port) tables) and used as the destination for all overlay
/// datagrams received afterward. Reverse traffic before any local datagram
/// arrives is dropped: no destination is known yet.
pub async fn run_client(
    node: OverlayNode,
    peer_sub_public: SubPublicKey,
    local_port: u16,
) -> Result<(), crate::error::TunnelError> {
    let endpoint = node
        .connect(peer_sub_public, EndpointKind::Datagram)
        .await
        .map_err(|e| StartupError::ListenFailed(e.to_string()))?;

    let socket = Arc::new(
        UdpSocket::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| StartupError::LocalBind {
                addr: format!("127.0.0.1:{}", local_port),
                source: e,
            })?,
    );
    info!(local_port, "udp client socket bound");

    let bridge = Bridge::new(format!("udp-client-{}", local_port));
    // Independent send/recv halves, one per task: a single Mutex-guarded
    // DatagramChannel would have one task's `recv` hold the lock across its
    // wait for the next frame, starving the other task's `send` forever.
    let (mut dgram_tx, mut dgram_rx) = endpoint.into_datagram().split();
    let inport: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

    {
        let socket = socket.clone();
        let inport = inport.clone();
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (n, src) = tokio::select! {
                    res = socket.recv_from(&mut buf) => match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            bridge.note_error(e);
                            break;
                        }
                    },
                    _ = bridge.shutdown_requested() => break,
                };
                let mut latch = inport.lock().await;
                if latch.is_none() {
                    *latch = Some(src);
                    info!(%src, "udp client latched source port");
                }
                drop(latch);
                if let Err(e) = dgram_tx.send(&buf[..n]).await {
                    bridge.note_error(e);
                    break;
                }
            }
            bridge.mark_destroyed();
        });
    }

    tokio::spawn(async move {
        loop {
            let datagram = tokio::select! {
                res = dgram_rx.recv() => match res {
                    Ok(Some(d)) => d,
                    Ok(None) => break,
                    Err(e) => {
                        bridge.note_error(e);
                        break;
                    }
                },
                _ = bridge.shutdown_requested() => break,
            };
            let dest = { *inport.lock().await };
            let Some(dest) = dest else {
                // No local source has sent yet; no destination is known.
                continue;
            };
            if let Err(e) = socket.send_to(&datagram, dest).await {
                bridge.note_error(e);
                break;
            }
        }
        bridge.mark_destroyed();
    });

    Ok(())
}
