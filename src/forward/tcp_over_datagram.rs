//! TCP-over-datagram engine (§4.3.3): TCP semantics observed by the
//! application, carried as raw frames over the overlay's datagram channel so
//! that UDP-friendly hole-punching can succeed where TCP hole-punching
//! fails. No reassembly or retransmission is performed here; the overlay is
//! assumed to handle datagram-sized framing.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::error::StartupError;
use crate::forward::bridge::Bridge;
use crate::forward::probe::probe;
use crate::keys::SubKeyPair;
use crate::overlay::{EndpointKind, OverlayNode};

const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK: usize = 16 * 1024;

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
            let name = format!("tcpudp-server-{}-{}", remote_port, seq);
            tokio::spawn(async move {
                if let Err(e) = serve_one(name, endpoint, host, remote_port).await {
                    warn!(error = %e, "tcp-over-datagram server connection failed");
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
    let local = TcpStream::connect((host.as_str(), remote_port)).await?;
    local.set_nodelay(true)?;
    info!(bridge = %name, "tcp-over-datagram server bridge established");
    let bridge = Bridge::new(name);
    let dgram = endpoint.into_datagram();
    bridge_tcp_datagram(bridge, local, dgram).await;
    Ok(())
}

pub async fn run_client(
    node: OverlayNode,
    peer_sub_public: crate::keys::SubPublicKey,
    local_port: u16,
) -> Result<(), crate::error::TunnelError> {
    probe(&node, peer_sub_public, EndpointKind::Datagram, PROBE_TIMEOUT).await?;

    let listener = TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(|e| StartupError::LocalBind {
            addr: format!("127.0.0.1:{}", local_port),
            source: e,
        })?;
    info!(local_port, "tcp-over-datagram client listener bound");

    tokio::spawn(async move {
        let mut seq: u64 = 0;
        loop {
            let (socket, _addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tcp-over-datagram client accept failed");
                    continue;
                }
            };
            seq += 1;
            let node = node.clone();
            let name = format!("tcpudp-client-{}-{}", local_port, seq);
            tokio::spawn(async move {
                let _ = socket.set_nodelay(true);
                let endpoint = match tokio::time::timeout(
                    OPEN_TIMEOUT,
                    node.connect(peer_sub_public, EndpointKind::Datagram),
                )
                .await
                {
                    Ok(Ok(e)) => e,
                    Ok(Err(e)) => {
                        warn!(error = %e, "tcp-over-datagram client connect failed");
                        return;
                    }
                    Err(_) => {
                        warn!("tcp-over-datagram client connect timed out");
                        return;
                    }
                };
                let bridge = Bridge::new(name);
                let dgram = endpoint.into_datagram();
                bridge_tcp_datagram(bridge, socket, dgram).await;
            });
        }
    });

    Ok(())
}

/// Datagram channels have no half-close, so a natural end on either side
/// destroys the whole bridge (unlike the plain TCP engine's independent
/// half-closes).
async fn bridge_tcp_datagram(
    bridge: std::sync::Arc<Bridge>,
    tcp: TcpStream,
    mut dgram: crate::overlay::DatagramChannel,
) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // One task drives both directions directly (as `udp::serve_one` does),
    // so there is no shared lock and no risk of holding one across the
    // `recv` await: `DatagramChannel::recv` buffers partial frames
    // internally and is safe to drop mid-read regardless.
    let (mut tcp_r, mut tcp_w) = tcp.into_split();

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            res = tcp_r.read(&mut buf) => {
                match res {
                    Ok(0) => {
                        bridge.note_local_end();
                        bridge.note_remote_end();
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = dgram.send(&buf[..n]).await {
                            bridge.note_error(e);
                            break;
                        }
                    }
                    Err(e) => {
                        bridge.note_error(e);
                        break;
                    }
                }
            }
            res = dgram.recv() => {
                match res {
                    Ok(Some(datagram)) => {
                        if let Err(e) = tcp_w.write_all(&datagram).await {
                            bridge.note_error(e);
                            break;
                        }
                    }
                    Ok(None) => {
                        bridge.note_local_end();
                        bridge.note_remote_end();
                        break;
                    }
                    Err(e) => {
                        bridge.note_error(e);
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_TIMEOUT) => {
                bridge.note_error(crate::error::BridgeError::Timeout);
                break;
            }
            _ = bridge.shutdown_requested() => {
                bridge.note_local_end();
                bridge.note_remote_end();
                break;
            }
        }
    }

    bridge.mark_destroyed();
    let _ = tcp_w.shutdown().await;
}
