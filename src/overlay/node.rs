//! `OverlayNode`: the shared process-wide overlay node (C2).
//!
//! One `Swarm` runs in a background task (the actor pattern used throughout
//! this codebase's networking layer); everything else is a cheap, cloneable
//! handle into it. Kademlia operations (advertise/lookup) round-trip through
//! the actor because they need `&mut Swarm`; opening an already-routed
//! stream does not, since `libp2p_stream::Control` talks to the swarm
//! through its own internal channel and can be awaited from any task while
//! the actor keeps polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::kad::{self, QueryId};
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, identity, noise, ping, relay, yamux, Multiaddr, PeerId, Swarm};
use libp2p_stream as stream;
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::error::{PeerNotFound, StartupError};
use crate::keys::SubKeyPair;
use crate::overlay::behaviour::{
    NodeBehaviour, DGRAM_PROTOCOL, IDENTIFY_PROTOCOL, KAD_PROTOCOL, STREAM_PROTOCOL,
};
use crate::overlay::endpoint::{read_routing_header, write_routing_header, OverlayEndpoint};
use crate::overlay::{ConnectError, EndpointKind};

const GET_PROVIDERS_TIMEOUT: Duration = Duration::from_secs(20);
const DIAL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Debug)]
pub struct OverlayConfig {
    pub listen_addresses: Vec<Multiaddr>,
    pub bootstrap_peers: Vec<(PeerId, Multiaddr)>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/0".parse().expect("static multiaddr"),
                "/ip4/0.0.0.0/udp/0/quic-v1".parse().expect("static multiaddr"),
            ],
            bootstrap_peers: Vec::new(),
        }
    }
}

type ListenerMap = Arc<RwLock<HashMap<[u8; 32], mpsc::Sender<OverlayEndpoint>>>>;

enum Command {
    StartProviding {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<(), StartupError>>,
    },
    GetProviders {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<PeerId, PeerNotFound>>,
    },
    EnsureConnected {
        peer: PeerId,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// Handle to the shared overlay node. Cheap to clone; all clones share one
/// background swarm task.
#[derive(Clone)]
pub struct OverlayNode {
    local_peer_id: PeerId,
    command_tx: mpsc::Sender<Command>,
    control: stream::Control,
    stream_listeners: ListenerMap,
    dgram_listeners: ListenerMap,
}

static SHARED_NODE: OnceCell<OverlayNode> = OnceCell::new();

impl OverlayNode {
    /// Bring up the single shared overlay node for the process. Idempotent:
    /// subsequent calls return a clone of the already-running node and
    /// ignore `config`.
    pub async fn start(config: OverlayConfig) -> Result<Self, StartupError> {
        if let Some(existing) = SHARED_NODE.get() {
            return Ok(existing.clone());
        }
        let node = Self::start_new(config).await?;
        // Another task may have raced us; the loser's swarm task is simply
        // leaked as an idle listener, which is harmless but worth flagging
        // if it ever shows up under load.
        let node = SHARED_NODE.get_or_init(|| node.clone());
        Ok(node.clone())
    }

    async fn start_new(config: OverlayConfig) -> Result<Self, StartupError> {
        let local_key = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(local_key.public());
        info!(peer_id = %local_peer_id, "starting overlay node");

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(local_key.clone())
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| StartupError::NodeStart(e.to_string()))?
            .with_quic()
            .with_relay_client(noise::Config::new, yamux::Config::default)
            .map_err(|e| StartupError::NodeStart(e.to_string()))?
            .with_behaviour(|keypair, relay_client| {
                let identify_cfg =
                    identify::Config::new(IDENTIFY_PROTOCOL.into(), keypair.public())
                        .with_agent_version(crate::overlay::behaviour::AGENT_VERSION.into());
                let mut kad_cfg = kad::Config::default();
                kad_cfg.set_protocol_names(vec![KAD_PROTOCOL
                    .try_into()
                    .expect("valid protocol")]);
                let store = kad::store::MemoryStore::new(local_peer_id);
                NodeBehaviour {
                    identify: identify::Behaviour::new(identify_cfg),
                    ping: ping::Behaviour::new(ping::Config::new()),
                    kademlia: kad::Behaviour::with_config(local_peer_id, store, kad_cfg),
                    relay_client,
                    dcutr: libp2p::dcutr::Behaviour::new(local_peer_id),
                    stream: stream::Behaviour::new(),
                }
            })
            .map_err(|e| StartupError::NodeStart(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        for addr in &config.listen_addresses {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| StartupError::ListenFailed(e.to_string()))?;
        }

        for (peer, addr) in &config.bootstrap_peers {
            swarm
                .behaviour_mut()
                .kademlia
                .add_address(peer, addr.clone());
        }
        if !config.bootstrap_peers.is_empty() {
            swarm
                .behaviour_mut()
                .kademlia
                .bootstrap()
                .map_err(|e| StartupError::NodeStart(e.to_string()))?;
        }

        let control = swarm.behaviour().stream.new_control();
        let mut incoming_stream = swarm
            .behaviour()
            .stream
            .new_control()
            .accept(STREAM_PROTOCOL.try_into().expect("valid protocol"))
            .map_err(|e| StartupError::NodeStart(e.to_string()))?;
        let mut incoming_dgram = swarm
            .behaviour()
            .stream
            .new_control()
            .accept(DGRAM_PROTOCOL.try_into().expect("valid protocol"))
            .map_err(|e| StartupError::NodeStart(e.to_string()))?;

        let (command_tx, mut command_rx) = mpsc::channel::<Command>(256);
        let stream_listeners: ListenerMap = Arc::new(RwLock::new(HashMap::new()));
        let dgram_listeners: ListenerMap = Arc::new(RwLock::new(HashMap::new()));

        let handle = OverlayNode {
            local_peer_id,
            command_tx,
            control,
            stream_listeners: stream_listeners.clone(),
            dgram_listeners: dgram_listeners.clone(),
        };

        tokio::spawn(async move {
            let mut pending_providers: HashMap<QueryId, oneshot::Sender<Result<PeerId, PeerNotFound>>> =
                HashMap::new();
            let mut pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>> =
                HashMap::new();

            loop {
                tokio::select! {
                    Some(cmd) = command_rx.recv() => match cmd {
                        Command::StartProviding { key, reply } => {
                            let record_key = kad::RecordKey::new(&key);
                            match swarm.behaviour_mut().kademlia.start_providing(record_key) {
                                Ok(_query_id) => { let _ = reply.send(Ok(())); }
                                Err(e) => { let _ = reply.send(Err(StartupError::ListenFailed(e.to_string()))); }
                            }
                        }
                        Command::GetProviders { key, reply } => {
                            let record_key = kad::RecordKey::new(&key);
                            let query_id = swarm.behaviour_mut().kademlia.get_providers(record_key);
                            pending_providers.insert(query_id, reply);
                        }
                        Command::EnsureConnected { peer, reply } => {
                            if swarm.is_connected(&peer) {
                                let _ = reply.send(Ok(()));
                            } else {
                                pending_dials.entry(peer).or_default().push(reply);
                                if let Err(e) = swarm.dial(peer) {
                                    if let Some(waiters) = pending_dials.remove(&peer) {
                                        for w in waiters {
                                            let _ = w.send(Err(e.to_string()));
                                        }
                                    }
                                }
                            }
                        }
                    },
                    Some((peer, stream)) = incoming_stream.next() => {
                        debug!(%peer, "incoming byte-stream substream");
                        tokio::spawn(route_incoming(stream, stream_listeners.clone(), EndpointKind::Stream));
                    },
                    Some((peer, stream)) = incoming_dgram.next() => {
                        debug!(%peer, "incoming datagram substream");
                        tokio::spawn(route_incoming(stream, dgram_listeners.clone(), EndpointKind::Datagram));
                    },
                    event = swarm.select_next_some() => {
                        handle_swarm_event(event, &mut pending_providers, &mut pending_dials);
                    },
                    else => break,
                }
            }
        });

        Ok(handle)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Listen on a sub-keypair: advertise its public key as a DHT provider
    /// and register a channel that receives each newly routed
    /// `OverlayEndpoint` of the requested kind.
    pub async fn listen(
        &self,
        sub: &SubKeyPair,
        kind: EndpointKind,
    ) -> Result<super::Listener, StartupError> {
        let (tx, rx) = mpsc::channel(64);
        let key_bytes = sub.public.to_bytes();
        {
            let map = match kind {
                EndpointKind::Stream => &self.stream_listeners,
                EndpointKind::Datagram => &self.dgram_listeners,
            };
            map.write().await.insert(key_bytes, tx);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::StartProviding {
                key: sub.public.as_record_key(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| StartupError::NodeStart("overlay node task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| StartupError::NodeStart("overlay node task is gone".into()))??;

        Ok(super::Listener { rx })
    }

    /// Connect to a peer's sub-public-key and open one session of the
    /// requested kind.
    pub async fn connect(
        &self,
        peer_sub_public: crate::keys::SubPublicKey,
        kind: EndpointKind,
    ) -> Result<OverlayEndpoint, ConnectError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::GetProviders {
                key: peer_sub_public.as_record_key(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ConnectError::Dial("overlay node task is gone".into()))?;
        let peer = tokio::time::timeout(GET_PROVIDERS_TIMEOUT, reply_rx)
            .await
            .map_err(|_| PeerNotFound("no provider found before timeout".into()))?
            .map_err(|_| ConnectError::Dial("overlay node task is gone".into()))??;

        let (conn_tx, conn_rx) = oneshot::channel();
        self.command_tx
            .send(Command::EnsureConnected {
                peer,
                reply: conn_tx,
            })
            .await
            .map_err(|_| ConnectError::Dial("overlay node task is gone".into()))?;
        tokio::time::timeout(DIAL_TIMEOUT, conn_rx)
            .await
            .map_err(|_| ConnectError::Dial("timed out waiting for connection".into()))?
            .map_err(|_| ConnectError::Dial("overlay node task is gone".into()))?
            .map_err(ConnectError::Dial)?;

        let protocol = match kind {
            EndpointKind::Stream => STREAM_PROTOCOL,
            EndpointKind::Datagram => DGRAM_PROTOCOL,
        };
        let mut control = self.control.clone();
        let mut raw = control
            .open_stream(peer, protocol.try_into().expect("valid protocol"))
            .await
            .map_err(|e| ConnectError::Stream(e.to_string()))?;

        write_routing_header(&mut raw, &peer_sub_public)
            .await
            .map_err(|e| ConnectError::Stream(e.to_string()))?;

        Ok(match kind {
            EndpointKind::Stream => OverlayEndpoint {
                peer_sub_key: peer_sub_public,
                byte_stream: Some(raw),
                datagram_stream: None,
            },
            EndpointKind::Datagram => OverlayEndpoint {
                peer_sub_key: peer_sub_public,
                byte_stream: None,
                datagram_stream: Some(raw),
            },
        })
    }
}

async fn route_incoming(mut raw_stream: libp2p::Stream, listeners: ListenerMap, kind: EndpointKind) {
    let header = match read_routing_header(&mut raw_stream).await {
        Ok(h) => h,
        Err(e) => {
            warn!(error = %e, "incoming substream closed before routing header arrived");
            return;
        }
    };
    let tx = { listeners.read().await.get(&header).cloned() };
    let Some(tx) = tx else {
        warn!("incoming substream routed to an unregistered sub-key; dropping");
        return;
    };
    let peer_sub_key = match crate::keys::SubPublicKey::from_bytes(&header) {
        Ok(k) => k,
        Err(_) => {
            warn!("incoming substream carried a malformed routing header; dropping");
            return;
        }
    };
    let endpoint = match kind {
        EndpointKind::Stream => OverlayEndpoint {
            peer_sub_key,
            byte_stream: Some(raw_stream),
            datagram_stream: None,
        },
        EndpointKind::Datagram => OverlayEndpoint {
            peer_sub_key,
            byte_stream: None,
            datagram_stream: Some(raw_stream),
        },
    };
    let _ = tx.send(endpoint).await;
}

fn handle_swarm_event(
    event: SwarmEvent<crate::overlay::behaviour::NodeBehaviourEvent>,
    pending_providers: &mut HashMap<QueryId, oneshot::Sender<Result<PeerId, PeerNotFound>>>,
    pending_dials: &mut HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
) {
    use crate::overlay::behaviour::NodeBehaviourEvent;
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(%address, "overlay node listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            if let Some(waiters) = pending_dials.remove(&peer_id) {
                for w in waiters {
                    let _ = w.send(Ok(()));
                }
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
            if let Some(waiters) = pending_dials.remove(&peer_id) {
                for w in waiters {
                    let _ = w.send(Err(error.to_string()));
                }
            }
        }
        SwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
            id,
            result: kad::QueryResult::GetProviders(result),
            ..
        })) => {
            if let Some(reply) = pending_providers.remove(&id) {
                let outcome = match result {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => providers
                        .into_iter()
                        .next()
                        .ok_or_else(|| PeerNotFound("no providers advertised".into())),
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {
                        Err(PeerNotFound("no providers advertised".into()))
                    }
                    Err(e) => Err(PeerNotFound(e.to_string())),
                };
                let _ = reply.send(outcome);
            }
        }
        SwarmEvent::Behaviour(NodeBehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
            if let Err(e) = result {
                debug!(%peer, error = %e, "ping failure");
            }
        }
        _ => {}
    }
}
