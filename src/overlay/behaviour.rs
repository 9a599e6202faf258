//! The libp2p behaviour set backing the shared overlay node.
//!
//! Kademlia provides the public DHT used to advertise and look up
//! sub-public-keys; identify/ping are the usual connection-health pair;
//! relay-client + dcutr provide hole-punched NAT traversal; `stream` is the
//! raw substream protocol used for both the byte-stream and datagram views
//! of an `OverlayEndpoint`.

use libp2p::{
    dcutr, identify, kad, ping,
    relay,
    swarm::NetworkBehaviour,
};
use libp2p_stream as stream;

pub const KAD_PROTOCOL: &str = "/tunnelmesh/kad/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/tunnelmesh/id/1.0.0";
pub const AGENT_VERSION: &str = concat!("tunnelmesh/", env!("CARGO_PKG_VERSION"));
pub const STREAM_PROTOCOL: &str = "/tunnelmesh/stream/1.0.0";
pub const DGRAM_PROTOCOL: &str = "/tunnelmesh/dgram/1.0.0";

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub stream: stream::Behaviour,
}
