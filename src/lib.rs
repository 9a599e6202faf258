//! tunnelmesh: a peer-to-peer port-forwarding tunnel.
//!
//! A server node exposes local TCP or UDP ports by advertising
//! identity-derived public keys on a public DHT; a client node, given only
//! the corresponding public key and a protocol/port pair, opens a local
//! listening socket that transparently forwards bytes to the server's
//! exposed port through an end-to-end encrypted overlay stream. This crate
//! is the relay engine: key derivation, the overlay-node adapter, the three
//! bridging engines, and the manager that supervises them.

pub mod config;
pub mod error;
pub mod forward;
pub mod keys;
pub mod manager;
pub mod overlay;

pub use error::{BridgeError, ConfigError, PeerNotFound, ProbeError, StartupError, TunnelError, TunnelResult};
pub use forward::{ForwardSpec, ProtoSpec, Role};
pub use keys::{derive_root, Proto, RootKeyPair, RootPublicKey, Secret, SubKeyPair, SubPublicKey};
pub use manager::{ForwardManager, StartupSummaryLine};
pub use overlay::{OverlayConfig, OverlayNode};
