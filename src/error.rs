//! Error taxonomy for the relay engine.
//!
//! Kinds mirror the propagation policy of the engine: `BridgeError`s never
//! escape their `Bridge`, `StartupError`s propagate up to the forward
//! manager, and `ConfigError`s abort startup before any forward runs.

use thiserror::Error;

/// Malformed input to the forward manager. Fatal at startup; no forwards run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("forward spec is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("server spec for port {0} requires `secret`")]
    MissingSecret(u16),

    #[error("client spec for port {0} requires `peer_public_key`")]
    MissingPeerKey(u16),

    #[error("invalid base58 public key: {0}")]
    InvalidPublicKey(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure bringing up a node, listener, or local socket. Fatal for the
/// affected spec; propagates to the forward manager.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("overlay node failed to start: {0}")]
    NodeStart(String),

    #[error("failed to listen on sub-keypair: {0}")]
    ListenFailed(String),

    #[error("failed to bind local socket {addr}: {source}")]
    LocalBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Overlay probe failed after retries. Fatal for the affected client spec only.
#[derive(Error, Debug)]
#[error("probe to peer failed after {attempts} attempt(s): {reason}")]
pub struct ProbeError {
    pub attempts: u32,
    pub reason: String,
}

/// Mid-connection failure. Non-fatal beyond the owning Bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("local socket error: {0}")]
    Local(#[from] std::io::Error),

    #[error("overlay endpoint error: {0}")]
    Overlay(String),

    #[error("idle timeout")]
    Timeout,

    #[error("pump failure: {0}")]
    Pump(String),
}

/// Transient DHT state reported during establishment. Never fatal; surfaced
/// to logs only, so the engine keeps no dedicated variant for it beyond this
/// marker used when formatting overlay lookup failures.
#[derive(Error, Debug)]
#[error("peer not found: {0}")]
pub struct PeerNotFound(pub String);

/// Aggregate error for the manager/CLI boundary.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    PeerNotFound(#[from] PeerNotFound),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
