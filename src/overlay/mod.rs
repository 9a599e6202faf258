//! Overlay Node Adapter (C2): the thin contract surface the forwarder
//! engines consume. Everything libp2p-specific is confined to this module
//! and its children; `forward::*` only ever sees [`OverlayNode`],
//! [`Listener`], and [`OverlayEndpoint`].

mod behaviour;
mod endpoint;
mod node;

pub use endpoint::{DatagramChannel, DatagramReceiver, DatagramSender, OverlayEndpoint};
pub use node::{OverlayConfig, OverlayNode};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::PeerNotFound;

/// Which view of a session an engine opens. An engine commits to one kind
/// for the lifetime of a sub-keypair; mixing views on one session is a
/// latent bug the spec explicitly calls out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Stream,
    Datagram,
}

/// A bound listener for one sub-keypair. Each accepted session becomes one
/// `OverlayEndpoint` of the kind the listener was opened with.
pub struct Listener {
    pub(crate) rx: mpsc::Receiver<OverlayEndpoint>,
}

impl Listener {
    /// Await the next inbound session. Returns `None` once the listener is
    /// dropped by the node (process shutdown).
    pub async fn accept(&mut self) -> Option<OverlayEndpoint> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    PeerNotFound(#[from] PeerNotFound),
    #[error("failed to establish connection: {0}")]
    Dial(String),
    #[error("failed to open stream: {0}")]
    Stream(String),
}
