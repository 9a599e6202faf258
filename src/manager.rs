//! Forward Manager (C4): spawns, supervises, and reports on the set of
//! forwarders described by a schema of [`ForwardSpec`]s (spec.md §4.4).
//!
//! The manager does no per-connection work itself; it is plumbing that
//! derives keys, starts each forwarder engine, and collects the advertised
//! public keys into human-readable startup lines.

use std::collections::HashMap;

use futures::future::try_join_all;
use tracing::info;

use crate::error::{ConfigError, TunnelError};
use crate::forward::{ForwardSpec, ProtoSpec, Role};
use crate::keys::{derive_root, Proto, RootPublicKey};
use crate::overlay::{OverlayConfig, OverlayNode};

/// One line of human-readable startup output: a server's advertised public
/// key plus the (proto, port) pairs reachable under it, in input order.
#[derive(Debug, Clone)]
pub struct StartupSummaryLine {
    pub public_key: RootPublicKey,
    pub pairs: Vec<(Proto, u16)>,
}

impl StartupSummaryLine {
    /// A client-facing command template listing every (proto,port) pair
    /// this line advertises, e.g.:
    /// `tunnelmesh client --peer <key> --proto tcp --remote-port 7000 --local-port <LOCAL_PORT>`
    pub fn client_command(&self) -> String {
        let pairs = self
            .pairs
            .iter()
            .map(|(proto, port)| format!("--proto {} --remote-port {} --local-port <LOCAL_PORT>", proto, port))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "tunnelmesh client --peer {} {}",
            self.public_key.to_base58(),
            pairs
        )
    }

    pub fn render(&self) -> String {
        format!(
            "tunnelmesh: public key {}\n  client command: {}",
            self.public_key.to_base58(),
            self.client_command()
        )
    }
}

/// The running set of forwarders for one process. Holds no per-connection
/// state; forwarders run as detached tasks owned by the shared
/// [`OverlayNode`] and survive for the process lifetime.
pub struct ForwardManager {
    node: OverlayNode,
    pub summary: Vec<StartupSummaryLine>,
}

impl ForwardManager {
    /// Validate every spec, start all forwarders concurrently, and return
    /// once every one has reached its "ready" point (server: listener
    /// bound; client: probe succeeded and local listener bound). Any
    /// startup failure is fatal to the whole call: spec.md §4.4 groups
    /// startup as a single phase and propagates errors to the caller, who
    /// decides whether to exit.
    pub async fn start(
        specs: Vec<ForwardSpec>,
        overlay_config: OverlayConfig,
    ) -> Result<Self, TunnelError> {
        for spec in &specs {
            spec.validate()?;
        }

        let node = OverlayNode::start(overlay_config)
            .await
            .map_err(TunnelError::Startup)?;

        let summary = build_summary(&specs)?;
        for line in &summary {
            info!("{}", line.render());
        }

        let tasks = specs
            .into_iter()
            .map(|spec| start_one(node.clone(), spec));
        try_join_all(tasks).await?;

        Ok(Self { node, summary })
    }

    pub fn local_peer_id(&self) -> libp2p::PeerId {
        self.node.local_peer_id()
    }
}

/// Group server specs by shared secret so that servers sharing one secret
/// (the "consolidated-command" case, spec.md §4.4 step 1) print exactly one
/// public-key line listing every one of their (proto,port) pairs, in input
/// order. Client specs contribute nothing to the summary: spec.md §6 only
/// requires output "for each server forward".
fn build_summary(specs: &[ForwardSpec]) -> Result<Vec<StartupSummaryLine>, ConfigError> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, StartupSummaryLine> = HashMap::new();

    for spec in specs {
        if spec.role != Role::Server {
            continue;
        }
        let secret = spec.secret()?;
        let root = derive_root(&secret);
        let key = hex::encode(secret.as_bytes());
        let entry = grouped.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            StartupSummaryLine {
                public_key: root.public,
                pairs: Vec::new(),
            }
        });
        entry.pairs.push((spec.proto(), spec.remote_port));
    }

    Ok(order
        .into_iter()
        .map(|key| grouped.remove(&key).expect("just inserted"))
        .collect())
}

async fn start_one(node: OverlayNode, spec: ForwardSpec) -> Result<(), TunnelError> {
    match spec.role {
        Role::Server => start_server(node, spec).await,
        Role::Client => start_client(node, spec).await,
    }
}

async fn start_server(node: OverlayNode, spec: ForwardSpec) -> Result<(), TunnelError> {
    let secret = spec.secret()?;
    let root = derive_root(&secret);
    let sub = root.derive_sub(spec.proto(), spec.remote_port);
    let host = spec.host.clone();
    let port = spec.remote_port;

    match spec.proto {
        ProtoSpec::Tcp => crate::forward::tcp::run_server(node, sub, host, port)
            .await
            .map_err(TunnelError::Startup),
        ProtoSpec::Udp => crate::forward::udp::run_server(node, sub, host, port)
            .await
            .map_err(TunnelError::Startup),
        ProtoSpec::TcpOverDatagram => {
            crate::forward::tcp_over_datagram::run_server(node, sub, host, port)
                .await
                .map_err(TunnelError::Startup)
        }
    }
}

async fn start_client(node: OverlayNode, spec: ForwardSpec) -> Result<(), TunnelError> {
    let peer = spec.peer_sub_public()?;
    let local_port = spec.local_port()?;

    match spec.proto {
        ProtoSpec::Tcp => crate::forward::tcp::run_client(node, peer, local_port).await,
        ProtoSpec::Udp => crate::forward::udp::run_client(node, peer, local_port).await,
        ProtoSpec::TcpOverDatagram => {
            crate::forward::tcp_over_datagram::run_client(node, peer, local_port).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_spec(secret: &str, proto: ProtoSpec, port: u16) -> ForwardSpec {
        ForwardSpec {
            role: Role::Server,
            proto,
            remote_port: port,
            local_port: None,
            host: "127.0.0.1".into(),
            secret: Some(secret.into()),
            peer_public_key: None,
        }
    }

    #[test]
    fn consolidated_command_groups_shared_secret() {
        let specs = vec![
            server_spec("shared", ProtoSpec::Tcp, 7000),
            server_spec("shared", ProtoSpec::Udp, 7001),
            server_spec("shared", ProtoSpec::TcpOverDatagram, 7002),
        ];
        let summary = build_summary(&specs).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(
            summary[0].pairs,
            vec![(Proto::Tcp, 7000), (Proto::Udp, 7001), (Proto::TcpOverDatagram, 7002)]
        );
    }

    #[test]
    fn distinct_secrets_print_separate_lines() {
        let specs = vec![
            server_spec("one", ProtoSpec::Tcp, 7000),
            server_spec("two", ProtoSpec::Tcp, 7001),
        ];
        let summary = build_summary(&specs).unwrap();
        assert_eq!(summary.len(), 2);
    }
}
