use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tunnelmesh::forward::{ForwardSpec, ProtoSpec, Role};
use tunnelmesh::{ForwardManager, OverlayConfig, TunnelError};

/// spec.md §5: bridges get a grace period to end gracefully before the
/// process moves on and exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[clap(name = "tunnelmesh", about = "Peer-to-peer port forwarding over an encrypted overlay")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a local TCP/UDP port under an identity derived from `secret`.
    Server {
        #[clap(long, value_enum)]
        proto: ProtoArg,

        /// Local service port to expose.
        #[clap(long)]
        port: u16,

        /// Host the local service listens on.
        #[clap(long, default_value = "127.0.0.1")]
        host: String,

        /// Shared secret the identity is derived from.
        #[clap(long, env = "TUNNELMESH_SECRET")]
        secret: String,
    },

    /// Forward a local port to a server's advertised identity.
    Client {
        #[clap(long, value_enum)]
        proto: ProtoArg,

        /// The port label the server advertised this service under.
        #[clap(long)]
        remote_port: u16,

        /// Local port this client binds to.
        #[clap(long)]
        local_port: u16,

        /// The server's base58-encoded public key.
        #[clap(long)]
        peer: String,
    },

    /// Start every forward described by a JSON config file.
    Run {
        #[clap(long)]
        config: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ProtoArg {
    Tcp,
    Udp,
    Tcpudp,
}

impl From<ProtoArg> for ProtoSpec {
    fn from(p: ProtoArg) -> Self {
        match p {
            ProtoArg::Tcp => ProtoSpec::Tcp,
            ProtoArg::Udp => ProtoSpec::Udp,
            ProtoArg::Tcpudp => ProtoSpec::TcpOverDatagram,
        }
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tunnelmesh=info".parse().unwrap()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to install tracing subscriber");

    if let Err(e) = run().await {
        error!(error = %e, "tunnelmesh exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), TunnelError> {
    let cli = Cli::parse();

    let specs = match cli.command {
        Commands::Server { proto, port, host, secret } => vec![ForwardSpec {
            role: Role::Server,
            proto: proto.into(),
            remote_port: port,
            local_port: None,
            host,
            secret: Some(secret),
            peer_public_key: None,
        }],
        Commands::Client { proto, remote_port, local_port, peer } => vec![ForwardSpec {
            role: Role::Client,
            proto: proto.into(),
            remote_port,
            local_port: Some(local_port),
            host: "127.0.0.1".into(),
            secret: None,
            peer_public_key: Some(peer),
        }],
        Commands::Run { config } => {
            tunnelmesh::config::load_forward_specs(&config).map_err(TunnelError::Config)?
        }
    };

    let manager = ForwardManager::start(specs, OverlayConfig::default()).await?;
    info!(peer_id = %manager.local_peer_id(), "tunnelmesh running");

    wait_for_shutdown().await;
    info!("shutting down");
    tunnelmesh::forward::bridge::shutdown_all(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
    }
}
