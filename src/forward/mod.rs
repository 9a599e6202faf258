//! Forwarder Engines (C3): the three bridging variants spec.md §4.3
//! describes, plus the probe and bridging discipline they share.

pub mod bridge;
pub mod probe;
pub mod tcp;
pub mod tcp_over_datagram;
pub mod udp;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::keys::{Proto, Secret, SubPublicKey};

/// Which side of a tunnel a [`ForwardSpec`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

/// On-disk / wire shape of [`Proto`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtoSpec {
    Tcp,
    Udp,
    TcpOverDatagram,
}

impl From<ProtoSpec> for Proto {
    fn from(p: ProtoSpec) -> Self {
        match p {
            ProtoSpec::Tcp => Proto::Tcp,
            ProtoSpec::Udp => Proto::Udp,
            ProtoSpec::TcpOverDatagram => Proto::TcpOverDatagram,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// A single tunneled forward, as consumed by the forward manager (spec.md
/// §3). `localPort`/`remotePort` are kept distinct fields per §9's
/// port-parameter-duplication note: the historical CLI overloaded `-p` for
/// both "bind here" and "dial there", which this schema does not repeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub role: Role,
    pub proto: ProtoSpec,

    /// Server: the local service port to expose. Client: the port label
    /// used for sub-key derivation; must match the server's exposed port.
    pub remote_port: u16,

    /// Client only: where the client-side listener binds.
    #[serde(default)]
    pub local_port: Option<u16>,

    /// Server only, default `127.0.0.1`.
    #[serde(default = "default_host")]
    pub host: String,

    /// Server only.
    #[serde(default)]
    pub secret: Option<String>,

    /// Client only, base58-encoded.
    #[serde(default)]
    pub peer_public_key: Option<String>,
}

impl ForwardSpec {
    pub fn proto(&self) -> Proto {
        self.proto.into()
    }

    /// Validate field presence for the declared role and resolve the
    /// server's [`Secret`]. Fatal (`ConfigError`) at startup per spec.md §7.
    pub fn secret(&self) -> Result<Secret, ConfigError> {
        match &self.secret {
            Some(s) => Ok(Secret::from(s.as_str())),
            None => Err(ConfigError::MissingSecret(self.remote_port)),
        }
    }

    /// Resolve the client's peer sub-public-key from the configured root
    /// public key and this spec's (proto, remote_port) label.
    pub fn peer_sub_public(&self) -> Result<SubPublicKey, ConfigError> {
        let encoded = self
            .peer_public_key
            .as_deref()
            .ok_or(ConfigError::MissingPeerKey(self.remote_port))?;
        let root = crate::keys::RootPublicKey::from_base58(encoded)?;
        Ok(root.derive_sub_public(self.proto(), self.remote_port))
    }

    pub fn local_port(&self) -> Result<u16, ConfigError> {
        self.local_port
            .ok_or(ConfigError::MissingField("local_port"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.role {
            Role::Server => {
                if self.secret.is_none() {
                    return Err(ConfigError::MissingSecret(self.remote_port));
                }
            }
            Role::Client => {
                if self.peer_public_key.is_none() {
                    return Err(ConfigError::MissingPeerKey(self.remote_port));
                }
                if self.local_port.is_none() {
                    return Err(ConfigError::MissingField("local_port"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_spec_requires_secret() {
        let spec = ForwardSpec {
            role: Role::Server,
            proto: ProtoSpec::Tcp,
            remote_port: 7000,
            local_port: None,
            host: default_host(),
            secret: None,
            peer_public_key: None,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn client_spec_requires_peer_key_and_local_port() {
        let mut spec = ForwardSpec {
            role: Role::Client,
            proto: ProtoSpec::Tcp,
            remote_port: 7000,
            local_port: None,
            host: default_host(),
            secret: None,
            peer_public_key: None,
        };
        assert!(spec.validate().is_err());
        spec.peer_public_key = Some("not-checked-here".into());
        assert!(spec.validate().is_err());
        spec.local_port = Some(17000);
        assert!(spec.validate().is_ok());
    }
}
