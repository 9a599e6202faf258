//! Key derivation (C1).
//!
//! A root keypair is derived deterministically from an opaque secret; a
//! sub-keypair is derived deterministically from the root under a label of
//! `proto ++ decimal(port)`. The derivation is a Ristretto scalar/point tweak
//! (the same shape as CryptoNote-style subaddress schemes) rather than a
//! re-hash-and-regenerate scheme, specifically so that the *public* side of a
//! sub-keypair is computable from the root's public key alone: a client
//! that only knows `RootPublicKey` never needs the root private scalar.

use std::fmt;

use blake2::{Blake2b512, Digest};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_TABLE;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use sha2::Sha512;

use crate::error::ConfigError;

const SUBKEY_DOMAIN_TAG: &[u8] = b"tunnelmesh-subkey-v1";

/// Opaque secret used only by key derivation. Typically 32 bytes; any length
/// is accepted and fed to the root hash.
#[derive(Clone)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(REDACTED, {} bytes)", self.0.len())
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Secret(s.as_bytes().to_vec())
    }
}

/// The transport tag used in sub-key labels. Order and spelling are part of
/// the wire contract: two peers computing `"tcp7000"` must agree byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    TcpOverDatagram,
}

impl Proto {
    pub fn tag(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::TcpOverDatagram => "tcpudp",
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

fn label_bytes(proto: Proto, port: u16) -> Vec<u8> {
    format!("{}{}", proto.tag(), port).into_bytes()
}

fn scalar_from_wide(bytes: &[u8]) -> Scalar {
    let mut wide = [0u8; 64];
    let n = bytes.len().min(64);
    wide[..n].copy_from_slice(&bytes[..n]);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// `Hs(root_public || label)`, domain-separated, reduced to a scalar tweak.
/// Shared by both the private-key and public-only derivation paths so they
/// are guaranteed to agree.
fn sub_tweak(root_public_bytes: &[u8; 32], proto: Proto, port: u16) -> Scalar {
    let mut hasher = Blake2b512::new();
    hasher.update(SUBKEY_DOMAIN_TAG);
    hasher.update(root_public_bytes);
    hasher.update(label_bytes(proto, port));
    let digest = hasher.finalize();
    scalar_from_wide(&digest)
}

/// The public half of a root or sub keypair: a compressed Ristretto point.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RootPublicKey(RistrettoPoint);

impl RootPublicKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let compressed = CompressedRistretto::from_slice(bytes)
            .map_err(|_| ConfigError::InvalidPublicKey("wrong length".into()))?;
        let point = compressed
            .decompress()
            .ok_or_else(|| ConfigError::InvalidPublicKey("not a valid point".into()))?;
        Ok(Self(point))
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, ConfigError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ConfigError::InvalidPublicKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Derive the public side of a sub-keypair given only the root public
    /// key and the (proto, port) label. No private material is required.
    pub fn derive_sub_public(&self, proto: Proto, port: u16) -> SubPublicKey {
        let hs = sub_tweak(&self.to_bytes(), proto, port);
        SubPublicKey(self.0 + &hs * &RISTRETTO_BASEPOINT_TABLE)
    }
}

impl fmt::Debug for RootPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootPublicKey({})", self.to_base58())
    }
}

impl fmt::Display for RootPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

/// The private half of a root keypair. Never serialized, never logged.
#[derive(Clone)]
pub struct RootPrivateKey(Scalar);

impl fmt::Debug for RootPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootPrivateKey(REDACTED)")
    }
}

#[derive(Clone, Debug)]
pub struct RootKeyPair {
    pub public: RootPublicKey,
    pub private: RootPrivateKey,
}

impl RootKeyPair {
    /// Construct the server-side sub-keypair (both private and public halves).
    pub fn derive_sub(&self, proto: Proto, port: u16) -> SubKeyPair {
        let hs = sub_tweak(&self.public.to_bytes(), proto, port);
        let sub_private = self.private.0 + hs;
        SubKeyPair {
            public: SubPublicKey(&sub_private * &RISTRETTO_BASEPOINT_TABLE),
            private: Some(SubPrivateKey(sub_private)),
        }
    }
}

/// `derive_root(secret)`: hash `secret`, expand into a Ristretto scalar seed.
/// Deterministic and collision-resistant in `secret`.
pub fn derive_root(secret: &Secret) -> RootKeyPair {
    let digest = Sha512::digest(secret.as_bytes());
    let private = scalar_from_wide(&digest);
    let public = &private * &RISTRETTO_BASEPOINT_TABLE;
    RootKeyPair {
        public: RootPublicKey(public),
        private: RootPrivateKey(private),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SubPublicKey(RistrettoPoint);

impl SubPublicKey {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let compressed = CompressedRistretto::from_slice(bytes)
            .map_err(|_| ConfigError::InvalidPublicKey("wrong length".into()))?;
        let point = compressed
            .decompress()
            .ok_or_else(|| ConfigError::InvalidPublicKey("not a valid point".into()))?;
        Ok(Self(point))
    }

    /// Raw bytes suitable for use as a DHT record key. A sub public key
    /// carries no label information of its own; only the peer that already
    /// knows the label can have derived this exact point.
    pub fn as_record_key(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

impl fmt::Debug for SubPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubPublicKey({})", bs58::encode(self.to_bytes()).into_string())
    }
}

#[derive(Clone)]
pub struct SubPrivateKey(Scalar);

impl fmt::Debug for SubPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubPrivateKey(REDACTED)")
    }
}

/// A deterministic sub-derivation from a root keypair for a given
/// (proto, port) label. The server holds `private`; a client holds only
/// `public`, constructed via [`RootPublicKey::derive_sub_public`].
#[derive(Clone, Debug)]
pub struct SubKeyPair {
    pub public: SubPublicKey,
    pub private: Option<SubPrivateKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_derivation_matches_private_derivation() {
        let root = derive_root(&Secret::from("abc"));
        let full = root.derive_sub(Proto::Tcp, 7000);
        let public_only = root.public.derive_sub_public(Proto::Tcp, 7000);
        assert_eq!(full.public.to_bytes(), public_only.to_bytes());
    }

    #[test]
    fn distinct_labels_produce_distinct_keys() {
        let root = derive_root(&Secret::from("abc"));
        let a = root.derive_sub(Proto::Tcp, 7000);
        let b = root.derive_sub(Proto::Tcp, 7001);
        let c = root.derive_sub(Proto::Udp, 7000);
        assert_ne!(a.public.to_bytes(), b.public.to_bytes());
        assert_ne!(a.public.to_bytes(), c.public.to_bytes());
    }

    #[test]
    fn root_public_base58_is_stable() {
        let root = derive_root(&Secret::from("abc"));
        let encoded_again = derive_root(&Secret::from("abc")).public.to_base58();
        assert_eq!(root.public.to_base58(), encoded_again);
    }

    #[test]
    fn base58_roundtrips() {
        let root = derive_root(&Secret::from("abc"));
        let encoded = root.public.to_base58();
        let decoded = RootPublicKey::from_base58(&encoded).unwrap();
        assert_eq!(root.public.to_bytes(), decoded.to_bytes());
    }
}
