//! PeerIdentifier: the key naming a remote peer, usually a `host:port` address.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Peer identifier cannot be empty")]
    Empty,
    #[error("Peer identifier cannot contain whitespace: {0:?}")]
    Whitespace(String),
}

/// Identifies a peer by its address string.
///
/// Cheap to clone; equality and hashing are by the underlying string.
///
/// # Examples
/// ```
/// use peer_core::PeerIdentifier;
///
/// let id: PeerIdentifier = "127.0.0.1:4040".parse().unwrap();
/// assert_eq!(id.as_str(), "127.0.0.1:4040");
/// assert_eq!(id, PeerIdentifier::new("127.0.0.1:4040"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIdentifier(Arc<str>);

impl PeerIdentifier {
    /// Wrap an address without validation.
    pub fn new(address: impl Into<String>) -> Self {
        Self(Arc::from(address.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(IdentifierError::Whitespace(s.to_string()));
        }
        Ok(Self::new(s))
    }
}

impl From<std::net::SocketAddr> for PeerIdentifier {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.to_string())
    }
}

impl AsRef<str> for PeerIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for PeerIdentifier {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
