//! Error types shared by peer lists, peer tables, and transports.

use crate::identifier::PeerIdentifier;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by membership, lifecycle, and selection operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer {0} is already in the list")]
    AlreadyInList(PeerIdentifier),

    #[error("Peer {0} is not in the list")]
    NotInList(PeerIdentifier),

    #[error("Peer {0} is not retained by this subscriber")]
    NotRetained(PeerIdentifier),

    #[error("Transport is not running")]
    NotRunning,

    #[error("Transport has been stopped")]
    Stopped,

    #[error("No peer became available within {0:?}")]
    NoPeerAvailable(Duration),

    #[error("Peer list has been closed")]
    ListClosed,

    #[error("{} membership change(s) failed: {}", .0.len(), MembershipSummary(.0))]
    Membership(Vec<MembershipFailure>),
}

impl PeerError {
    /// True for errors caused by the transport's lifecycle rather than by the caller's input.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, PeerError::NotRunning | PeerError::Stopped)
    }
}

/// One identifier that could not be added to or removed from a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipFailure {
    pub identifier: PeerIdentifier,
    pub error: PeerError,
}

struct MembershipSummary<'a>(&'a [MembershipFailure]);

impl Display for MembershipSummary<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure.error)?;
        }
        Ok(())
    }
}

/// A failed attempt to establish a connection to a peer.
///
/// Never escapes a connection maintainer: it is logged and turned into an
/// `Unavailable` status.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Connection refused by {0}")]
    Refused(PeerIdentifier),

    #[error("Handshake with {peer} failed: {reason}")]
    Handshake {
        peer: PeerIdentifier,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connect error: {0}")]
    Other(String),
}
