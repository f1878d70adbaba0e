//! Transport lifecycle and outbound call errors.

use peer_core::{PeerError, PeerIdentifier};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport has not been started")]
    NotStarted,

    #[error("Transport has been stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PeerError> for TransportError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::NotRunning => TransportError::NotStarted,
            _ => TransportError::Stopped,
        }
    }
}

/// Failure of a single outbound call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("No peer to call: {0}")]
    Choose(#[from] PeerError),

    #[error("Peer {0} has no live connection")]
    NoConnection(PeerIdentifier),

    #[error("Failed to send request to {peer}: {reason}")]
    Send { peer: PeerIdentifier, reason: String },

    #[error("Peer {peer} returned an error: {message}")]
    Remote {
        peer: PeerIdentifier,
        message: String,
    },

    #[error("Call to {peer} timed out after {timeout:?}")]
    Timeout {
        peer: PeerIdentifier,
        timeout: Duration,
    },

    #[error("Connection to {0} closed before the response arrived")]
    Closed(PeerIdentifier),
}

impl CallError {
    /// The peer the call was routed to, if one was chosen.
    pub fn peer(&self) -> Option<&PeerIdentifier> {
        match self {
            CallError::Choose(_) => None,
            CallError::NoConnection(peer)
            | CallError::Send { peer, .. }
            | CallError::Remote { peer, .. }
            | CallError::Timeout { peer, .. }
            | CallError::Closed(peer) => Some(peer),
        }
    }

    /// True when the failure says something about the peer's connectivity.
    ///
    /// An application-level error from a healthy peer does not.
    pub fn is_connectivity(&self) -> bool {
        !matches!(self, CallError::Choose(_) | CallError::Remote { .. })
    }
}
