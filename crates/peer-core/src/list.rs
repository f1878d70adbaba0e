//! PeerList: the selection-policy seam used by outbound callers.

use crate::error::PeerError;
use crate::identifier::PeerIdentifier;
use crate::peer::Peer;
use crate::status::ConnectionStatus;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A policy that hands out healthy peers for outbound calls.
#[async_trait]
pub trait PeerList: Send + Sync {
    /// Retain `added` and release `removed`.
    ///
    /// Removals are applied before additions. Every identifier is attempted;
    /// failures are collected into `PeerError::Membership` and leave the rest
    /// of the list untouched.
    fn update(
        &self,
        added: Vec<PeerIdentifier>,
        removed: Vec<PeerIdentifier>,
    ) -> Result<(), PeerError>;

    /// Pick an available peer, waiting up to `timeout` for one to appear.
    ///
    /// The returned `OnFinish` must be finished (or dropped) once the call
    /// made with the peer completes. Fails with `Stopped` as soon as the
    /// transport stops, without waiting out the timeout.
    async fn choose(&self, timeout: Duration) -> Result<(Arc<Peer>, OnFinish), PeerError>;

    /// Snapshot of membership and rotation state.
    fn introspect(&self) -> ListIntrospection;
}

/// Completion callback for a chosen peer.
///
/// Dropping it without calling `finish` counts as a successful completion.
pub struct OnFinish {
    peer: Option<Arc<Peer>>,
}

impl OnFinish {
    pub(crate) fn new(peer: Arc<Peer>) -> Self {
        peer.start_request();
        Self { peer: Some(peer) }
    }

    /// Record the outcome of the call.
    ///
    /// A failed call asks the peer's maintainer to re-check connectivity, so a
    /// dead connection leaves the rotation before the next call finds it.
    pub fn finish(mut self, error: Option<&dyn std::error::Error>) {
        if let Some(peer) = self.peer.take() {
            peer.end_request();
            if let Some(error) = error {
                debug!("Call to {} failed: {}", peer.identifier(), error);
                peer.change_signal().raise();
            }
        }
    }
}

impl Drop for OnFinish {
    fn drop(&mut self) {
        if let Some(peer) = self.peer.take() {
            peer.end_request();
        }
    }
}

impl std::fmt::Debug for OnFinish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnFinish")
            .field("peer", &self.peer.as_ref().map(|p| p.identifier()))
            .finish()
    }
}

/// Introspection view of one peer in a list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerIntrospection {
    pub identifier: PeerIdentifier,
    pub status: ConnectionStatus,
    pub pending_requests: usize,
    pub in_rotation: bool,
}

/// Introspection view of a whole list, in rotation order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListIntrospection {
    pub policy: &'static str,
    pub closed: bool,
    pub peers: Vec<PeerIntrospection>,
}

impl ListIntrospection {
    pub fn available(&self) -> usize {
        self.peers.iter().filter(|p| p.in_rotation).count()
    }
}
