//! Seams between peer lists, peers, and a concrete transport.
//!
//! Implementations:
//! - `peer-transport`: WebSocket dialing plus an inbound listener

use crate::error::{ConnectError, PeerError};
use crate::identifier::PeerIdentifier;
use crate::peer::{Peer, SubscriberHandle, SubscriberKey};
use crate::signal::{ChangeSignal, Lifecycle};
use async_trait::async_trait;
use std::sync::Arc;

/// What a peer list needs from a transport: shared, reference-counted peers.
pub trait Transport: Send + Sync {
    /// Retain the peer for `id` on behalf of `subscriber`, creating it (and
    /// its connection maintainer) if this is the first retention.
    ///
    /// Fails with `NotRunning` before start and `Stopped` after stop.
    fn retain(&self, id: &PeerIdentifier, subscriber: SubscriberHandle)
        -> Result<Arc<Peer>, PeerError>;

    /// Drop `subscriber`'s hold on `id`. The peer's maintainer stops when the
    /// last subscriber releases it.
    ///
    /// Releasing a pair that is not retained fails with `NotRetained` and
    /// changes nothing.
    fn release(&self, id: &PeerIdentifier, subscriber: SubscriberKey) -> Result<(), PeerError>;

    /// Start/stop state. Lists stop waiting for peers once it reports stopped.
    fn lifecycle(&self) -> &Lifecycle;
}

/// Raw connectivity used by connection maintainers.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Live inbound plus outbound connections to `id`.
    fn connection_count(&self, id: &PeerIdentifier) -> usize;

    /// Establish one connection to `id`.
    ///
    /// Callers bound this with their own timeout and may drop the future at
    /// any point; implementations must not leave half-registered connections
    /// behind when that happens.
    async fn connect(&self, id: &PeerIdentifier) -> Result<(), ConnectError>;

    /// Raise `signal` whenever a connection to `id` is added or lost.
    fn watch(&self, id: &PeerIdentifier, signal: Arc<ChangeSignal>);

    /// Stop raising the signal registered for `id`.
    fn unwatch(&self, id: &PeerIdentifier);
}
