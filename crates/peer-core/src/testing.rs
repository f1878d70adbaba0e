//! In-memory transports for unit tests.

use crate::error::{ConnectError, PeerError};
use crate::identifier::PeerIdentifier;
use crate::peer::{Peer, SubscriberHandle, SubscriberKey};
use crate::signal::{ChangeSignal, Lifecycle};
use crate::status::ConnectionStatus;
use crate::transport::{Connector, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

// ============================================================================
// FakeConnector: scripted connectivity for maintainer tests
// ============================================================================

#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<HashMap<PeerIdentifier, usize>>,
    reachable: Mutex<HashSet<PeerIdentifier>>,
    hanging: Mutex<HashSet<PeerIdentifier>>,
    fail_next: Mutex<HashMap<PeerIdentifier, usize>>,
    signals: Mutex<HashMap<PeerIdentifier, Arc<ChangeSignal>>>,
    attempts: Mutex<Vec<(PeerIdentifier, Instant)>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reachable(&self, id: &PeerIdentifier, reachable: bool) {
        let mut set = self.reachable.lock().unwrap();
        if reachable {
            set.insert(id.clone());
        } else {
            set.remove(id);
        }
    }

    /// Make connects to `id` never complete.
    pub fn set_hanging(&self, id: &PeerIdentifier) {
        self.hanging.lock().unwrap().insert(id.clone());
    }

    /// Fail the next `n` connects to `id` even if it is reachable.
    pub fn fail_next(&self, id: &PeerIdentifier, n: usize) {
        self.fail_next.lock().unwrap().insert(id.clone(), n);
    }

    /// Simulate a peer-initiated connection.
    pub fn add_inbound(&self, id: &PeerIdentifier) {
        *self.connections.lock().unwrap().entry(id.clone()).or_default() += 1;
        self.raise(id);
    }

    /// Simulate every connection to `id` being lost.
    pub fn drop_connections(&self, id: &PeerIdentifier) {
        self.connections.lock().unwrap().remove(id);
        self.raise(id);
    }

    pub fn attempts(&self, id: &PeerIdentifier) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn is_watching(&self, id: &PeerIdentifier) -> bool {
        self.signals.lock().unwrap().contains_key(id)
    }

    fn raise(&self, id: &PeerIdentifier) {
        if let Some(signal) = self.signals.lock().unwrap().get(id) {
            signal.raise();
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn connection_count(&self, id: &PeerIdentifier) -> usize {
        self.connections.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    async fn connect(&self, id: &PeerIdentifier) -> Result<(), ConnectError> {
        self.attempts
            .lock()
            .unwrap()
            .push((id.clone(), Instant::now()));

        if self.hanging.lock().unwrap().contains(id) {
            std::future::pending::<()>().await;
        }

        {
            let mut fail_next = self.fail_next.lock().unwrap();
            if let Some(n) = fail_next.get_mut(id) {
                if *n > 0 {
                    *n -= 1;
                    return Err(ConnectError::Refused(id.clone()));
                }
            }
        }

        if self.reachable.lock().unwrap().contains(id) {
            self.add_inbound(id);
            Ok(())
        } else {
            Err(ConnectError::Refused(id.clone()))
        }
    }

    fn watch(&self, id: &PeerIdentifier, signal: Arc<ChangeSignal>) {
        self.signals.lock().unwrap().insert(id.clone(), signal);
    }

    fn unwatch(&self, id: &PeerIdentifier) {
        self.signals.lock().unwrap().remove(id);
    }
}

// ============================================================================
// ManualTransport: peers without maintainers, statuses driven by the test
// ============================================================================

#[derive(Default)]
pub struct ManualTransport {
    peers: Mutex<HashMap<PeerIdentifier, Arc<Peer>>>,
    refused: Mutex<HashSet<PeerIdentifier>>,
    releases: Mutex<Vec<PeerIdentifier>>,
    lifecycle: Lifecycle,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        let transport = Self::default();
        transport.lifecycle.start().unwrap();
        Arc::new(transport)
    }

    /// Stop the lifecycle without touching retained peers.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Make `retain` fail for `id` as if the transport had stopped.
    pub fn refuse(&self, id: &PeerIdentifier) {
        self.refused.lock().unwrap().insert(id.clone());
    }

    pub fn set_status(&self, id: &PeerIdentifier, status: ConnectionStatus) {
        let peer = self.peers.lock().unwrap().get(id).cloned();
        peer.expect("peer was never retained").set_status(status);
    }

    pub fn peer(&self, id: &PeerIdentifier) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(id).cloned()
    }

    pub fn releases(&self) -> Vec<PeerIdentifier> {
        self.releases.lock().unwrap().clone()
    }

    pub fn subscribers(&self, id: &PeerIdentifier) -> usize {
        self.peer(id).map(|p| p.subscriber_count()).unwrap_or(0)
    }
}

impl Transport for ManualTransport {
    fn retain(
        &self,
        id: &PeerIdentifier,
        subscriber: SubscriberHandle,
    ) -> Result<Arc<Peer>, PeerError> {
        if self.refused.lock().unwrap().contains(id) {
            return Err(PeerError::Stopped);
        }
        let peer = Arc::clone(
            self.peers
                .lock()
                .unwrap()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Peer::new(id.clone()))),
        );
        peer.subscribe(subscriber);
        Ok(peer)
    }

    fn release(&self, id: &PeerIdentifier, subscriber: SubscriberKey) -> Result<(), PeerError> {
        let peer = self
            .peer(id)
            .ok_or_else(|| PeerError::NotRetained(id.clone()))?;
        peer.unsubscribe(subscriber)
            .ok_or_else(|| PeerError::NotRetained(id.clone()))?;
        self.releases.lock().unwrap().push(id.clone());
        Ok(())
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

pub fn ids(addrs: &[&str]) -> Vec<PeerIdentifier> {
    addrs.iter().map(|a| PeerIdentifier::new(*a)).collect()
}
