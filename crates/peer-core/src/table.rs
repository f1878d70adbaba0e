//! Peer table: shared, reference-counted peers with one maintainer each.
//!
//! A transport embeds a `PeerTable` and implements `Transport` through it.
//! The first `retain` of an identifier creates the peer and spawns its
//! maintainer; the last `release` (or `shutdown`) ends it.

use crate::backoff::RetryPolicy;
use crate::error::PeerError;
use crate::identifier::PeerIdentifier;
use crate::maintainer::maintain;
use crate::peer::{Peer, SubscriberHandle, SubscriberKey};
use crate::signal::Lifecycle;
use crate::transport::{Connector, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, debug, debug_span, error};

pub struct PeerTable<C: Connector> {
    connector: Arc<C>,
    policy: RetryPolicy,
    lifecycle: Lifecycle,
    span: Span,
    runtime: OnceLock<Handle>,
    peers: Mutex<HashMap<PeerIdentifier, Arc<Peer>>>,
    /// Maintainer tasks, including ones still winding down after release.
    tasks: Mutex<JoinSet<()>>,
}

impl<C: Connector> PeerTable<C> {
    pub fn new(connector: Arc<C>, policy: RetryPolicy, span: Span) -> Self {
        Self {
            connector,
            policy,
            lifecycle: Lifecycle::new(),
            span,
            runtime: OnceLock::new(),
            peers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    /// Allow retains. Must run inside the runtime maintainers should use.
    ///
    /// Returns true for the call that actually started the table.
    pub fn start(&self) -> Result<bool, PeerError> {
        if let Ok(handle) = Handle::try_current() {
            let _ = self.runtime.set(handle);
        }
        if self.runtime.get().is_none() {
            return Err(PeerError::NotRunning);
        }
        self.lifecycle.start()
    }

    /// Stop every maintainer and wait for all of them to exit.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.lifecycle.stop() {
            debug!("Shutting down peer table");
        }

        let drained: Vec<(PeerIdentifier, Arc<Peer>)> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (id, _peer) in &drained {
            self.connector.unwatch(id);
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Connection maintainer panicked: {}", e);
                }
            }
        }
    }

    pub fn get(&self, id: &PeerIdentifier) -> Option<Arc<Peer>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Identifiers with at least one retaining subscriber.
    pub fn identifiers(&self) -> Vec<PeerIdentifier> {
        let mut ids: Vec<_> = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Maintainer tasks that have not exited yet.
    pub fn running_maintainers(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    fn spawn_maintainer(&self, peer: &Arc<Peer>) -> Result<(), PeerError> {
        let runtime = self.runtime.get().ok_or(PeerError::NotRunning)?;
        let span = debug_span!(parent: &self.span, "maintainer", peer = %peer.identifier());
        let task = maintain(
            Arc::clone(peer),
            Arc::clone(&self.connector),
            self.policy,
            self.lifecycle.clone(),
        )
        .instrument(span);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, runtime);
        Ok(())
    }
}

impl<C: Connector> Transport for PeerTable<C> {
    fn retain(
        &self,
        id: &PeerIdentifier,
        subscriber: SubscriberHandle,
    ) -> Result<Arc<Peer>, PeerError> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        // Checked under the lock so a concurrent shutdown cannot miss this peer.
        self.lifecycle.check_running()?;

        if let Some(peer) = peers.get(id) {
            peer.subscribe(subscriber);
            return Ok(Arc::clone(peer));
        }

        let peer = Arc::new(Peer::new(id.clone()));
        peer.subscribe(subscriber);
        self.connector
            .watch(id, Arc::clone(peer.change_signal()));
        if let Err(e) = self.spawn_maintainer(&peer) {
            self.connector.unwatch(id);
            return Err(e);
        }
        peers.insert(id.clone(), Arc::clone(&peer));
        debug!("Retained new peer {}", id);
        Ok(peer)
    }

    fn release(&self, id: &PeerIdentifier, subscriber: SubscriberKey) -> Result<(), PeerError> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(peer) = peers.get(id) else {
            self.lifecycle.check_running()?;
            return Err(PeerError::NotRetained(id.clone()));
        };

        let remaining = peer
            .unsubscribe(subscriber)
            .ok_or_else(|| PeerError::NotRetained(id.clone()))?;
        if remaining == 0 {
            if let Some(peer) = peers.remove(id) {
                self.connector.unwatch(id);
                peer.mark_released();
                debug!("Released last hold on peer {}", id);
            }
        }
        Ok(())
    }

    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}
