//! Round-robin peer list.
//!
//! Peers rotate in the order they were added. Peers that are not
//! `Available` stay retained but are skipped until their maintainer reports
//! them available again.

use crate::error::{MembershipFailure, PeerError};
use crate::identifier::PeerIdentifier;
use crate::list::{ListIntrospection, OnFinish, PeerIntrospection, PeerList};
use crate::peer::{Peer, Subscriber, SubscriberHandle};
use crate::signal::LifecycleState;
use crate::transport::Transport;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Round-robin selection over a dynamic set of peers.
///
/// Cloning shares the same list. Peers still retained when the last clone is
/// dropped are released.
#[derive(Clone)]
pub struct RoundRobin {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    handle: SubscriberHandle,
    state: Mutex<State>,
    /// Woken when a peer enters the rotation or the list closes.
    available_changed: Notify,
}

#[derive(Default)]
struct State {
    /// Retained identifiers in insertion order
    order: Vec<PeerIdentifier>,
    peers: HashMap<PeerIdentifier, Arc<Peer>>,
    /// The subset of `order` currently in rotation
    available: HashSet<PeerIdentifier>,
    /// Index into `order` where the next search starts
    cursor: usize,
    closed: bool,
}

impl State {
    fn next_available(&mut self) -> Option<Arc<Peer>> {
        let len = self.order.len();
        for step in 0..len {
            let index = (self.cursor + step) % len;
            let id = &self.order[index];
            if self.available.contains(id) {
                self.cursor = (index + 1) % len;
                return self.peers.get(id).cloned();
            }
        }
        None
    }

    fn remove(&mut self, id: &PeerIdentifier) -> Option<Arc<Peer>> {
        let peer = self.peers.remove(id)?;
        self.available.remove(id);
        if let Some(index) = self.order.iter().position(|o| o == id) {
            self.order.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.order.len() {
                self.cursor = 0;
            }
        }
        Some(peer)
    }
}

impl RoundRobin {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let subscriber: Weak<dyn Subscriber> = weak.clone();
            Shared {
                transport,
                handle: SubscriberHandle::new(subscriber),
                state: Mutex::new(State::default()),
                available_changed: Notify::new(),
            }
        });
        Self { shared }
    }

    /// Number of retained peers.
    pub fn len(&self) -> usize {
        self.shared.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained identifiers in rotation order.
    pub fn identifiers(&self) -> Vec<PeerIdentifier> {
        self.shared.lock().order.clone()
    }

    /// Release every retained peer and refuse further use.
    ///
    /// Pending and future `choose` calls fail with `ListClosed`. Releases
    /// refused because the transport already stopped are ignored; its
    /// shutdown released those peers.
    pub fn close(&self) -> Result<(), PeerError> {
        let retained = {
            let mut state = self.shared.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.available.clear();
            state.cursor = 0;
            state.peers.clear();
            std::mem::take(&mut state.order)
        };
        self.shared.available_changed.notify_waiters();

        let failures: Vec<_> = retained
            .into_iter()
            .filter_map(|id| match self.shared.release(&id) {
                Ok(()) => None,
                Err(e) if e.is_lifecycle() => None,
                Err(error) => Some(MembershipFailure {
                    identifier: id,
                    error,
                }),
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PeerError::Membership(failures))
        }
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add(&self, id: PeerIdentifier) -> Result<(), PeerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PeerError::ListClosed);
        }
        if state.peers.contains_key(&id) {
            return Err(PeerError::AlreadyInList(id));
        }

        // Retained under the lock: a notification racing with this add waits
        // for it and then sees the peer.
        let peer = self.transport.retain(&id, self.handle.clone())?;
        let available = peer.status().is_available();
        state.order.push(id.clone());
        state.peers.insert(id.clone(), peer);
        if available {
            state.available.insert(id);
            drop(state);
            self.available_changed.notify_waiters();
        }
        Ok(())
    }

    fn remove(&self, id: &PeerIdentifier) -> Result<(), PeerError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PeerError::ListClosed);
        }
        state
            .remove(id)
            .ok_or_else(|| PeerError::NotInList(id.clone()))?;
        drop(state);

        if let Err(e) = self.release(id) {
            // The list no longer holds the peer either way.
            debug!("Release of {} refused: {}", id, e);
        }
        Ok(())
    }

    fn release(&self, id: &PeerIdentifier) -> Result<(), PeerError> {
        self.transport.release(id, self.handle.key())
    }
}

impl Subscriber for Shared {
    fn notify_status_changed(&self, id: &PeerIdentifier) {
        let mut state = self.lock();
        let Some(peer) = state.peers.get(id) else {
            return;
        };

        if peer.status().is_available() {
            if state.available.insert(id.clone()) {
                drop(state);
                debug!("Peer {} entered rotation", id);
                self.available_changed.notify_waiters();
            }
        } else if state.available.remove(id) {
            debug!("Peer {} left rotation", id);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return;
        }
        for id in std::mem::take(&mut state.order) {
            let _ = self.transport.release(&id, self.handle.key());
        }
    }
}

#[async_trait]
impl PeerList for RoundRobin {
    fn update(
        &self,
        added: Vec<PeerIdentifier>,
        removed: Vec<PeerIdentifier>,
    ) -> Result<(), PeerError> {
        let mut failures = Vec::new();

        for id in removed {
            if let Err(error) = self.shared.remove(&id) {
                failures.push(MembershipFailure {
                    identifier: id,
                    error,
                });
            }
        }
        for id in added {
            if let Err(error) = self.shared.add(id.clone()) {
                failures.push(MembershipFailure {
                    identifier: id,
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PeerError::Membership(failures))
        }
    }

    async fn choose(&self, timeout: Duration) -> Result<(Arc<Peer>, OnFinish), PeerError> {
        let deadline = Instant::now().checked_add(timeout);
        let lifecycle = self.shared.transport.lifecycle();

        loop {
            // Register interest before looking so a peer arriving in between
            // still wakes us.
            let notified = self.shared.available_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PeerError::ListClosed);
                }
                if lifecycle.state() == LifecycleState::Stopped {
                    return Err(PeerError::Stopped);
                }
                if let Some(peer) = state.next_available() {
                    let finish = OnFinish::new(Arc::clone(&peer));
                    return Ok((peer, finish));
                }
            }

            let woken = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
                    None => {
                        notified.await;
                        true
                    }
                }
            };
            tokio::select! {
                woken = woken => {
                    if !woken {
                        return Err(PeerError::NoPeerAvailable(timeout));
                    }
                }
                _ = lifecycle.stopped() => return Err(PeerError::Stopped),
            }
        }
    }

    fn introspect(&self) -> ListIntrospection {
        let state = self.shared.lock();
        let peers = state
            .order
            .iter()
            .filter_map(|id| state.peers.get(id))
            .map(|peer| PeerIntrospection {
                identifier: peer.identifier().clone(),
                status: peer.status(),
                pending_requests: peer.pending_requests(),
                in_rotation: state.available.contains(peer.identifier()),
            })
            .collect();

        ListIntrospection {
            policy: "round-robin",
            closed: state.closed,
            peers,
        }
    }
}
