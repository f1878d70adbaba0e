//! Peer handles and the subscriber protocol.
//!
//! A `Peer` tracks one remote endpoint's `ConnectionStatus` and the set of
//! subscribers (usually peer lists) retaining it. Only the peer's connection
//! maintainer writes the status; every write is pushed to each subscriber.

use crate::identifier::PeerIdentifier;
use crate::signal::ChangeSignal;
use crate::status::ConnectionStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::watch;
use tracing::debug;

/// Receives status-change notifications from retained peers.
///
/// Notifications carry only the identifier. Implementations must re-read
/// `Peer::status()`; a burst of transitions may arrive as fewer calls than
/// transitions, and callbacks may run concurrently for different peers.
///
/// Callbacks run synchronously on the task of the maintainer that changed
/// the status, which waits for them before dialing again. Keep them short
/// and non-blocking; hand longer work to a task of your own. Subscribing or
/// unsubscribing from inside a callback is allowed.
pub trait Subscriber: Send + Sync {
    fn notify_status_changed(&self, id: &PeerIdentifier);
}

/// Stable identity of a subscriber, used to pair retain and release calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberKey(usize);

impl SubscriberKey {
    fn next() -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A subscriber as seen by the peers it retains.
///
/// Held weakly so that a peer never keeps a dropped list alive.
#[derive(Clone)]
pub struct SubscriberHandle {
    key: SubscriberKey,
    subscriber: Weak<dyn Subscriber>,
}

impl SubscriberHandle {
    /// Wrap a subscriber, allocating a fresh key for it.
    pub fn new(subscriber: Weak<dyn Subscriber>) -> Self {
        Self {
            key: SubscriberKey::next(),
            subscriber,
        }
    }

    pub fn key(&self) -> SubscriberKey {
        self.key
    }

    fn upgrade(&self) -> Option<Arc<dyn Subscriber>> {
        self.subscriber.upgrade()
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Handle to one remote peer.
pub struct Peer {
    identifier: PeerIdentifier,
    status: RwLock<ConnectionStatus>,
    pending: AtomicUsize,
    subscribers: Mutex<Vec<SubscriberHandle>>,
    changed: Arc<ChangeSignal>,
    released: watch::Sender<bool>,
}

impl Peer {
    /// Create a peer in the `Unavailable` state with no subscribers.
    pub(crate) fn new(identifier: PeerIdentifier) -> Self {
        let (released, _rx) = watch::channel(false);
        Self {
            identifier,
            status: RwLock::new(ConnectionStatus::Unavailable),
            pending: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
            changed: Arc::new(ChangeSignal::new()),
            released,
        }
    }

    pub fn identifier(&self) -> &PeerIdentifier {
        &self.identifier
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Requests handed out by `choose` and not yet finished.
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of subscribers currently retaining this peer.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Store a new status and notify every subscriber once.
    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let previous = {
            let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *current, status)
        };
        if previous != status {
            debug!("Peer {} is now {} (was {})", self.identifier, status, previous);
        }

        // Snapshot so a subscriber may retain/release from inside its callback.
        let subscribers: Vec<_> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(SubscriberHandle::upgrade)
            .collect();

        for subscriber in subscribers {
            subscriber.notify_status_changed(&self.identifier);
        }
    }

    /// Add a subscriber. Returns false if it was already subscribed.
    pub(crate) fn subscribe(&self, handle: SubscriberHandle) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if subscribers.iter().any(|s| s.key == handle.key) {
            return false;
        }
        subscribers.push(handle);
        true
    }

    /// Remove a subscriber, returning how many remain, or `None` if it was
    /// not subscribed.
    pub(crate) fn unsubscribe(&self, key: SubscriberKey) -> Option<usize> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let index = subscribers.iter().position(|s| s.key == key)?;
        subscribers.remove(index);
        Some(subscribers.len())
    }

    pub(crate) fn start_request(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        // Saturating: an unmatched end never wraps the counter.
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Wake-up raised whenever this peer's connectivity may have changed.
    pub(crate) fn change_signal(&self) -> &Arc<ChangeSignal> {
        &self.changed
    }

    pub(crate) fn mark_released(&self) {
        self.released.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.released.borrow()
    }

    /// Resolves once the last subscriber has released this peer.
    pub(crate) async fn released(&self) {
        let mut rx = self.released.subscribe();
        let _ = rx.wait_for(|released| *released).await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("identifier", &self.identifier)
            .field("status", &self.status())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(PeerIdentifier, ConnectionStatus)>>,
        peer: Mutex<Option<Arc<Peer>>>,
    }

    impl Subscriber for Recorder {
        fn notify_status_changed(&self, id: &PeerIdentifier) {
            let peer = self.peer.lock().unwrap().clone().unwrap();
            self.seen.lock().unwrap().push((id.clone(), peer.status()));
        }
    }

    fn handle_for(recorder: &Arc<Recorder>) -> SubscriberHandle {
        let weak: Weak<dyn Subscriber> = Arc::downgrade(recorder) as Weak<dyn Subscriber>;
        SubscriberHandle::new(weak)
    }

    #[test]
    fn test_new_peer_is_unavailable() {
        let peer = Peer::new(PeerIdentifier::new("a:1"));
        assert_eq!(peer.status(), ConnectionStatus::Unavailable);
        assert_eq!(peer.subscriber_count(), 0);
        assert!(!peer.is_released());
    }

    #[test]
    fn test_set_status_notifies_each_subscriber_once_per_call() {
        let peer = Arc::new(Peer::new(PeerIdentifier::new("a:1")));
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        *first.peer.lock().unwrap() = Some(Arc::clone(&peer));
        *second.peer.lock().unwrap() = Some(Arc::clone(&peer));

        assert!(peer.subscribe(handle_for(&first)));
        assert!(peer.subscribe(handle_for(&second)));

        peer.set_status(ConnectionStatus::Connecting);
        peer.set_status(ConnectionStatus::Available);
        // Same value again still notifies.
        peer.set_status(ConnectionStatus::Available);

        for recorder in [&first, &second] {
            let seen = recorder.seen.lock().unwrap();
            let statuses: Vec<_> = seen.iter().map(|(_, s)| *s).collect();
            assert_eq!(
                statuses,
                vec![
                    ConnectionStatus::Connecting,
                    ConnectionStatus::Available,
                    ConnectionStatus::Available
                ]
            );
        }
    }

    #[test]
    fn test_subscribe_is_keyed() {
        let peer = Peer::new(PeerIdentifier::new("a:1"));
        let recorder = Arc::new(Recorder::default());
        let handle = handle_for(&recorder);

        assert!(peer.subscribe(handle.clone()));
        assert!(!peer.subscribe(handle.clone()));
        assert_eq!(peer.subscriber_count(), 1);

        assert_eq!(peer.unsubscribe(handle.key()), Some(0));
        assert_eq!(peer.unsubscribe(handle.key()), None);
    }

    struct Unsubscriber {
        peer: Arc<Peer>,
        key: Mutex<Option<SubscriberKey>>,
        calls: AtomicUsize,
    }

    impl Subscriber for Unsubscriber {
        fn notify_status_changed(&self, _id: &PeerIdentifier) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(key) = self.key.lock().unwrap().take() {
                self.peer.unsubscribe(key);
            }
        }
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let peer = Arc::new(Peer::new(PeerIdentifier::new("a:1")));
        let subscriber = Arc::new(Unsubscriber {
            peer: Arc::clone(&peer),
            key: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });
        let weak: Weak<dyn Subscriber> = Arc::downgrade(&subscriber) as Weak<dyn Subscriber>;
        let handle = SubscriberHandle::new(weak);
        *subscriber.key.lock().unwrap() = Some(handle.key());
        peer.subscribe(handle);

        // Runs inline and must not deadlock on the subscriber set.
        peer.set_status(ConnectionStatus::Available);
        assert_eq!(subscriber.calls.load(Ordering::SeqCst), 1);
        assert_eq!(peer.subscriber_count(), 0);

        peer.set_status(ConnectionStatus::Unavailable);
        assert_eq!(subscriber.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_subscriber_is_skipped() {
        let peer = Peer::new(PeerIdentifier::new("a:1"));
        let recorder = Arc::new(Recorder::default());
        peer.subscribe(handle_for(&recorder));
        drop(recorder);

        // Must not panic on the dead weak reference.
        peer.set_status(ConnectionStatus::Available);
        assert_eq!(peer.status(), ConnectionStatus::Available);
    }

    #[test]
    fn test_end_request_saturates() {
        let peer = Peer::new(PeerIdentifier::new("a:1"));
        peer.end_request();
        assert_eq!(peer.pending_requests(), 0);

        peer.start_request();
        peer.start_request();
        peer.end_request();
        assert_eq!(peer.pending_requests(), 1);
    }
}
