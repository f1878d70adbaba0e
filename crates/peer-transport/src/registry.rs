//! Connection registry: every live connection, indexed by peer identifier.
//!
//! Implements `Connector` for the peer table. Connections dialed by a
//! maintainer and connections accepted by the listener land in the same
//! table, so a peer that connected to us counts as available without a dial.

use crate::connection::{Connection, ConnectionId, Direction, exchange_handshake};
use crate::handler::Handlers;
use crate::message::Handshake;
use async_trait::async_trait;
use peer_core::{ChangeSignal, ConnectError, Connector, PeerIdentifier};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{WebSocketStream, connect_async};
use tracing::{Span, debug, debug_span, info};

/// Shared registry handle. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    service: String,
    /// Our advertised address, known once the listener is bound
    address: OnceLock<String>,
    handlers: Arc<Handlers>,
    span: Span,
    next_id: AtomicU64,
    closed: AtomicBool,
    connections: Mutex<HashMap<PeerIdentifier, Vec<Arc<Connection>>>>,
    signals: Mutex<HashMap<PeerIdentifier, Arc<ChangeSignal>>>,
}

impl ConnectionRegistry {
    pub fn new(service: impl Into<String>, handlers: Arc<Handlers>, span: Span) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: service.into(),
                address: OnceLock::new(),
                handlers,
                span,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                connections: Mutex::new(HashMap::new()),
                signals: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record the address we advertise in handshakes. Only the first call
    /// has any effect.
    pub fn set_local_address(&self, address: impl Into<String>) {
        let _ = self.inner.address.set(address.into());
    }

    /// Our handshake, once the local address is known.
    pub fn local_handshake(&self) -> Option<Handshake> {
        self.inner.address.get().map(|address| Handshake {
            service: self.inner.service.clone(),
            address: address.clone(),
        })
    }

    /// Live connections to `id`, oldest first.
    pub fn connections(&self, id: &PeerIdentifier) -> Vec<Arc<Connection>> {
        self.inner
            .lock_connections()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total live connections across all peers.
    pub fn len(&self) -> usize {
        self.inner.lock_connections().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a handshaken stream under `peer` and start its tasks.
    ///
    /// Returns `None` (closing the stream) once the registry has been closed.
    pub(crate) fn register<S>(
        &self,
        peer: PeerIdentifier,
        direction: Direction,
        ws: WebSocketStream<S>,
    ) -> Option<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id: ConnectionId = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let span = debug_span!(parent: &self.inner.span, "connection", id, peer = %peer);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let mut connections = self.inner.lock_connections();
        if self.inner.closed.load(Ordering::Acquire) {
            debug!("Registry closed, dropping {:?} connection from {}", direction, peer);
            return None;
        }

        let conn = Connection::spawn(
            id,
            peer.clone(),
            direction,
            ws,
            Arc::clone(&self.inner.handlers),
            span,
            move |conn: &Connection| {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(conn.peer(), conn.id());
                }
            },
        );
        connections
            .entry(peer.clone())
            .or_default()
            .push(Arc::clone(&conn));
        drop(connections);

        debug!("Registered {:?} connection {} to {}", direction, id, peer);
        self.inner.raise(&peer);
        Some(conn)
    }

    /// Close every live connection and refuse new ones.
    pub async fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<Arc<Connection>> = self
            .inner
            .lock_connections()
            .drain()
            .flat_map(|(_, conns)| conns)
            .collect();

        if !drained.is_empty() {
            info!("Closing {} connection(s)", drained.len());
        }
        for conn in drained {
            conn.close().await;
        }
    }
}

impl Inner {
    fn lock_connections(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<PeerIdentifier, Vec<Arc<Connection>>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_signals(&self) -> std::sync::MutexGuard<'_, HashMap<PeerIdentifier, Arc<ChangeSignal>>> {
        self.signals.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, peer: &PeerIdentifier, id: ConnectionId) {
        let removed = {
            let mut connections = self.lock_connections();
            let Some(conns) = connections.get_mut(peer) else {
                return;
            };
            let before = conns.len();
            conns.retain(|c| c.id() != id);
            let removed = conns.len() != before;
            if conns.is_empty() {
                connections.remove(peer);
            }
            removed
        };

        if removed {
            debug!("Connection {} to {} went away", id, peer);
            self.raise(peer);
        }
    }

    fn raise(&self, peer: &PeerIdentifier) {
        if let Some(signal) = self.lock_signals().get(peer) {
            signal.raise();
        }
    }
}

#[async_trait]
impl Connector for ConnectionRegistry {
    fn connection_count(&self, id: &PeerIdentifier) -> usize {
        self.inner
            .lock_connections()
            .get(id)
            .map(|conns| conns.iter().filter(|c| !c.is_closed()).count())
            .unwrap_or(0)
    }

    async fn connect(&self, id: &PeerIdentifier) -> Result<(), ConnectError> {
        let ours = self
            .local_handshake()
            .ok_or_else(|| ConnectError::Other("transport has no listen address yet".into()))?;

        let url = format!("ws://{}", id);
        let (mut ws, _) = connect_async(url.as_str()).await.map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Io(io) => ConnectError::Io(io),
            other => ConnectError::Other(other.to_string()),
        })?;

        let theirs = exchange_handshake(&mut ws, &ours, Direction::Outbound)
            .await
            .map_err(|reason| ConnectError::Handshake {
                peer: id.clone(),
                reason,
            })?;
        if theirs.address != id.as_str() {
            debug!("{} advertises itself as {}", id, theirs.address);
        }

        // Registered under the dialed identifier: that is what the
        // maintainer counts.
        self.register(id.clone(), Direction::Outbound, ws)
            .map(|_| ())
            .ok_or_else(|| ConnectError::Other("transport is shutting down".into()))
    }

    fn watch(&self, id: &PeerIdentifier, signal: Arc<ChangeSignal>) {
        self.inner.lock_signals().insert(id.clone(), signal);
    }

    fn unwatch(&self, id: &PeerIdentifier) {
        self.inner.lock_signals().remove(id);
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("service", &self.inner.service)
            .field("address", &self.inner.address.get())
            .field("connections", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn stream_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            WebSocketStream::from_raw_socket(a, Role::Client, None).await,
            WebSocketStream::from_raw_socket(b, Role::Server, None).await,
        )
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new("svc", Arc::new(Handlers::new()), Span::none())
    }

    #[tokio::test]
    async fn test_register_counts_and_raises_signal() {
        let registry = registry();
        let peer = PeerIdentifier::new("127.0.0.1:9001");
        let signal = Arc::new(ChangeSignal::new());
        registry.watch(&peer, Arc::clone(&signal));

        let (local, _remote) = stream_pair().await;
        registry.register(peer.clone(), Direction::Inbound, local).unwrap();

        assert_eq!(registry.connection_count(&peer), 1);
        tokio::time::timeout(Duration::from_millis(50), signal.changed())
            .await
            .expect("registration should raise the watched signal");
    }

    #[tokio::test]
    async fn test_remote_close_unregisters() {
        let registry = registry();
        let peer = PeerIdentifier::new("127.0.0.1:9002");
        let signal = Arc::new(ChangeSignal::new());
        registry.watch(&peer, Arc::clone(&signal));

        let (local, mut remote) = stream_pair().await;
        registry.register(peer.clone(), Direction::Inbound, local).unwrap();
        signal.changed().await;

        remote.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.changed())
            .await
            .expect("losing the connection should raise the watched signal");
        assert_eq!(registry.connection_count(&peer), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unwatched_peer_is_not_signalled() {
        let registry = registry();
        let peer = PeerIdentifier::new("127.0.0.1:9003");
        let signal = Arc::new(ChangeSignal::new());
        registry.watch(&peer, Arc::clone(&signal));
        registry.unwatch(&peer);

        let (local, _remote) = stream_pair().await;
        registry.register(peer.clone(), Direction::Inbound, local).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), signal.changed())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_close_all_refuses_new_connections() {
        let registry = registry();
        let peer = PeerIdentifier::new("127.0.0.1:9004");

        let (local, _remote) = stream_pair().await;
        let conn = registry.register(peer.clone(), Direction::Inbound, local).unwrap();
        registry.close_all().await;

        assert!(conn.is_closed());
        assert_eq!(registry.connection_count(&peer), 0);

        let (late, _remote) = stream_pair().await;
        assert!(registry.register(peer, Direction::Inbound, late).is_none());
    }

    #[tokio::test]
    async fn test_connect_requires_local_address() {
        let registry = registry();
        let err = registry
            .connect(&PeerIdentifier::new("127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Other(_)));
    }
}
