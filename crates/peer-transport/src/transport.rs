//! WebSocket transport: listener, connection registry, and peer table under
//! one start/stop lifecycle.

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::handler::{Handler, Handlers};
use crate::registry::ConnectionRegistry;
use crate::server::accept_loop;
use peer_core::{
    Lifecycle, LifecycleState, Peer, PeerError, PeerIdentifier, PeerTable, SubscriberHandle,
    SubscriberKey, Transport,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, info, info_span};

/// A transport that keeps retained peers connected over WebSocket.
///
/// Share it as `Arc<WsTransport>`; peer lists take it as `Arc<dyn Transport>`.
pub struct WsTransport {
    config: TransportConfig,
    /// Pre-bound listener, consumed by the first start
    prebound: Mutex<Option<std::net::TcpListener>>,
    handlers: Arc<Handlers>,
    registry: ConnectionRegistry,
    table: PeerTable<ConnectionRegistry>,
    started: OnceCell<SocketAddr>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl WsTransport {
    /// Build a transport. Performs no I/O.
    pub fn new(mut config: TransportConfig) -> Self {
        let prebound = config.listener.take();
        let span = info_span!(parent: &config.tracer, "transport", service = %config.service_name);
        let handlers = Arc::new(Handlers::new());
        let registry =
            ConnectionRegistry::new(config.service_name.clone(), Arc::clone(&handlers), span.clone());
        let table = PeerTable::new(Arc::new(registry.clone()), config.retry, span.clone());

        Self {
            config,
            prebound: Mutex::new(prebound),
            handlers,
            registry,
            table,
            started: OnceCell::new(),
            accept_task: Mutex::new(None),
            span,
        }
    }

    /// Bind the listener and allow peers to be retained.
    ///
    /// Concurrent and repeated calls share one listener and return its
    /// address. Fails with `Stopped` once the transport has been stopped.
    pub async fn start(&self) -> Result<SocketAddr, TransportError> {
        if self.table.lifecycle().state() == LifecycleState::Stopped {
            return Err(TransportError::Stopped);
        }
        let addr = self.started.get_or_try_init(|| self.listen()).await?;
        Ok(*addr)
    }

    async fn listen(&self) -> Result<SocketAddr, TransportError> {
        let prebound = self
            .prebound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let listener = match prebound {
            Some(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
            None => TcpListener::bind(self.config.listen_addr)
                .await
                .map_err(|source| TransportError::Bind {
                    addr: self.config.listen_addr.to_string(),
                    source,
                })?,
        };
        let local = listener.local_addr()?;
        self.registry.set_local_address(local.to_string());

        // Held until the task is stored: a stop that sees us running must
        // also find the accept loop to join.
        let mut accept_task = self.accept_task.lock().unwrap_or_else(|e| e.into_inner());

        // Fails if a concurrent stop won the race; the listener is dropped.
        self.table.start()?;

        *accept_task = Some(tokio::spawn(
            accept_loop(
                listener,
                self.registry.clone(),
                self.table.lifecycle().clone(),
                self.config.connection_timeout(),
            )
            .instrument(self.span.clone()),
        ));
        drop(accept_task);

        info!("Transport listening on {}", local);
        Ok(local)
    }

    /// Stop every maintainer, the listener, and every live connection.
    ///
    /// Returns once all of them have finished. Safe to call more than once,
    /// and before `start`.
    pub async fn stop(&self) {
        let was_running = self.table.lifecycle().state() == LifecycleState::Running;
        self.table.shutdown().await;

        let accept = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = accept {
            let _ = task.await;
        }

        self.registry.close_all().await;
        if was_running {
            info!("Transport stopped");
        } else {
            debug!("Transport stop requested while not running");
        }
    }

    pub fn is_running(&self) -> bool {
        self.table.lifecycle().state() == LifecycleState::Running
    }

    /// Bound address, once started. This is the identity we advertise.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.started.get().copied()
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Serve `procedure` for requests arriving on any connection.
    pub fn register(&self, procedure: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.register(procedure, handler);
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The shared peer for `id`, if any list currently retains it.
    pub fn peer(&self, id: &PeerIdentifier) -> Option<Arc<Peer>> {
        self.table.get(id)
    }

    /// Identifiers retained by at least one list.
    pub fn retained_peers(&self) -> Vec<PeerIdentifier> {
        self.table.identifiers()
    }

    /// Connection maintainers that have not exited yet.
    pub fn running_maintainers(&self) -> usize {
        self.table.running_maintainers()
    }
}

impl Transport for WsTransport {
    fn retain(
        &self,
        id: &PeerIdentifier,
        subscriber: SubscriberHandle,
    ) -> Result<Arc<Peer>, PeerError> {
        self.table.retain(id, subscriber)
    }

    fn release(&self, id: &PeerIdentifier, subscriber: SubscriberKey) -> Result<(), PeerError> {
        self.table.release(id, subscriber)
    }

    fn lifecycle(&self) -> &Lifecycle {
        self.table.lifecycle()
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("service", &self.config.service_name)
            .field("listen_addr", &self.listen_addr())
            .field("state", &self.table.lifecycle().state())
            .finish_non_exhaustive()
    }
}
