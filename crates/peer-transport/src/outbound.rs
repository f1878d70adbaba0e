//! Outbound calls routed through a peer list.

use crate::connection::RequestError;
use crate::error::CallError;
use crate::transport::WsTransport;
use peer_core::{Peer, PeerList};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Sends requests to whichever peer the list chooses.
pub struct Outbound<L: PeerList> {
    transport: Arc<WsTransport>,
    list: L,
}

impl<L: PeerList> Outbound<L> {
    pub fn new(transport: Arc<WsTransport>, list: L) -> Self {
        Self { transport, list }
    }

    pub fn list(&self) -> &L {
        &self.list
    }

    pub fn into_list(self) -> L {
        self.list
    }

    /// Call `procedure` on the next available peer.
    ///
    /// `timeout` bounds the whole call: waiting for a peer plus waiting for
    /// its response. Connectivity failures are reported back to the list so
    /// the peer's maintainer re-checks it before it is chosen again.
    pub async fn call(
        &self,
        procedure: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let deadline = Instant::now() + timeout;
        let (peer, finish) = self.list.choose(timeout).await?;
        trace!("Calling {} on {}", procedure, peer.identifier());

        let result = self.call_peer(&peer, procedure, body, deadline, timeout).await;
        match &result {
            Err(e) if e.is_connectivity() => {
                debug!("Call to {} failed: {}", peer.identifier(), e);
                finish.finish(Some(e));
            }
            _ => finish.finish(None),
        }
        result
    }

    async fn call_peer(
        &self,
        peer: &Peer,
        procedure: &str,
        body: Value,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let id = peer.identifier();
        let conn = self
            .transport
            .registry()
            .connections(id)
            .into_iter()
            .find(|c| !c.is_closed())
            .ok_or_else(|| CallError::NoConnection(id.clone()))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CallError::Timeout {
                peer: id.clone(),
                timeout,
            });
        }

        match conn.request(procedure, body, remaining).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(message)) => Err(CallError::Remote {
                peer: id.clone(),
                message,
            }),
            Err(RequestError::Send(reason)) => Err(CallError::Send {
                peer: id.clone(),
                reason,
            }),
            Err(RequestError::Timeout) => Err(CallError::Timeout {
                peer: id.clone(),
                timeout,
            }),
            Err(RequestError::Closed) => Err(CallError::Closed(id.clone())),
        }
    }
}

impl<L: PeerList + std::fmt::Debug> std::fmt::Debug for Outbound<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("transport", &self.transport)
            .field("list", &self.list)
            .finish()
    }
}
