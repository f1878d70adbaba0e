//! Inbound listener.
//!
//! Accepts TCP connections, upgrades them to WebSocket, and completes the
//! handshake before handing them to the registry. Each handshake runs in its
//! own task so a slow or silent client never holds up the accept loop.

use crate::connection::{Direction, exchange_handshake};
use crate::registry::ConnectionRegistry;
use peer_core::{Lifecycle, PeerIdentifier};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tracing::{Instrument, debug, error, info, warn};

/// Accept connections until `lifecycle` stops.
///
/// Handshakes still in flight when the loop exits are aborted.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    registry: ConnectionRegistry,
    lifecycle: Lifecycle,
    handshake_timeout: Duration,
) {
    let mut handshakes = JoinSet::new();
    info!("Accepting connections");

    loop {
        let accepted = tokio::select! {
            biased;
            _ = lifecycle.stopped() => break,
            result = listener.accept() => result,
        };

        while handshakes.try_join_next().is_some() {}

        match accepted {
            Ok((stream, addr)) => {
                let registry = registry.clone();
                handshakes.spawn(
                    async move {
                        match tokio::time::timeout(
                            handshake_timeout,
                            accept_connection(stream, addr, &registry),
                        )
                        .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(reason)) => debug!("Rejected connection from {}: {}", addr, reason),
                            Err(_) => debug!("Handshake from {} timed out", addr),
                        }
                    }
                    .in_current_span(),
                );
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }

    debug!("Accept loop stopped");
}

/// Upgrade, read the client's handshake, answer with ours, and register the
/// connection under the address the client advertised.
async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: &ConnectionRegistry,
) -> Result<(), String> {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            // Port probes connect and close without upgrading.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                return Err("closed before upgrade".into());
            }
            warn!("WebSocket upgrade failed for {}: {}", addr, e);
            return Err(err_str);
        }
    };

    let ours = registry
        .local_handshake()
        .ok_or_else(|| "listener started before its address was recorded".to_string())?;
    let theirs = exchange_handshake(&mut ws, &ours, Direction::Inbound).await?;

    let peer: PeerIdentifier = theirs
        .address
        .parse()
        .map_err(|e| format!("bad advertised address {:?}: {}", theirs.address, e))?;
    debug!("Connection from {} identifies as {}", addr, peer);

    registry
        .register(peer, Direction::Inbound, ws)
        .map(|_| ())
        .ok_or_else(|| "transport is shutting down".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handlers;
    use crate::message::{Frame, Handshake};
    use futures::{SinkExt, StreamExt};
    use std::sync::Arc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tracing::Span;

    async fn start() -> (ConnectionRegistry, Lifecycle, SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = ConnectionRegistry::new("svc", Arc::new(Handlers::new()), Span::none());
        registry.set_local_address(addr.to_string());
        let lifecycle = Lifecycle::new();
        lifecycle.start().unwrap();
        let task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            lifecycle.clone(),
            Duration::from_millis(200),
        ));
        (registry, lifecycle, addr, task)
    }

    fn handshake_frame(service: &str, address: &str) -> Message {
        let frame = Frame::Handshake(Handshake {
            service: service.into(),
            address: address.into(),
        });
        Message::Binary(frame.to_binary().unwrap().into())
    }

    #[tokio::test]
    async fn test_inbound_registered_under_advertised_address() {
        let (registry, lifecycle, addr, task) = start().await;

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws.send(handshake_frame("svc", "127.0.0.1:7777")).await.unwrap();

        let reply = match ws.next().await.unwrap().unwrap() {
            Message::Binary(data) => Frame::from_binary(&data).unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            reply,
            Frame::Handshake(Handshake {
                service: "svc".into(),
                address: addr.to_string(),
            })
        );

        let advertised = PeerIdentifier::new("127.0.0.1:7777");
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.connections(&advertised).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("inbound connection should be registered");
        assert_eq!(registry.connections(&advertised)[0].direction(), Direction::Inbound);

        lifecycle.stop();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_is_never_registered() {
        let (registry, lifecycle, addr, task) = start().await;

        // Upgrades but never sends a handshake.
        let (_ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        // A bare TCP connection that never upgrades.
        let _tcp = TcpStream::connect(addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.is_empty());

        lifecycle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("accept loop should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_service_is_rejected() {
        let (registry, lifecycle, addr, task) = start().await;

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws.send(handshake_frame("other", "127.0.0.1:7778")).await.unwrap();

        // The server closes right away instead of leaving the dialer waiting.
        let reply = tokio::time::timeout(Duration::from_millis(100), ws.next())
            .await
            .expect("server should close the rejected connection");
        assert!(
            matches!(reply, Some(Ok(Message::Close(_)) | Err(_)) | None),
            "{reply:?}"
        );
        assert!(registry.is_empty());

        lifecycle.stop();
        task.await.unwrap();
    }
}
