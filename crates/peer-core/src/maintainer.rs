//! Connection maintainer: the per-peer task that keeps a peer's status in
//! step with its actual connectivity.
//!
//! Status is derived from live connections rather than from dial results
//! alone, so a connection the remote side opened to us counts as well.
//!
//! ```text
//!            count > 0                        change
//!   ┌──────────────────────────► Available ◄─────────┐
//!   │                                │               │
//! check ─ count == 0 ─► Connecting ──┼── dial ok ────┘
//!   ▲                                │
//!   └──── sleep(backoff) ◄── Unavailable ◄── dial failed / timed out
//! ```
//!
//! Every wait also listens for the peer being released and for the
//! transport stopping; either ends the task.

use crate::backoff::{Backoff, RetryPolicy};
use crate::peer::Peer;
use crate::signal::Lifecycle;
use crate::status::ConnectionStatus;
use crate::transport::Connector;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Why a wait inside the maintainer ended.
enum Wake {
    /// Connectivity may have changed (or the sleep elapsed); re-check.
    Recheck,
    /// Released or stopped; exit.
    Exit,
}

/// Run the maintainer loop for `peer` until it is released or `lifecycle` stops.
pub async fn maintain<C: Connector>(
    peer: Arc<Peer>,
    connector: Arc<C>,
    policy: RetryPolicy,
    lifecycle: Lifecycle,
) {
    let id = peer.identifier().clone();
    let mut backoff = Backoff::new(&policy);
    debug!("Maintaining connection to {}", id);

    loop {
        if connector.connection_count(&id) > 0 {
            peer.set_status(ConnectionStatus::Available);
            match wait_for_change(&peer, &lifecycle).await {
                Wake::Recheck => continue,
                Wake::Exit => break,
            }
        }

        peer.set_status(ConnectionStatus::Connecting);

        let attempt = tokio::select! {
            biased;
            _ = peer.released() => None,
            _ = lifecycle.stopped() => None,
            result = tokio::time::timeout(policy.connection_timeout, connector.connect(&id)) => Some(result),
        };

        let wake = match attempt {
            None => Wake::Exit,
            Some(Ok(Ok(()))) => {
                peer.set_status(ConnectionStatus::Available);
                backoff.reset();
                wait_for_change(&peer, &lifecycle).await
            }
            Some(Ok(Err(e))) => {
                debug!("Connection to {} failed: {}", id, e);
                let delay = backoff.fail();
                peer.set_status(ConnectionStatus::Unavailable);
                sleep(delay, &peer, &lifecycle).await
            }
            Some(Err(_)) => {
                debug!(
                    "Connection to {} timed out after {:?}",
                    id, policy.connection_timeout
                );
                let delay = backoff.fail();
                peer.set_status(ConnectionStatus::Unavailable);
                sleep(delay, &peer, &lifecycle).await
            }
        };

        if let Wake::Exit = wake {
            break;
        }
    }

    // Leave nothing in rotation once the maintainer is gone.
    peer.set_status(ConnectionStatus::Unavailable);
    debug!("Stopped maintaining connection to {}", id);
}

async fn wait_for_change(peer: &Peer, lifecycle: &Lifecycle) -> Wake {
    tokio::select! {
        biased;
        _ = peer.released() => Wake::Exit,
        _ = lifecycle.stopped() => Wake::Exit,
        _ = peer.change_signal().changed() => Wake::Recheck,
    }
}

async fn sleep(delay: Duration, peer: &Peer, lifecycle: &Lifecycle) -> Wake {
    trace!("Retrying {} in {:?}", peer.identifier(), delay);
    tokio::select! {
        biased;
        _ = peer.released() => Wake::Exit,
        _ = lifecycle.stopped() => Wake::Exit,
        _ = tokio::time::sleep(delay) => Wake::Recheck,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::PeerIdentifier;
    use crate::testing::FakeConnector;
    use tokio::task::JoinHandle;
    use tokio::time::{Instant, sleep as tsleep, timeout};

    fn policy(timeout_ms: u64, initial_ms: u64, factor: f64) -> RetryPolicy {
        RetryPolicy {
            connection_timeout: Duration::from_millis(timeout_ms),
            initial_delay: Duration::from_millis(initial_ms),
            backoff_factor: factor,
        }
    }

    fn spawn(
        id: &str,
        connector: &Arc<FakeConnector>,
        policy: RetryPolicy,
    ) -> (Arc<Peer>, Lifecycle, JoinHandle<()>) {
        let peer = Arc::new(Peer::new(PeerIdentifier::new(id)));
        connector.watch(peer.identifier(), Arc::clone(peer.change_signal()));
        let lifecycle = Lifecycle::new();
        lifecycle.start().unwrap();
        let handle = tokio::spawn(maintain(
            Arc::clone(&peer),
            Arc::clone(connector),
            policy,
            lifecycle.clone(),
        ));
        (peer, lifecycle, handle)
    }

    fn gaps(attempts: &[Instant]) -> Vec<Duration> {
        attempts.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_by_factor() {
        let connector = FakeConnector::new();
        let (peer, lifecycle, handle) = spawn("down:1", &connector, policy(50, 10, 2.0));

        tsleep(Duration::from_millis(200)).await;

        // Attempts at 0, 20, 60, 140 ms.
        let attempts = connector.attempts(peer.identifier());
        assert_eq!(attempts.len(), 4);
        assert_eq!(
            gaps(&attempts),
            vec![
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(80)
            ]
        );
        assert_eq!(peer.status(), ConnectionStatus::Unavailable);

        lifecycle.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_initial_delay_does_not_spin() {
        let connector = FakeConnector::new();
        let (peer, lifecycle, handle) = spawn("down:1", &connector, policy(50, 0, 2.0));

        tsleep(Duration::from_millis(100)).await;

        // Starts from the 1ms floor: attempts at 0, 2, 6, 14, 30, 62 ms.
        let attempts = connector.attempts(peer.identifier());
        assert_eq!(
            gaps(&attempts),
            [2, 4, 8, 16, 32].map(Duration::from_millis).to_vec()
        );

        lifecycle.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_success() {
        let connector = FakeConnector::new();
        let id = PeerIdentifier::new("flaky:1");
        connector.set_reachable(&id, true);
        connector.fail_next(&id, 2);
        let (peer, lifecycle, handle) = spawn("flaky:1", &connector, policy(50, 10, 2.0));

        // Fail at 0 and 20, succeed at 60.
        tsleep(Duration::from_millis(100)).await;
        assert_eq!(peer.status(), ConnectionStatus::Available);
        assert_eq!(connector.attempts(&id).len(), 3);

        connector.set_reachable(&id, false);
        connector.drop_connections(&id);
        tsleep(Duration::from_millis(25)).await;

        let attempts = connector.attempts(&id);
        assert_eq!(attempts.len(), 5);
        // First failure after the success waits initial * factor again.
        assert_eq!(attempts[4] - attempts[3], Duration::from_millis(20));

        lifecycle.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_connection_needs_no_dial() {
        let connector = FakeConnector::new();
        let id = PeerIdentifier::new("inbound:1");
        connector.add_inbound(&id);
        let (peer, lifecycle, handle) = spawn("inbound:1", &connector, policy(50, 10, 2.0));

        tsleep(Duration::from_millis(10)).await;
        assert_eq!(peer.status(), ConnectionStatus::Available);
        assert!(connector.attempts(&id).is_empty());

        // Losing the connection triggers a dial.
        connector.drop_connections(&id);
        tsleep(Duration::from_millis(1)).await;
        assert_eq!(connector.attempts(&id).len(), 1);

        lifecycle.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout_marks_unavailable() {
        let connector = FakeConnector::new();
        let id = PeerIdentifier::new("blackhole:1");
        connector.set_hanging(&id);
        let (peer, lifecycle, handle) = spawn("blackhole:1", &connector, policy(50, 10, 1.0));

        tsleep(Duration::from_millis(25)).await;
        assert_eq!(peer.status(), ConnectionStatus::Connecting);

        tsleep(Duration::from_millis(30)).await;
        assert_eq!(peer.status(), ConnectionStatus::Unavailable);

        lifecycle.stop();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_hanging_dial() {
        let connector = FakeConnector::new();
        let id = PeerIdentifier::new("blackhole:2");
        connector.set_hanging(&id);
        let (peer, lifecycle, handle) = spawn("blackhole:2", &connector, policy(10_000, 10, 2.0));

        tsleep(Duration::from_millis(5)).await;
        let started = Instant::now();
        lifecycle.stop();
        timeout(Duration::from_millis(100), handle)
            .await
            .expect("maintainer must exit promptly")
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(peer.status(), ConnectionStatus::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_interrupts_backoff_sleep() {
        let connector = FakeConnector::new();
        let (peer, _lifecycle, handle) = spawn("down:2", &connector, policy(50, 60_000, 2.0));

        tsleep(Duration::from_millis(5)).await;
        peer.mark_released();
        timeout(Duration::from_millis(100), handle)
            .await
            .expect("maintainer must exit on release")
            .unwrap();
        assert_eq!(connector.attempts(peer.identifier()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_interrupts_steady_state() {
        let connector = FakeConnector::new();
        let id = PeerIdentifier::new("up:1");
        connector.set_reachable(&id, true);
        let (peer, _lifecycle, handle) = spawn("up:1", &connector, policy(50, 10, 2.0));

        tsleep(Duration::from_millis(5)).await;
        assert_eq!(peer.status(), ConnectionStatus::Available);

        peer.mark_released();
        timeout(Duration::from_millis(100), handle)
            .await
            .expect("maintainer must exit on release")
            .unwrap();
        assert_eq!(peer.status(), ConnectionStatus::Unavailable);
    }
}
