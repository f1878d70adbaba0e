//! Wake-up primitives shared between peers, maintainers, and transports.
//!
//! - `ChangeSignal`: single-slot, coalescing "something changed" wake-up
//! - `Lifecycle`: one-way Idle → Running → Stopped broadcast

use crate::error::PeerError;
use std::sync::Arc;
use tokio::sync::{Notify, watch};

/// Capacity-1 wake-up.
///
/// Raising the signal while a previous wake-up is still unconsumed collapses
/// into a single pending wake-up. Waiters learn only that something changed
/// and must re-read whatever state they care about.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    notify: Notify,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change. Never blocks.
    pub fn raise(&self) {
        self.notify.notify_one();
    }

    /// Wait for the next (or already pending) change.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// State of a transport's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Stopped,
}

/// Start/stop gate observed by every task a transport spawns.
///
/// Reads never block; `stopped()` resolves for every waiter once `stop()`
/// has been called, including waiters that subscribe afterwards.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(LifecycleState::Idle);
        Self { tx: Arc::new(tx) }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// Move to `Running`.
    ///
    /// Returns `Ok(true)` on the transition, `Ok(false)` if already running,
    /// and `Err(Stopped)` once stopped (a stopped lifecycle never restarts).
    pub fn start(&self) -> Result<bool, PeerError> {
        let mut result = Ok(false);
        self.tx.send_if_modified(|state| match *state {
            LifecycleState::Idle => {
                *state = LifecycleState::Running;
                result = Ok(true);
                true
            }
            LifecycleState::Running => false,
            LifecycleState::Stopped => {
                result = Err(PeerError::Stopped);
                false
            }
        });
        result
    }

    /// Move to `Stopped`. Returns true only for the call that made the transition.
    pub fn stop(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == LifecycleState::Stopped {
                false
            } else {
                *state = LifecycleState::Stopped;
                true
            }
        })
    }

    /// `Ok(())` while running, otherwise the matching lifecycle error.
    pub fn check_running(&self) -> Result<(), PeerError> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Idle => Err(PeerError::NotRunning),
            LifecycleState::Stopped => Err(PeerError::Stopped),
        }
    }

    /// Resolves once the lifecycle has been stopped.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so an error cannot be observed here.
        let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }
}
