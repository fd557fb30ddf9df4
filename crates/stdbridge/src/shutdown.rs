//! Bridge lifecycle: `Open → ShutdownRequested → Closed`.
//!
//! Transitions only move forward. Waiters park on a watch channel rather than
//! polling.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BridgeState {
    Open,
    /// A ShutdownRequest was sent or received; the stream is still live.
    ShutdownRequested,
    /// The inbound stream has terminated.
    Closed,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ShutdownRequested => "shutdown_requested",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: watch::Sender<BridgeState>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(BridgeState::Open);
        Self { state }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == BridgeState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BridgeState::Closed
    }

    /// Move to `ShutdownRequested`. Returns false if shutdown was already underway.
    pub fn request_shutdown(&self) -> bool {
        self.advance(BridgeState::ShutdownRequested)
    }

    /// Move to `Closed`. Returns false if already closed.
    pub fn mark_closed(&self) -> bool {
        self.advance(BridgeState::Closed)
    }

    fn advance(&self, next: BridgeState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(state = next.as_str(), "Bridge state changed");
        }
        moved
    }

    /// Wait until the bridge reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only returns once closed.
        let _ = rx.wait_for(|state| *state == BridgeState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn starts_open() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state(), BridgeState::Open);
        assert!(coordinator.is_open());
        assert!(!coordinator.is_closed());
    }

    #[test]
    fn transitions_only_move_forward() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.request_shutdown());
        assert!(!coordinator.request_shutdown());
        assert_eq!(coordinator.state(), BridgeState::ShutdownRequested);

        assert!(coordinator.mark_closed());
        assert!(!coordinator.request_shutdown());
        assert!(!coordinator.mark_closed());
        assert_eq!(coordinator.state(), BridgeState::Closed);
    }

    #[test]
    fn close_without_request_is_allowed() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.mark_closed());
        assert!(coordinator.is_closed());
    }

    #[tokio::test]
    async fn closed_returns_immediately_when_already_closed() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.mark_closed();
        tokio::time::timeout(Duration::from_millis(100), coordinator.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_waits_for_transition() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.closed().await })
        };

        coordinator.request_shutdown();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        coordinator.mark_closed();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
