//! Host-side directory of functions the worker has registered.
//!
//! Filled as Registration frames arrive. The set lives in a watch channel so
//! callers can wait for a name to appear instead of sleeping.

use std::collections::BTreeSet;

use tokio::sync::watch;

use crate::error::BridgeError;

#[derive(Debug, Default)]
struct Snapshot {
    names: BTreeSet<String>,
    closed: bool,
}

#[derive(Debug)]
pub struct ProxyDirectory {
    state: watch::Sender<Snapshot>,
}

impl Default for ProxyDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyDirectory {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Snapshot::default());
        Self { state }
    }

    /// Record a registration. Returns false when it replaced an existing name.
    pub fn insert(&self, name: &str) -> bool {
        let mut added = false;
        self.state.send_modify(|snapshot| {
            added = snapshot.names.insert(name.to_string());
        });
        if added {
            tracing::debug!(name, "Function registered by worker");
        } else {
            tracing::debug!(name, "Function re-registered by worker");
        }
        added
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.borrow().names.contains(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.state.borrow().names.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop waiting: no further registrations can arrive.
    pub fn close(&self) {
        self.state.send_modify(|snapshot| snapshot.closed = true);
    }

    /// Wait until `name` is registered.
    ///
    /// Fails with [`BridgeError::Closed`] if the stream ends first.
    pub async fn wait_for(&self, name: &str) -> Result<(), BridgeError> {
        let mut rx = self.state.subscribe();
        let snapshot = rx
            .wait_for(|snapshot| snapshot.closed || snapshot.names.contains(name))
            .await
            .map_err(|_| BridgeError::Closed)?;
        if snapshot.names.contains(name) {
            Ok(())
        } else {
            Err(BridgeError::Closed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn insert_reports_replacement() {
        let directory = ProxyDirectory::new();
        assert!(directory.insert("add"));
        assert!(!directory.insert("add"));
        assert_eq!(directory.len(), 1);
        assert!(directory.contains("add"));
        assert!(!directory.contains("sub"));
    }

    #[test]
    fn names_are_sorted() {
        let directory = ProxyDirectory::new();
        directory.insert("find_longer");
        directory.insert("add");
        assert_eq!(directory.names(), vec!["add", "find_longer"]);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_registration() {
        let directory = Arc::new(ProxyDirectory::new());
        let waiter = {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move { directory.wait_for("add").await })
        };
        tokio::task::yield_now().await;
        directory.insert("other");
        directory.insert("add");

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn wait_for_known_name_is_immediate() {
        let directory = ProxyDirectory::new();
        directory.insert("add");
        assert_eq!(directory.wait_for("add").await, Ok(()));
    }

    #[tokio::test]
    async fn wait_for_fails_when_closed() {
        let directory = ProxyDirectory::new();
        directory.close();
        assert_eq!(directory.wait_for("add").await, Err(BridgeError::Closed));
    }
}
