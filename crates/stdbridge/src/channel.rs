//! Channel publish/subscribe routing for inbound channel frames.
//!
//! Listeners are long-lived callbacks; receivers are one-shot waits for the
//! next message. Neither sees messages that arrived before it was added.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::BridgeError;

/// Callback invoked with the raw text payload of each message on a channel.
pub type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Lock a router table, recovering from poison.
///
/// Listeners run outside the locks, so poison only follows a panic inside the
/// router itself; the tables stay structurally valid either way.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Channel router mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

pub struct ChannelRouter {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    /// `None` once the router is closed.
    receivers: Mutex<Option<HashMap<String, Vec<oneshot::Sender<String>>>>>,
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            receivers: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Add a listener for `channel`. Listeners run in subscription order.
    pub fn subscribe<F>(&self, channel: &str, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.listeners)
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(listener));
        tracing::debug!(channel, "Channel listener added");
    }

    /// Register a one-shot wait for the next message on `channel`.
    ///
    /// The receiver resolves with an error if the router closes first.
    pub fn next_message(&self, channel: &str) -> Result<oneshot::Receiver<String>, BridgeError> {
        let mut receivers = lock(&self.receivers);
        let table = receivers.as_mut().ok_or(BridgeError::Closed)?;
        let (tx, rx) = oneshot::channel();
        let waiting = table.entry(channel.to_string()).or_default();
        // Receivers dropped before a message arrived leave closed senders behind.
        waiting.retain(|tx| !tx.is_closed());
        waiting.push(tx);
        Ok(rx)
    }

    /// Deliver a message to every current listener and pending receiver.
    ///
    /// Returns how many deliveries were made.
    pub fn dispatch(&self, channel: &str, payload: &str) -> usize {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .get(channel)
            .cloned()
            .unwrap_or_default();
        let waiting = lock(&self.receivers)
            .as_mut()
            .and_then(|table| table.remove(channel))
            .unwrap_or_default();

        let mut delivered = 0;
        for listener in &listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(payload)));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => tracing::error!(channel, "Channel listener panicked"),
            }
        }
        for tx in waiting {
            if tx.send(payload.to_string()).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            tracing::trace!(channel, "No subscribers for channel message");
        }
        delivered
    }

    /// Drop all pending receivers; later `next_message` calls fail.
    pub fn close(&self) {
        lock(&self.receivers).take();
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        lock(&self.listeners).get(channel).map_or(0, Vec::len)
    }
}
