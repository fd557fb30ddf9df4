//! Call correlation - turns Call/Response frame pairs into awaitable results.
//!
//! Each issued call gets a fresh [`CallId`] and a pending entry holding a
//! oneshot sender. A Response removes the entry and settles it, so a second
//! Response with the same id (or one for an id nobody is waiting on) is
//! discarded without effect.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::bridge::CallId;
use crate::error::CallError;

pub type CallResult = Result<String, CallError>;

/// Table of in-flight calls. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct CallCorrelator {
    pending: Arc<DashMap<CallId, oneshot::Sender<CallResult>>>,
}

impl CallCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending call and return the future that settles it.
    pub fn issue(&self, timeout: Option<Duration>) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let id = loop {
            let id = CallId::new();
            match self.pending.entry(id) {
                Entry::Occupied(_) => {
                    tracing::warn!(%id, "Call id collision, drawing a new id");
                }
                Entry::Vacant(slot) => {
                    slot.insert(tx);
                    break id;
                }
            }
        };
        tracing::trace!(%id, "Call issued");

        PendingCall {
            id,
            rx,
            deadline: timeout.map(|after| (after, Box::pin(tokio::time::sleep(after)))),
            correlator: self.clone(),
            settled: false,
        }
    }

    /// Settle the call with textual id `id`.
    ///
    /// Returns false when nothing was waiting: unknown, malformed, duplicate
    /// and late ids are all discarded here.
    pub fn resolve(&self, id: &str, result: CallResult) -> bool {
        let Ok(call_id) = CallId::parse(id) else {
            tracing::debug!(id, "Discarding response with malformed call id");
            return false;
        };
        match self.pending.remove(&call_id) {
            Some((_, tx)) => {
                if tx.send(result).is_err() {
                    tracing::debug!(%call_id, "Caller went away before the response arrived");
                }
                true
            }
            None => {
                tracing::debug!(%call_id, "Discarding response for unknown call");
                false
            }
        }
    }

    /// Forget a pending call without settling it.
    pub fn abandon(&self, id: &CallId) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn is_pending(&self, id: &CallId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Future for an issued call.
///
/// Resolves with the worker's textual result. Dropping it (or hitting the
/// configured timeout) abandons the entry, so a late response is discarded.
/// Without a timeout, a call the worker never answers stays pending forever.
pub struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<CallResult>,
    deadline: Option<(Duration, Pin<Box<Sleep>>)>,
    correlator: CallCorrelator,
    settled: bool,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Await the result and parse it with [`FromStr`].
    pub async fn parse<T>(self) -> Result<T, CallError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let value = self.await?;
        value.parse().map_err(|e: T::Err| CallError::Decode {
            reason: e.to_string(),
            value,
        })
    }

    /// Await the result and deserialize it as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, CallError> {
        let value = self.await?;
        serde_json::from_str(&value).map_err(|e| CallError::Decode {
            reason: e.to_string(),
            value,
        })
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Poll::Ready(result) = Pin::new(&mut this.rx).poll(cx) {
            this.settled = true;
            // A dropped sender means the bridge itself was torn down.
            return Poll::Ready(result.unwrap_or(Err(CallError::Closed)));
        }
        if let Some((after, sleep)) = this.deadline.as_mut()
            && sleep.as_mut().poll(cx).is_ready()
        {
            this.settled = true;
            this.correlator.abandon(&this.id);
            tracing::debug!(id = %this.id, ?after, "Call timed out");
            return Poll::Ready(Err(CallError::TimedOut(*after)));
        }
        Poll::Pending
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.settled && self.correlator.abandon(&self.id) {
            tracing::trace!(id = %self.id, "Pending call dropped");
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("settled", &self.settled)
            .finish()
    }
}
