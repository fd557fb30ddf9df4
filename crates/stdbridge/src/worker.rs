//! Worker side of the bridge.
//!
//! Reads Call and channel frames from the host (normally the process's stdin),
//! dispatches calls to registered handlers and writes Responses back through
//! the bridge's single writer task (normally stdout).
//!
//! Sync handlers run inline on the read loop. Async handlers get a task per
//! call, so their responses may go out in any order.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;

use crate::bridge::{Frame, FrameCodec, FrameSender, Role, protocol, spawn_writer};
use crate::channel::ChannelRouter;
use crate::config::WorkerConfig;
use crate::error::BridgeError;
use crate::registry::{Handler, HandlerKind, HandlerRegistry, HandlerResult};
use crate::shutdown::{BridgeState, ShutdownCoordinator};

/// Worker end of a bridge. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct WorkerBridge {
    shared: Arc<WorkerShared>,
}

struct WorkerShared {
    sender: FrameSender,
    registry: HandlerRegistry,
    channels: ChannelRouter,
    shutdown: ShutdownCoordinator,
    config: WorkerConfig,
}

impl WorkerBridge {
    /// Bridge over this process's stdin/stdout.
    ///
    /// Nothing else may write to stdout while the bridge is open. Stdout stays
    /// open after the bridge closes; the host sees the stream end when this
    /// process exits.
    pub fn stdio() -> Self {
        Self::stdio_with_config(WorkerConfig::default())
    }

    pub fn stdio_with_config(config: WorkerConfig) -> Self {
        Self::with_config(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(reader, writer, WorkerConfig::default())
    }

    /// Start the read loop and writer task. Must be called inside a tokio runtime.
    pub fn with_config<R, W>(reader: R, writer: W, config: WorkerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = || FrameCodec::new(Role::Worker).with_max_frame_len(config.max_frame_len);
        let (sender, _writer) = spawn_writer(writer, codec());
        let frames = FramedRead::new(reader, codec());
        let shared = Arc::new(WorkerShared {
            sender,
            registry: HandlerRegistry::new(),
            channels: ChannelRouter::new(),
            shutdown: ShutdownCoordinator::new(),
            config,
        });

        tracing::debug!(error_frames = shared.config.error_frames, "Worker bridge starting");
        tokio::spawn(read_loop(Arc::clone(&shared), frames));
        Self { shared }
    }

    /// Register a synchronous function and announce it to the host.
    ///
    /// Every argument is parsed as `A` before `function` runs. Registering a
    /// name again replaces the earlier handler.
    pub fn register<A, T, C, F>(
        &self,
        name: &str,
        function: F,
        context: Option<C>,
    ) -> Result<(), BridgeError>
    where
        A: FromStr,
        A::Err: std::fmt::Display,
        T: ToString,
        C: Clone + Send + Sync + 'static,
        F: Fn(Vec<A>, Option<C>) -> T + Send + Sync + 'static,
    {
        self.install(name, Handler::from_sync(function, context))
    }

    /// Register an async function. Each call runs as its own task.
    pub fn register_async<T, C, F, Fut>(
        &self,
        name: &str,
        function: F,
        context: Option<C>,
    ) -> Result<(), BridgeError>
    where
        T: ToString,
        C: Clone + Send + Sync + 'static,
        F: Fn(Vec<String>, Option<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.install(name, Handler::from_async(function, context))
    }

    fn install(&self, name: &str, handler: Handler) -> Result<(), BridgeError> {
        let frame = Frame::Registration {
            name: name.to_string(),
        };
        frame.validate()?;
        self.shared.registry.insert(name, handler);
        self.shared.sender.send(frame)
    }

    /// Names of the functions registered on this side.
    pub fn functions(&self) -> Vec<String> {
        self.shared.registry.names()
    }

    /// Publish `data` on `channel`. Fails once shutdown has begun.
    pub fn send(&self, channel: &str, data: impl ToString) -> Result<(), BridgeError> {
        if !self.shared.shutdown.is_open() {
            return Err(BridgeError::Closed);
        }
        self.shared.sender.send(Frame::ChannelMessage {
            channel: channel.to_string(),
            payload: data.to_string(),
        })
    }

    pub fn send_json<T>(&self, channel: &str, value: &T) -> Result<(), BridgeError>
    where
        T: Serialize + ?Sized,
    {
        let payload =
            serde_json::to_string(value).map_err(|e| BridgeError::Serialize(e.to_string()))?;
        self.send(channel, payload)
    }

    /// Wait for the next message on `channel`.
    ///
    /// The wait is registered when this is called, not when the future is
    /// first polled, so a message arriving in between is not missed.
    pub fn receive(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<String, BridgeError>> + Send + use<> {
        let rx = self.shared.channels.next_message(channel);
        async move { rx?.await.map_err(|_| BridgeError::Closed) }
    }

    /// Call `listener` with every message published on `channel` from now on.
    pub fn on<F>(&self, channel: &str, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.channels.subscribe(channel, listener);
    }

    /// Ask the host to shut down and wait until the bridge is closed.
    pub async fn close(&self) {
        if self.shared.shutdown.request_shutdown() {
            tracing::info!("Worker requesting shutdown");
            let sent = self.shared.sender.send(Frame::ShutdownRequest);
            if sent.is_ok() && self.shared.sender.flush().await.is_ok() {
                tracing::trace!("Shutdown request written");
            }
        }
        self.shared.shutdown.closed().await;
    }

    /// Resolve once the bridge is closed, by either side.
    pub async fn wait_until_closed(&self) {
        self.shared.shutdown.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_closed()
    }

    pub fn state(&self) -> BridgeState {
        self.shared.shutdown.state()
    }
}

impl std::fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("state", &self.state())
            .field("functions", &self.shared.registry.len())
            .finish()
    }
}

async fn read_loop<R>(shared: Arc<WorkerShared>, mut frames: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from host");
                break;
            }
        };
        tracing::trace!(kind = frame.kind(), "Frame received");

        match frame {
            Frame::Call { name, id, args } => shared.dispatch_call(name, id, args),
            Frame::ChannelMessage { channel, payload } => {
                shared.channels.dispatch(&channel, &payload);
            }
            Frame::ShutdownRequest => {
                tracing::info!("Shutdown requested by host");
                shared.shutdown.request_shutdown();
                if let Err(e) = shared.sender.send(Frame::ShutdownAck) {
                    tracing::debug!(error = %e, "Could not acknowledge shutdown");
                }
                break;
            }
            Frame::ShutdownAck => {
                if shared.shutdown.is_open() {
                    tracing::debug!("Ignoring unsolicited shutdown ack");
                } else {
                    tracing::debug!("Host acknowledged shutdown");
                    break;
                }
            }
            other => {
                tracing::debug!(kind = other.kind(), "Ignoring frame not addressed to a worker");
            }
        }
    }

    // Closing our output is what tells the host we are done.
    shared.sender.close().await;
    shared.channels.close();
    shared.shutdown.mark_closed();
    tracing::info!("Worker bridge closed");
}

impl WorkerShared {
    fn dispatch_call(self: &Arc<Self>, name: String, id: String, args: Vec<String>) {
        // No reply could carry this id back, so the handler never runs.
        if let Err(e) = protocol::validate_id(&id) {
            tracing::warn!(%name, error = %e, "Skipping call with unanswerable id");
            return;
        }

        let Some(handler) = self.registry.get(&name) else {
            tracing::debug!(%name, %id, "Call for unregistered function");
            if self.config.error_frames {
                self.send_error(id, format!("no function named `{name}` is registered"));
            }
            return;
        };

        tracing::trace!(%name, %id, args = args.len(), "Dispatching call");
        match handler.kind() {
            HandlerKind::Sync => {
                if let Some(result) = handler.call_sync(args) {
                    self.reply(&name, id, result);
                }
            }
            HandlerKind::Async => {
                let shared = Arc::clone(self);
                let fut = handler.invoke(args);
                tokio::spawn(async move {
                    let result = fut.await;
                    shared.reply(&name, id, result);
                });
            }
        }
    }

    fn reply(&self, name: &str, id: String, result: HandlerResult) {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(name, %id, error = %e, "Handler failed");
                if self.config.error_frames {
                    self.send_error(id, e.to_string());
                }
                return;
            }
        };

        match self.sender.send(Frame::Response {
            id: id.clone(),
            value,
        }) {
            Ok(()) => {}
            Err(BridgeError::InvalidFrame(e)) => {
                tracing::warn!(name, %id, error = %e, "Handler result cannot be sent");
                if self.config.error_frames {
                    self.send_error(id, e.to_string());
                }
            }
            Err(e) => tracing::debug!(name, %id, error = %e, "Response dropped"),
        }
    }

    fn send_error(&self, id: String, message: String) {
        if let Err(e) = self.sender.send(Frame::Error { id, message }) {
            tracing::debug!(error = %e, "Error frame dropped");
        }
    }
}
