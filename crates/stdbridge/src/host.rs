//! Host side of the bridge.
//!
//! The host owns the worker process (or any stream pair standing in for one).
//! Registration frames fill the function directory; calls go out as Call
//! frames and come back through the correlator; channel frames are routed to
//! local listeners.

use std::future::Future;
use std::process::Stdio;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_util::codec::FramedRead;

use crate::bridge::{Frame, FrameCodec, FrameSender, Role, spawn_writer};
use crate::channel::ChannelRouter;
use crate::config::HostConfig;
use crate::correlator::{CallCorrelator, PendingCall};
use crate::directory::ProxyDirectory;
use crate::error::{BridgeError, CallError};
use crate::shutdown::{BridgeState, ShutdownCoordinator};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker {0} is not piped")]
    MissingPipe(&'static str),
}

/// Host end of a bridge. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct HostBridge {
    shared: Arc<HostShared>,
}

struct HostShared {
    sender: FrameSender,
    correlator: CallCorrelator,
    directory: ProxyDirectory,
    channels: ChannelRouter,
    shutdown: ShutdownCoordinator,
    config: HostConfig,
}

/// Callable handle for one function the worker registered.
#[derive(Clone)]
pub struct Proxy {
    name: String,
    host: HostBridge,
}

impl Proxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function. See [`HostBridge::call`].
    pub fn call<I, S>(&self, args: I) -> Result<PendingCall, CallError>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.host.issue(&self.name, args)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").field("name", &self.name).finish()
    }
}

impl HostBridge {
    /// Spawn `command` as a worker with piped stdin/stdout.
    ///
    /// The worker's stderr is inherited so its logs stay visible. The caller
    /// owns the returned [`Child`] and decides when to wait on or kill it.
    pub fn spawn(mut command: Command, config: HostConfig) -> Result<(Self, Child), SpawnError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        tracing::info!(pid = ?child.id(), "Worker process spawned");

        Ok((Self::with_config(stdout, stdin, config), child))
    }

    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(reader, writer, HostConfig::default())
    }

    /// Bridge reading the worker's output from `reader` and writing its input
    /// to `writer`. Must be called inside a tokio runtime.
    pub fn with_config<R, W>(reader: R, writer: W, config: HostConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = || FrameCodec::new(Role::Host).with_max_frame_len(config.max_frame_len);
        let (sender, _writer) = spawn_writer(writer, codec());
        let frames = FramedRead::new(reader, codec());
        let shared = Arc::new(HostShared {
            sender,
            correlator: CallCorrelator::new(),
            directory: ProxyDirectory::new(),
            channels: ChannelRouter::new(),
            shutdown: ShutdownCoordinator::new(),
            config,
        });

        tracing::debug!(call_timeout = ?shared.config.call_timeout, "Host bridge starting");
        tokio::spawn(read_loop(Arc::downgrade(&shared), frames));
        Self { shared }
    }

    /// Proxy for `name`, if the worker has registered it.
    pub fn proxy(&self, name: &str) -> Option<Proxy> {
        self.shared.directory.contains(name).then(|| Proxy {
            name: name.to_string(),
            host: self.clone(),
        })
    }

    /// Wait until the worker registers `name`.
    ///
    /// Fails with [`BridgeError::Closed`] if the worker's output ends first.
    pub async fn wait_for_function(&self, name: &str) -> Result<Proxy, BridgeError> {
        self.shared.directory.wait_for(name).await?;
        Ok(Proxy {
            name: name.to_string(),
            host: self.clone(),
        })
    }

    /// Names the worker has registered so far.
    pub fn functions(&self) -> Vec<String> {
        self.shared.directory.names()
    }

    /// Call `name` with `args`.
    ///
    /// Fails fast with [`CallError::UnknownFunction`] if no Registration for
    /// `name` has arrived. Otherwise the Call frame is queued immediately and
    /// the returned future settles when the worker responds.
    pub fn call<I, S>(&self, name: &str, args: I) -> Result<PendingCall, CallError>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        if !self.shared.directory.contains(name) {
            return Err(CallError::UnknownFunction(name.to_string()));
        }
        self.issue(name, args)
    }

    fn issue<I, S>(&self, name: &str, args: I) -> Result<PendingCall, CallError>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        if !self.shared.shutdown.is_open() {
            return Err(CallError::Closed);
        }
        let args: Vec<String> = args.into_iter().map(|arg| arg.to_string()).collect();
        let call = self.shared.correlator.issue(self.shared.config.call_timeout);
        tracing::trace!(name, id = %call.id(), args = args.len(), "Issuing call");

        // On failure `call` is dropped here, which removes its pending entry.
        self.shared.sender.send(Frame::Call {
            name: name.to_string(),
            id: call.id().to_string(),
            args,
        })?;
        Ok(call)
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.correlator.pending_count()
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

    pub fn on<F>(&self, channel: &str, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.channels.subscribe(channel, listener);
    }

    /// Wait for the next message on `channel`, registered eagerly.
    pub fn receive(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<String, BridgeError>> + Send + use<> {
        let rx = self.shared.channels.next_message(channel);
        async move { rx?.await.map_err(|_| BridgeError::Closed) }
    }

    /// Ask the worker to shut down.
    ///
    /// Returns once the request is written; it does not wait for the worker
    /// to exit. Use [`HostBridge::closed`] for that.
    pub async fn close(&self) -> Result<(), BridgeError> {
        if !self.shared.shutdown.request_shutdown() {
            return Ok(());
        }
        tracing::info!("Requesting worker shutdown");
        self.shared.sender.send(Frame::ShutdownRequest)?;
        self.shared.sender.flush().await
    }

    /// Resolve once the worker's output stream has ended.
    pub async fn closed(&self) {
        self.shared.shutdown.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_closed()
    }

    pub fn state(&self) -> BridgeState {
        self.shared.shutdown.state()
    }
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("state", &self.state())
            .field("functions", &self.shared.directory.len())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// Reads worker frames until end of stream.
///
/// Holds only a weak handle: once every [`HostBridge`] is dropped the writer
/// goes with it, the worker sees end of input, and this loop ends on the
/// worker's EOF.
async fn read_loop<R>(shared: Weak<HostShared>, mut frames: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from worker");
                break;
            }
        };
        let Some(host) = shared.upgrade() else {
            tracing::debug!("Host bridge dropped, stopping reader");
            return;
        };
        host.handle_frame(frame);
    }

    match shared.upgrade() {
        Some(host) => host.finish().await,
        None => tracing::debug!("Worker output ended after host bridge was dropped"),
    }
}

impl HostShared {
    fn handle_frame(&self, frame: Frame) {
        tracing::trace!(kind = frame.kind(), "Frame received");
        match frame {
            Frame::Registration { name } => {
                self.directory.insert(&name);
            }
            Frame::Response { id, value } => {
                self.correlator.resolve(&id, Ok(value));
            }
            Frame::Error { id, message } => {
                tracing::debug!(%id, %message, "Worker reported call failure");
                self.correlator.resolve(&id, Err(CallError::Remote(message)));
            }
            Frame::ChannelMessage { channel, payload } => {
                self.channels.dispatch(&channel, &payload);
            }
            Frame::ShutdownRequest => {
                tracing::info!("Worker requested shutdown");
                self.shutdown.request_shutdown();
                if let Err(e) = self.sender.send(Frame::ShutdownAck) {
                    tracing::debug!(error = %e, "Could not acknowledge shutdown");
                }
            }
            Frame::ShutdownAck => tracing::debug!("Worker acknowledged shutdown"),
            other => {
                tracing::debug!(kind = other.kind(), "Ignoring frame not addressed to a host");
            }
        }
    }

    async fn finish(&self) {
        // Pending calls stay pending: only their own timeout or drop ends them.
        self.shutdown.mark_closed();
        self.directory.close();
        self.channels.close();
        self.sender.close().await;
        let pending = self.correlator.pending_count();
        if pending > 0 {
            tracing::warn!(pending, "Worker output closed with calls outstanding");
        }
        tracing::info!("Host bridge closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf};

    const WAIT: Duration = Duration::from_secs(5);

    /// Worker end driven frame by frame.
    struct FakeWorker {
        frames: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
        sender: FrameSender,
    }

    impl FakeWorker {
        async fn next(&mut self) -> Option<Frame> {
            tokio::time::timeout(WAIT, self.frames.next())
                .await
                .expect("timed out waiting for a frame")
                .map(|item| item.unwrap())
        }

        fn register(&self, name: &str) {
            self.sender
                .send(Frame::Registration {
                    name: name.to_string(),
                })
                .unwrap();
        }

        /// Read the next Call and return its id and arguments.
        async fn expect_call(&mut self, expected: &str) -> (String, Vec<String>) {
            match self.next().await {
                Some(Frame::Call { name, id, args }) => {
                    assert_eq!(name, expected);
                    (id, args)
                }
                other => panic!("expected a call, got {other:?}"),
            }
        }

        fn respond(&self, id: &str, value: &str) {
            self.sender
                .send(Frame::Response {
                    id: id.to_string(),
                    value: value.to_string(),
                })
                .unwrap();
        }
    }

    fn pair(config: HostConfig) -> (HostBridge, FakeWorker) {
        let (host_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let host = HostBridge::with_config(host_read, host_write, config);

        let (worker_read, worker_write) = tokio::io::split(worker_io);
        let (sender, _task) = spawn_writer(worker_write, FrameCodec::worker());
        let worker = FakeWorker {
            frames: FramedRead::new(worker_read, FrameCodec::worker()),
            sender,
        };
        (host, worker)
    }

    async fn registered(host: &HostBridge, name: &str) -> Proxy {
        tokio::time::timeout(WAIT, host.wait_for_function(name))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_function_fails_fast() {
        let (host, _worker) = pair(HostConfig::default());
        let err = host.call("add", ["1"]).unwrap_err();
        assert_eq!(err, CallError::UnknownFunction("add".to_string()));
        assert!(host.proxy("add").is_none());
    }

    #[tokio::test]
    async fn call_round_trip() {
        let (host, mut worker) = pair(HostConfig::default());
        worker.register("add");
        registered(&host, "add").await;

        let call = host.call("add", [10, 20]).unwrap();
        let (id, args) = worker.expect_call("add").await;
        assert_eq!(id, call.id().to_string());
        assert_eq!(args, vec!["10", "20"]);

        worker.respond(&id, "30");
        assert_eq!(call.await, Ok("30".to_string()));
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn proxy_calls_with_no_arguments() {
        let (host, mut worker) = pair(HostConfig::default());
        worker.register("ping");
        let proxy = registered(&host, "ping").await;
        assert_eq!(proxy.name(), "ping");

        let call = proxy.call(Vec::<String>::new()).unwrap();
        let (id, args) = worker.expect_call("ping").await;
        assert!(args.is_empty());
        worker.respond(&id, "pong");
        assert_eq!(call.await, Ok("pong".to_string()));
    }

    #[tokio::test]
    async fn responses_resolve_out_of_order() {
        let (host, mut worker) = pair(HostConfig::default());
        worker.register("f");
        let proxy = registered(&host, "f").await;

        let first = proxy.call(["a"]).unwrap();
        let second = proxy.call(["b"]).unwrap();
        let (first_id, _) = worker.expect_call("f").await;
        let (second_id, _) = worker.expect_call("f").await;

        worker.respond(&second_id, "B");
        worker.respond(&first_id, "A");
        assert_eq!(second.await, Ok("B".to_string()));
        assert_eq!(first.await, Ok("A".to_string()));
    }

    #[tokio::test]
    async fn duplicate_and_foreign_responses_are_ignored() {
        let (host, mut worker) = pair(HostConfig::default());
        worker.register("f");
        let proxy = registered(&host, "f").await;

        let call = proxy.call(["x"]).unwrap();
        let (id, _) = worker.expect_call("f").await;
        worker.respond(&crate::bridge::CallId::new().to_string(), "stranger");
        worker.respond(&id, "mine");
        worker.respond(&id, "again");

        assert_eq!(call.await, Ok("mine".to_string()));
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn error_frame_resolves_as_remote_error() {
        let (host, mut worker) = pair(HostConfig::default());
        worker.register("f");
        let proxy = registered(&host, "f").await;

        let call = proxy.call(["x"]).unwrap();
        let (id, _) = worker.expect_call("f").await;
        worker
            .sender
            .send(Frame::Error {
                id,
                message: "bad input".to_string(),
            })
            .unwrap();
        assert_eq!(call.await, Err(CallError::Remote("bad input".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn configured_timeout_applies() {
        let (host, mut worker) =
            pair(HostConfig::default().with_call_timeout(Duration::from_millis(250)));
        worker.register("slow");
        let proxy = registered(&host, "slow").await;

        let call = proxy.call(["x"]).unwrap();
        let (id, _) = worker.expect_call("slow").await;
        assert_eq!(call.await, Err(CallError::TimedOut(Duration::from_millis(250))));

        // The late response finds nothing waiting.
        worker.respond(&id, "late");
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn channels_route_by_name() {
        let (host, mut worker) = pair(HostConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            host.on("channel_echo", move |payload| {
                seen.lock().unwrap().push(payload.to_string())
            });
        }
        let next = host.receive("channel_echo");

        worker
            .sender
            .send(Frame::ChannelMessage {
                channel: "channel_echo".to_string(),
                payload: "hi".to_string(),
            })
            .unwrap();
        assert_eq!(tokio::time::timeout(WAIT, next).await.unwrap(), Ok("hi".to_string()));
        assert_eq!(*seen.lock().unwrap(), vec!["hi"]);

        host.send_json("channel_a", &serde_json::json!({"n": 1})).unwrap();
        assert_eq!(
            worker.next().await,
            Some(Frame::ChannelMessage {
                channel: "channel_a".to_string(),
                payload: r#"{"n":1}"#.to_string(),
            })
        );
    }

    #[tokio::test]
    async fn close_completes_after_worker_exits() {
        let (host, mut worker) = pair(HostConfig::default());
        host.close().await.unwrap();

        assert_eq!(worker.next().await, Some(Frame::ShutdownRequest));
        assert_eq!(host.state(), BridgeState::ShutdownRequested);
        assert!(!host.is_closed());
        assert_eq!(host.send("c", "x"), Err(BridgeError::Closed));

        worker.sender.send(Frame::ShutdownAck).unwrap();
        worker.sender.close().await;
        tokio::time::timeout(WAIT, host.closed()).await.unwrap();
        assert!(host.is_closed());

        // The host closes its side too once the worker is gone.
        assert_eq!(worker.next().await, None);
        assert_eq!(host.wait_for_function("add").await.unwrap_err(), BridgeError::Closed);
        assert_eq!(
            host.call("add", ["1"]).unwrap_err(),
            CallError::UnknownFunction("add".to_string())
        );
    }

    #[tokio::test]
    async fn dropping_host_ends_worker_input() {
        let (host, mut worker) = pair(HostConfig::default());
        let clone = host.clone();
        drop(host);
        drop(clone);
        assert_eq!(worker.next().await, None);
    }

    #[tokio::test]
    async fn worker_shutdown_request_is_acknowledged() {
        let (host, mut worker) = pair(HostConfig::default());
        worker.sender.send(Frame::ShutdownRequest).unwrap();
        assert_eq!(worker.next().await, Some(Frame::ShutdownAck));
        assert_eq!(host.state(), BridgeState::ShutdownRequested);
    }

    #[tokio::test]
    async fn calls_fail_once_shutdown_begins() {
        let (host, worker) = pair(HostConfig::default());
        worker.register("f");
        let proxy = registered(&host, "f").await;
        host.close().await.unwrap();
        assert_eq!(proxy.call(["x"]).unwrap_err(), CallError::Closed);
    }
}
