//! Single writer task per bridge.
//!
//! Every outbound frame goes through one queue drained by one task, so frames
//! produced concurrently (e.g. by parallel async handlers) never interleave on
//! the stream.

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;

use super::codec::FrameCodec;
use super::protocol::Frame;
use crate::error::BridgeError;

enum Outgoing {
    Frame(Frame),
    /// Completes once everything queued before it has been written.
    Flush(oneshot::Sender<()>),
    /// Flush, shut down the stream, and stop the writer.
    Close(oneshot::Sender<()>),
}

/// Handle for queueing frames on a bridge's output stream.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl FrameSender {
    /// Validate and queue a frame. Returns immediately; the write happens on
    /// the writer task.
    pub fn send(&self, frame: Frame) -> Result<(), BridgeError> {
        frame.validate()?;
        self.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| BridgeError::Closed)
    }

    /// Wait until every frame queued so far has been written and flushed.
    pub async fn flush(&self) -> Result<(), BridgeError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Outgoing::Flush(done_tx))
            .map_err(|_| BridgeError::Closed)?;
        done_rx.await.map_err(|_| BridgeError::Closed)
    }

    /// Flush pending frames and shut the stream down. Further sends fail.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Outgoing::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task for `writer`.
pub fn spawn_writer<W>(writer: W, codec: FrameCodec) -> (FrameSender, JoinHandle<()>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_writer(FramedWrite::new(writer, codec), rx));
    (FrameSender { tx }, handle)
}

async fn run_writer<W>(
    mut framed: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let role = framed.encoder().role();
    loop {
        let Some(msg) = rx.recv().await else {
            // Every sender is gone; end the stream so the peer sees EOF.
            if let Err(e) = framed.close().await {
                tracing::debug!(?role, error = %e, "Error shutting down bridge output");
            }
            break;
        };
        match msg {
            Outgoing::Frame(frame) => {
                let kind = frame.kind();
                if let Err(e) = framed.send(frame).await {
                    if e.kind() == std::io::ErrorKind::InvalidInput {
                        tracing::warn!(?role, kind, error = %e, "Dropping unencodable frame");
                        continue;
                    }
                    tracing::error!(?role, kind, error = %e, "Failed to write frame");
                    break;
                }
            }
            Outgoing::Flush(done) => {
                if let Err(e) = framed.flush().await {
                    tracing::error!(?role, error = %e, "Failed to flush bridge output");
                    break;
                }
                let _ = done.send(());
            }
            Outgoing::Close(done) => {
                if let Err(e) = framed.close().await {
                    tracing::debug!(?role, error = %e, "Error shutting down bridge output");
                }
                let _ = done.send(());
                break;
            }
        }
    }
    rx.close();
    tracing::debug!(?role, "Writer task exiting");
}
