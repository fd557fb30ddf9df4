//! stdbridge: function calls and channel messaging between a host process and
//! a worker it spawned, carried over the worker's stdin/stdout.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod directory;
pub mod error;
pub mod host;
pub mod logging;
pub mod registry;
pub mod shutdown;
pub mod worker;

pub use bridge::{CallId, Frame, FrameCodec, Role};
pub use config::{ConfigError, HostConfig, WorkerConfig};
pub use correlator::{CallResult, PendingCall};
pub use error::{BridgeError, CallError, FrameError};
pub use host::{HostBridge, Proxy, SpawnError};
pub use registry::{HandlerError, HandlerKind};
pub use shutdown::BridgeState;
pub use worker::WorkerBridge;
