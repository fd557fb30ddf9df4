//! Error types shared by the host and worker sides.
//!
//! The protocol itself has no negative acknowledgment: malformed frames are
//! dropped and unknown calls stall. These types only cover what the local
//! side can observe.

use std::time::Duration;

/// A frame that cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Function and channel names must be non-empty and free of brackets and line breaks.
    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: &'static str, name: String },

    /// Values may contain line breaks but never the end-of-value marker itself.
    #[error("value contains the reserved end-of-value marker")]
    ReservedMarker,

    /// Call identifiers are echoed verbatim and must not contain separators.
    #[error("invalid call id {0:?}")]
    InvalidId(String),
}

/// Errors from publishing, registering or waiting on a bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is closed")]
    Closed,

    #[error(transparent)]
    InvalidFrame(#[from] FrameError),

    #[error("failed to serialize payload: {0}")]
    Serialize(String),
}

/// Why a call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// No Registration frame for this name has been observed yet.
    #[error("no function named `{0}` has been registered")]
    UnknownFunction(String),

    /// The worker answered with an `fnerror` frame.
    #[error("worker reported an error: {0}")]
    Remote(String),

    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    #[error("bridge is closed")]
    Closed,

    #[error(transparent)]
    InvalidFrame(#[from] FrameError),

    /// The textual result could not be interpreted as the requested type.
    #[error("failed to decode result {value:?}: {reason}")]
    Decode { value: String, reason: String },
}

impl From<BridgeError> for CallError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Closed => CallError::Closed,
            BridgeError::InvalidFrame(e) => CallError::InvalidFrame(e),
            BridgeError::Serialize(reason) => CallError::Decode {
                value: String::new(),
                reason,
            },
        }
    }
}
