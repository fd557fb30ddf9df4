//! Wire layer shared by both ends of the bridge.
//!
//! # Architecture
//!
//! - **protocol**: Frame types, call identifiers and the text grammar
//! - **codec**: marker-delimited framing codec for AsyncRead/AsyncWrite
//! - **writer**: single writer task that serializes all outbound frames

pub mod codec;
pub mod protocol;
pub mod writer;

pub use codec::FrameCodec;
pub use protocol::{CallId, Frame, Role};
pub use writer::{FrameSender, spawn_writer};
