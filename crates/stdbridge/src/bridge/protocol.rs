//! Wire protocol types for host-worker communication.
//!
//! Every frame is a line-oriented text body terminated by the end-of-value
//! marker and a newline. Values may contain embedded line breaks, so the
//! marker (not the newline) delimits frames.
//!
//! Single-argument and no-argument calls carry the marker after `]_end_arg`,
//! and shutdown and host-to-worker channel frames are marker-terminated as
//! well. Peers that expect the marker inside the last argument, or
//! unterminated shutdown and channel lines, cannot talk to this codec.
//!
//! Call ids must not contain `_`: the response grammar splits on the first
//! one. Hosts issue hyphenated UUIDs, and workers skip calls whose id would
//! not survive the trip back.

use crate::error::FrameError;

/// Terminates every frame on the wire.
pub const END_MARKER: &str = "[bridgeendline]";

/// Argument token sent when a call carries no user arguments.
pub const NO_ARG: &str = "noarg";

const REGISTER_PREFIX: &str = "fnregister_";
const RESPONSE_PREFIX: &str = "fnresponse_";
const ERROR_PREFIX: &str = "fnerror_";
const CALL_PREFIX: &str = "function__bridge_name[";
const CALL_ID_SEP: &str = "]_end_name_bridge_id[";
const CALL_ARG_SEP: &str = "]_end_id_bridge_arg[";
const CALL_ARG_END: &str = "]_end_arg";
const TO_WORKER_PREFIX: &str = "torust__bridge_name[";
const TO_HOST_PREFIX: &str = "tonode__bridge_name[";
const CHANNEL_NAME_END: &str = "]_end_name";
const SHUTDOWN_REQUEST: &str = "[bridgeexit]_";
const SHUTDOWN_ACK: &str = "[bridgeexitack]_";

/// Unique identifier correlating a Call frame with its Response.
///
/// UUID v4: 122 random bits, so collisions among pending calls are negligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Which end of the bridge a codec serves.
///
/// Only channel frames are direction-specific: the host publishes with the
/// `torust` prefix and the worker with `tonode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Worker,
}

impl Role {
    fn outbound_channel_prefix(self) -> &'static str {
        match self {
            Role::Host => TO_WORKER_PREFIX,
            Role::Worker => TO_HOST_PREFIX,
        }
    }

    fn inbound_channel_prefix(self) -> &'static str {
        match self {
            Role::Host => TO_HOST_PREFIX,
            Role::Worker => TO_WORKER_PREFIX,
        }
    }
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Worker advertises a callable function.
    Registration { name: String },

    /// Host invokes a function. Ids are kept as text so a worker echoes
    /// whatever the peer sent, which only works for ids without `_`.
    Call {
        name: String,
        id: String,
        args: Vec<String>,
    },

    Response { id: String, value: String },

    /// Negative acknowledgment for a call. Only sent by workers that opt in.
    Error { id: String, message: String },

    ChannelMessage { channel: String, payload: String },

    ShutdownRequest,

    ShutdownAck,
}

impl Frame {
    /// Check that the frame survives encoding and decoding unchanged.
    pub fn validate(&self) -> Result<(), FrameError> {
        match self {
            Frame::Registration { name } => validate_name("function", name),
            Frame::Call { name, id, args } => {
                validate_name("function", name)?;
                validate_id(id)?;
                args.iter().try_for_each(|arg| validate_value(arg))
            }
            Frame::Response { id, value } => {
                validate_id(id)?;
                validate_value(value)
            }
            Frame::Error { id, message } => {
                validate_id(id)?;
                validate_value(message)
            }
            Frame::ChannelMessage { channel, payload } => {
                validate_name("channel", channel)?;
                validate_value(payload)
            }
            Frame::ShutdownRequest | Frame::ShutdownAck => Ok(()),
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Registration { .. } => "registration",
            Frame::Call { .. } => "call",
            Frame::Response { .. } => "response",
            Frame::Error { .. } => "error",
            Frame::ChannelMessage { .. } => "channel",
            Frame::ShutdownRequest => "shutdown_request",
            Frame::ShutdownAck => "shutdown_ack",
        }
    }

    /// Render the frame body (without the end-of-value marker).
    pub(crate) fn render(&self, role: Role, out: &mut String) {
        match self {
            Frame::Registration { name } => {
                out.push_str(REGISTER_PREFIX);
                out.push_str(name);
            }
            Frame::Call { name, id, args } => {
                out.push_str(CALL_PREFIX);
                out.push_str(name);
                out.push_str(CALL_ID_SEP);
                out.push_str(id);
                out.push_str(CALL_ARG_SEP);
                let mut args = args.iter();
                out.push_str(args.next().map(String::as_str).unwrap_or(NO_ARG));
                out.push_str(CALL_ARG_END);
                for arg in args {
                    out.push_str("\nparam_");
                    out.push_str(id);
                    out.push('_');
                    out.push_str(arg);
                }
            }
            Frame::Response { id, value } => {
                out.push_str(RESPONSE_PREFIX);
                out.push_str(id);
                out.push('_');
                out.push_str(value);
            }
            Frame::Error { id, message } => {
                out.push_str(ERROR_PREFIX);
                out.push_str(id);
                out.push('_');
                out.push_str(message);
            }
            Frame::ChannelMessage { channel, payload } => {
                out.push_str(role.outbound_channel_prefix());
                out.push_str(channel);
                out.push_str(CHANNEL_NAME_END);
                out.push_str(payload);
            }
            Frame::ShutdownRequest => out.push_str(SHUTDOWN_REQUEST),
            Frame::ShutdownAck => out.push_str(SHUTDOWN_ACK),
        }
    }

    /// Parse a frame body received by `role`.
    ///
    /// Returns `None` for anything unrecognized; callers drop those silently.
    pub(crate) fn parse(body: &str, role: Role) -> Option<Frame> {
        match body {
            SHUTDOWN_REQUEST => return Some(Frame::ShutdownRequest),
            SHUTDOWN_ACK => return Some(Frame::ShutdownAck),
            _ => {}
        }

        if let Some(name) = body.strip_prefix(REGISTER_PREFIX) {
            return (!name.is_empty()).then(|| Frame::Registration {
                name: name.to_string(),
            });
        }
        if let Some(rest) = body.strip_prefix(RESPONSE_PREFIX) {
            let (id, value) = rest.split_once('_')?;
            return Some(Frame::Response {
                id: id.to_string(),
                value: value.to_string(),
            });
        }
        if let Some(rest) = body.strip_prefix(ERROR_PREFIX) {
            let (id, message) = rest.split_once('_')?;
            return Some(Frame::Error {
                id: id.to_string(),
                message: message.to_string(),
            });
        }
        if let Some(rest) = body.strip_prefix(role.inbound_channel_prefix()) {
            let (channel, payload) = rest.split_once(CHANNEL_NAME_END)?;
            return Some(Frame::ChannelMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        if let Some(rest) = body.strip_prefix(CALL_PREFIX) {
            return parse_call(rest);
        }
        None
    }
}

fn parse_call(rest: &str) -> Option<Frame> {
    let (name, rest) = rest.split_once(CALL_ID_SEP)?;
    let (id, tail) = rest.split_once(CALL_ARG_SEP)?;

    // Continuation lines are tagged with the call id, which keeps embedded
    // line breaks in earlier arguments unambiguous.
    let first_continuation = format!("{CALL_ARG_END}\nparam_{id}_");
    let mut args = Vec::new();
    if let Some((first, more)) = tail.split_once(first_continuation.as_str()) {
        args.push(first.to_string());
        let continuation = format!("\nparam_{id}_");
        args.extend(more.split(continuation.as_str()).map(str::to_string));
    } else {
        let first = tail.strip_suffix(CALL_ARG_END)?;
        if first != NO_ARG {
            args.push(first.to_string());
        }
    }

    Some(Frame::Call {
        name: name.to_string(),
        id: id.to_string(),
        args,
    })
}

fn validate_name(kind: &'static str, name: &str) -> Result<(), FrameError> {
    let bad = name.is_empty() || name.contains(['[', ']', '\r', '\n']);
    if bad {
        return Err(FrameError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn validate_id(id: &str) -> Result<(), FrameError> {
    let bad = id.is_empty() || id.contains(['_', '[', ']', '\r', '\n']);
    if bad {
        return Err(FrameError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<(), FrameError> {
    if value.contains(END_MARKER) {
        return Err(FrameError::ReservedMarker);
    }
    Ok(())
}
