//! Bridge configuration.
//!
//! Both sides build their config with `with_*` setters or read it from the
//! environment, which is how a spawned worker inherits settings from its host.

use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LEN;

pub const ENV_CALL_TIMEOUT_MS: &str = "STDBRIDGE_CALL_TIMEOUT_MS";
pub const ENV_MAX_FRAME_BYTES: &str = "STDBRIDGE_MAX_FRAME_BYTES";
pub const ENV_ERROR_FRAMES: &str = "STDBRIDGE_ERROR_FRAMES";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Applied to every call; `None` waits forever (the protocol has no timeout).
    pub call_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            call_timeout: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CALL_TIMEOUT_MS)? {
            config.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(len) = parse_max_frame_len(&lookup)? {
            config.max_frame_len = len;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Answer failed and unknown calls with `fnerror` frames instead of
    /// dropping them. Off by default: hosts that don't know the frame expect
    /// silence.
    pub error_frames: bool,
    pub max_frame_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            error_frames: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_frames(mut self, enabled: bool) -> Self {
        self.error_frames = enabled;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_ERROR_FRAMES) {
            config.error_frames = parse_flag(ENV_ERROR_FRAMES, &raw)?;
        }
        if let Some(len) = parse_max_frame_len(&lookup)? {
            config.max_frame_len = len;
        }
        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value: raw,
        })
}

fn parse_max_frame_len(
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<usize>, ConfigError> {
    match parse_var::<usize>(lookup, ENV_MAX_FRAME_BYTES)? {
        Some(0) => Err(ConfigError::Invalid {
            key: ENV_MAX_FRAME_BYTES,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
