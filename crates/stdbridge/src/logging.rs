//! Tracing setup for processes on either end of a bridge.
//!
//! Logs always go to stderr: a worker's stdout carries the protocol, so
//! writing anything else there would corrupt the stream.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const ENV_LOG: &str = "STDBRIDGE_LOG";

/// Install a global subscriber. Safe to call more than once.
///
/// `RUST_LOG` takes precedence; otherwise `STDBRIDGE_LOG` picks the level for
/// this crate (default `info`). `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(ENV_LOG).ok().as_deref());
        EnvFilter::new(default_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Filter directives for a `STDBRIDGE_LOG` level.
///
/// The wire layer logs every frame at trace and every skipped frame at debug.
/// At `debug` it stays at `info`; only `trace` opens it up.
fn default_directives(level: &str) -> String {
    let wire = match level {
        "debug" => "info",
        other => other,
    };
    format!(
        "stdbridge={level},stdbridge_demo_worker={level},\
         stdbridge::bridge::codec={wire},stdbridge::bridge::writer={wire}"
    )
}

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}
