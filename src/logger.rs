use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log verbosity, resolved once at startup and handed to each component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name; accepts the common aliases
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "quiet" | "silent" | "off" => Some(LogLevel::Quiet),
            "error" | "err" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Quiet => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Resolve the effective level from `--log_level` and `--debug`.
    ///
    /// An explicit level always wins; `--debug` only applies when no level
    /// was given. Unknown names fall back to info.
    pub fn resolve(explicit: Option<&str>, debug: bool) -> Self {
        match explicit.map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => LogLevel::from_str(name).unwrap_or_default(),
            None if debug => LogLevel::Debug,
            None => LogLevel::Info,
        }
    }

    /// Whether per-packet and per-connection trace lines should be emitted
    pub fn traces_packets(&self) -> bool {
        *self >= LogLevel::Debug
    }

    /// Whether the periodic stats line is visible at this level
    pub fn shows_info(&self) -> bool {
        *self >= LogLevel::Info
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. When `log_file` is set, output
/// is appended to that file without ANSI colors.
pub fn init_logger(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::new(format!("vpn_steer={}", level.as_str()))
    };

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow!("failed to open log file {}: {}", path.display(), e))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_target(true)
                        .with_line_number(true)
                        .with_ansi(false)
                        .compact(),
                )
                .try_init()
                .map_err(|e| anyhow!("failed to install logger: {}", e))
        }
        None => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(true)
                    .with_ansi(true)
                    .compact(),
            )
            .try_init()
            .map_err(|e| anyhow!("failed to install logger: {}", e)),
    }
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Record a SOCKS connection lifecycle event
    pub fn connection(peer: &str, event: &str) {
        debug!(peer = peer, event = event, "Connection");
    }

    /// Record a policy drop of one packet
    pub fn dropped(direction: &str, reason: &str, len: usize) {
        debug!(direction = direction, reason = reason, len = len, "Packet dropped");
    }
}
