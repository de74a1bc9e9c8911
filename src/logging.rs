//! Structured logging for the cache and execution engine
//!
//! All log lines use structured fields so they can be filtered and parsed.
//!
//! # Log Format Conventions
//!
//! - `operation`: what is being done ("get", "put", "execute", "fingertip")
//! - `status`: the outcome ("success", "miss", "error", "hit")
//! - `checksum`: buffer or transformation checksum (hex, often shortened)
//! - `size_bytes`: buffer size
//! - `service`: the tier or collaborator involved ("buffer_cache", "database", ...)
//!
//! # Examples
//!
//! ```rust,ignore
//! use tracing::info;
//!
//! info!(
//!     service = "transformation_cache",
//!     operation = "execute",
//!     status = "success",
//!     checksum = %tf_checksum.short(),
//!     "transformation finished"
//! );
//! ```

use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Formatter that prints "seamless" instead of the full module path
struct SeamlessFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for SeamlessFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                tracing::Level::DEBUG => "\x1b[34m",
                tracing::Level::TRACE => "\x1b[35m",
            };
            write!(writer, "{}{:5}(seamless)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(seamless): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, colored
    Pretty,
    /// Uncolored single line (CI)
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl LogFormat {
    /// Read `SEAMLESS_LOG_FORMAT`, falling back to compact under CI
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var("SEAMLESS_LOG_FORMAT").ok().as_deref(),
            std::env::var("CI").is_ok(),
        )
    }

    fn parse(value: Option<&str>, ci: bool) -> Self {
        match value.unwrap_or_default().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ if ci => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Install the global tracing subscriber
///
/// # Environment Variables
///
/// - `RUST_LOG`: log filter (default "info")
/// - `SEAMLESS_LOG_FORMAT`: "pretty", "compact" or "json"
/// - `CI`: if set, defaults to compact
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match LogFormat::from_env() {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(SeamlessFormatter { with_ansi: true })
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(SeamlessFormatter { with_ansi: false })
                        .with_writer(io::stderr),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_ansi(false)
                        .with_writer(io::stderr)
                        .json(),
                )
                .init();
        }
    }
}

/// Service names
pub mod services {
    pub const BUFFER_CACHE: &str = "buffer_cache";
    pub const BUFFER_SERVER: &str = "buffer_server";
    pub const DATABASE: &str = "database";
    pub const FAIR: &str = "fair";
    pub const TRANSFORMATION_CACHE: &str = "transformation_cache";
    pub const DELEGATION: &str = "delegation";
    pub const REMOTE_COMPUTE: &str = "remote_compute";
}

/// Operation names
pub mod operations {
    pub const GET: &str = "get";
    pub const PUT: &str = "put";
    pub const EXECUTE: &str = "execute";
    pub const FINGERTIP: &str = "fingertip";
    pub const UNDO: &str = "undo";
    pub const EVICT: &str = "evict";
}

/// Status values
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const ERROR: &str = "error";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_selection() {
        assert_eq!(LogFormat::parse(Some("json"), false), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("COMPACT"), false), LogFormat::Compact);
        assert_eq!(LogFormat::parse(None, false), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(None, true), LogFormat::Compact);
        assert_eq!(LogFormat::parse(Some("pretty"), true), LogFormat::Pretty);
    }
}
