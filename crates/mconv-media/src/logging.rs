//! Structured conversion logging.
//!
//! Provides consistent, structured logging for conversion lifecycles and a
//! subscriber set-up helper for applications embedding this crate.

use tracing::{debug, error, info, warn, Span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT` from the environment.
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").map(|v| v.to_lowercase()).as_deref() {
            Ok("json") => Self::Json,
            Ok("compact") => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Install a global tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Returns `false` when a
/// subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
    };

    result.is_ok()
}

/// Logger carrying the identity of one conversion.
#[derive(Debug, Clone)]
pub struct ConversionLogger {
    conversion_id: String,
    verbose: bool,
}

impl ConversionLogger {
    /// Create a logger. `verbose` promotes lifecycle messages to info.
    pub fn new(conversion_id: impl Into<String>, verbose: bool) -> Self {
        Self {
            conversion_id: conversion_id.into(),
            verbose,
        }
    }

    /// Log a lifecycle step.
    pub fn log_step(&self, message: &str) {
        if self.verbose {
            info!(conversion_id = %self.conversion_id, "{}", message);
        } else {
            debug!(conversion_id = %self.conversion_id, "{}", message);
        }
    }

    /// Log the spawned transcoder.
    pub fn log_spawn(&self, pid: Option<u32>, args: &[String]) {
        info!(
            conversion_id = %self.conversion_id,
            pid = ?pid,
            "Spawned transcoder: {}", args.join(" ")
        );
    }

    /// Log a non-fatal transcoder message.
    pub fn log_warning(&self, message: &str) {
        warn!(conversion_id = %self.conversion_id, "Conversion warning: {}", message);
    }

    /// Log a terminal error.
    pub fn log_error(&self, message: &str) {
        error!(conversion_id = %self.conversion_id, "Conversion error: {}", message);
    }

    /// Log the end of a conversion.
    pub fn log_end(&self, failed: bool) {
        if failed {
            warn!(conversion_id = %self.conversion_id, "Conversion ended with an error");
        } else {
            info!(conversion_id = %self.conversion_id, "Conversion ended");
        }
    }

    /// Get the conversion ID.
    pub fn conversion_id(&self) -> &str {
        &self.conversion_id
    }

    /// Create a tracing span for this conversion.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("conversion", conversion_id = %self.conversion_id)
    }
}
