//! Logging subsystem.
//!
//! Structured logging via tracing, with every line passed through the
//! secret redactor before it reaches the writer.
//!
//! # Environment variables
//!
//! - `RISKGATE_LOG` — primary log level/filter (takes precedence)
//! - `RUST_LOG` — fallback log level/filter

pub mod redact;

use tracing_subscriber::EnvFilter;

use redact::RedactingMakeWriter;

/// Install the global tracing subscriber with redacted stderr output.
///
/// Returns an error when a subscriber is already installed (tests call this
/// repeatedly; ignore the result there).
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = std::env::var("RISKGATE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter)?)
        .with_writer(RedactingMakeWriter::new(std::io::stderr))
        .with_target(true)
        .try_init()?;
    Ok(())
}
