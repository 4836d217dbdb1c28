//! # Logging
//!
//! Installs the global `tracing` subscriber for the node. Output always
//! goes to stderr so that stdout carries nothing but command results
//! (`omega-node get 3 > block.bin`).
//!
//! `RUST_LOG` overrides the built-in directives when set.

use std::io::IsTerminal;

use clap::ValueEnum;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line, human oriented.
    Pretty,
    /// One line per event.
    Compact,
    /// One JSON object per event with fields flattened to the top level.
    Json,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer(format: LogFormat) -> BoxedLayer {
    let ansi = std::io::stderr().is_terminal();
    match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(ansi)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .boxed(),
    }
}

/// Install the subscriber. Fails if one is already installed.
pub fn init_logging(default_directives: &str, format: LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::registry()
        .with(output_layer(format))
        .with(filter)
        .try_init()?;
    tracing::debug!(?format, "logging ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_parse_from_the_command_line() {
        assert_eq!(LogFormat::from_str("json", true), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_str("COMPACT", true), Ok(LogFormat::Compact));
        assert!(LogFormat::from_str("yaml", true).is_err());
    }

    #[test]
    fn second_install_is_refused() {
        // Nothing else in this binary installs a subscriber.
        init_logging("warn", LogFormat::Compact).unwrap();
        assert!(init_logging("warn", LogFormat::Json).is_err());
    }
}
