//! Tracing subscriber setup for the `labeler` binary.
//!
//! Logs go to stderr. Worker processes inherit this setup and the
//! orchestrator captures their stderr in per-shard log files, so every line
//! carries the shard id as a field rather than relying on the file name.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber once. `json` switches to JSON lines.
pub fn init_logging(json: bool) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let layer = if json {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false)
                .json()
                .with_filter(env_filter())
                .boxed()
        } else {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(env_filter())
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("global tracing subscriber already set; keeping it");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging(false);
        init_logging(true);
        tracing::info!("still logging");
    }
}
