//! Structured logging setup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter; `RUST_LOG` is used when it is unset.
pub const LOG_VAR: &str = "XFER_RUN_LOG";

/// Installs a fmt subscriber filtered by `XFER_RUN_LOG` or `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already installed.
pub fn init() {
    init_with("info");
}

/// Like [`init`], with `default` as the filter when neither variable is set or valid.
pub fn init_with(default: &str) {
    let filter = EnvFilter::try_from_env(LOG_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_with("debug");
        init();
        tracing::debug!("logging initialised twice");
    }
}
