//! Logging and tracing setup.
//!
//! Structured logging via `tracing`. The extension additionally honors
//! `ELASTIC_APM_LOG_LEVEL` so the function owner can tune verbosity
//! without knowing this is a Rust process underneath.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for the extension process.
///
/// Precedence: `RUST_LOG` env var, then `ELASTIC_APM_LOG_LEVEL`, then `info`.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("ELASTIC_APM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}
