//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured log level applies to
//! this crate and `warn` to everything else.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Settings;

/// Builds the filter used by [`init`].
pub fn env_filter(settings: &Settings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,cqed_mc={}",
            settings.application.log_level
        ))
    })
}

/// Install the global fmt subscriber. Calling it twice is harmless.
pub fn init(settings: &Settings) {
    let result = fmt()
        .with_env_filter(env_filter(settings))
        .with_target(true)
        .try_init();

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
