//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;

/// Initialize the JSON tracing subscriber from the runtime configuration
///
/// Safe to call once per process; subsequent calls are ignored so warm
/// invocations do not re-register the subscriber.
pub fn init_tracing(config: &RuntimeConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init();

    match result {
        Ok(()) => tracing::info!(log_level = %config.log_level, "tracing initialized"),
        Err(_) => tracing::debug!("tracing already initialized; keeping existing subscriber"),
    }
}
