//! Tracing/logging bootstrap for engine hosts.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,beacon_engine=debug";

/// Initialize the global tracing subscriber with severity gating from the
/// environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `BEACON_LOG`
/// 3) internal default filter
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(filter) = env::var("BEACON_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .and_then(|value| EnvFilter::try_new(value).ok())
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}
