use std::env;

use tracing::warn;

/// Get the type used for names without a `type://` prefix, from environment or "loc"
pub fn get_default_pv_type() -> String {
    env::var("PVPOOL_DEFAULT_TYPE")
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "loc".to_owned())
}

/// Get the list of interchangeable protocol prefixes, by default "ca pva"
///
/// The list is separated by whitespace or commas.
pub fn get_equivalent_prefixes() -> Vec<String> {
    let list = env::var("PVPOOL_EQUIVALENT_PREFIXES").unwrap_or_else(|_| "ca pva".to_owned());
    let prefixes: Vec<String> = list
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect();
    if prefixes.is_empty() {
        warn!("PVPOOL_EQUIVALENT_PREFIXES is set but empty, no prefixes are equivalent");
    }
    prefixes
}

/// Get the default buffer size for buffered subscriptions, from environment or 16
pub fn get_default_subscription_buffer() -> usize {
    env::var("PVPOOL_SUBSCRIPTION_BUFFER")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(16usize)
        .max(1usize)
}
