//! Process-wide feature flags, set once at startup.

use std::sync::OnceLock;

static EXPERIMENTAL: OnceLock<bool> = OnceLock::new();

/// Record whether experimental features are enabled. Only the first call wins;
/// returns false if the flag had already been set.
pub fn init_experimental(enabled: bool) -> bool {
    EXPERIMENTAL.set(enabled).is_ok()
}

/// Experimental features flag. Defaults to off when never initialized.
pub fn experimental_enabled() -> bool {
    EXPERIMENTAL.get().copied().unwrap_or(false)
}
