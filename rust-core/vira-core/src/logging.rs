//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset or invalid
pub const DEFAULT_DIRECTIVE: &str = "vira_core=info";

/// Install a global `fmt` subscriber filtered by `RUST_LOG`
///
/// Returns `false` if a global subscriber was already set; calling this more
/// than once is harmless.
pub fn init_tracing(json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}
