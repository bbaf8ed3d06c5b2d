//! Tracing subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

pub const LOG_VAR: &str = "TENSORKIT_LOG";

static INIT: OnceLock<()> = OnceLock::new();

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to `TENSORKIT_LOG` and then
/// `warn`. Safe to call repeatedly; only the first call has an effect, and an already
/// installed global subscriber is left in place.
pub fn init_logging() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_from_env(LOG_VAR))
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
        tracing::debug!("logging initialised twice without panicking");
    }
}
