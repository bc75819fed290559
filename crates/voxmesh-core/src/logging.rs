use std::sync::Once;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "voxmesh_core=debug";

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
/// Safe to call more than once; only the first call has an effect, and an
/// already-installed global subscriber is left in place.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
            )
            .with_ansi(false)
            .try_init();
    });
}
