// Copilot Proxy GUI - Logging setup

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "copilot_proxy_gui_lib=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter;
/// a second call is a no-op.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
