use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Connects tracing to stdout
///
/// `RUST_LOG` takes precedence over the given default filter.
pub fn init(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}
