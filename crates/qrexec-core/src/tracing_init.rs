//! Tracing/logging initialization.
//!
//! Logs always go to stderr; stdout may be carrying relayed data.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"qrexec_client=warn"`).
/// With `log_json` every event is one JSON line.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = build_filter(default_filter, std::env::var("RUST_LOG").ok());
    let output = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let output = if log_json {
        output.json().boxed()
    } else {
        output.boxed()
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .init();
}

fn build_filter(default_filter: &str, rust_log: Option<String>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}
