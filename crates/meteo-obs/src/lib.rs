//! Observability init. JSON logs, `RUST_LOG`-driven filtering, one call
//! at process startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the global tracing subscriber. Defaults to
/// `info,meteo=debug` when `RUST_LOG` is unset.
pub fn init(service_name: &str) {
    let default_filter = "info,meteo=debug";
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    tracing_subscriber::registry()
        .with(EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(service = %service_name, "observability initialized");
}
