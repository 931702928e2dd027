//! Structured logging setup, simplified from `gate-core`'s
//! `tracing::init`/`tracing::config` modules (OTLP/Prometheus export
//! dropped — see DESIGN.md).

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Instrumentation knobs read from process configuration.
pub struct InstrumentationConfig {
    pub log_level: String,
    pub json: bool,
}

pub fn init_tracing(config: &InstrumentationConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}
