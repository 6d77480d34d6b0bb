//! Tracing bootstrap shared by ACM services

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::AcmError;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level`. Set `json_logs` in
/// production so log shippers get structured output.
pub fn init_tracing(service_name: &str, log_level: &str, json_logs: bool) -> Result<(), AcmError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let result = if json_logs {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };
    result.map_err(|e| AcmError::Config(e.to_string()))?;

    tracing::info!(
        service = service_name,
        log_level,
        json_logs,
        "Tracing initialized"
    );

    Ok(())
}
