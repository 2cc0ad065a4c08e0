use crate::config::Environment;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize tracing subscriber with pretty formatting for development
/// and JSON formatting for production.
///
/// Uses RUST_LOG environment variable for filtering (defaults to "info" if not set).
/// Logs go to stderr so that stdout stays free for program output.
///
/// Panics if a global subscriber is already installed; see [`try_setup_logging`].
pub fn setup_logging(environment: Environment) {
    if let Err(e) = try_setup_logging(environment) {
        panic!("failed to install tracing subscriber: {e}");
    }
}

/// Like [`setup_logging`], but reports an already installed subscriber as an
/// error instead of panicking.
pub fn try_setup_logging(environment: Environment) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match environment {
        Environment::Production => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
        Environment::Development => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
    }
    Ok(())
}
