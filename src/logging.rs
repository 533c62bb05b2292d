use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize structured logging, defaulting to INFO and honoring
/// RUST_LOG overrides.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Ignore err when re-initialized
}
