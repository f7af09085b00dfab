//! Structured logging setup, shared by any binary embedding the engine.
//! Set `RUST_LOG`, e.g. `"info,keeply_core=debug"`.

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initializes a global `tracing` subscriber once per process. Safe to call
/// more than once; later calls are no-ops.
pub fn init_logging() {
    let fmt_layer = fmt::layer().with_target(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}
