//! Logging setup for the agent binary.

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `level` comes from `NRT_LOG_LEVEL`; hyper's connection chatter is pinned
/// down so intake traffic does not drown the agent's own logs. Safe to call
/// once per process; later calls are ignored.
pub fn init(level: &str) {
    let filter = format!("h2=off,hyper=off,{level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_level(true)
        .with_target(true)
        .without_time()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
