//! Logging setup for binaries and tests that drive the fusion engine

use tracing::Level;

/// Initialize the tracing subscriber at INFO, overridable through `RUST_LOG`
///
/// ```no_run
/// map_fusion_algo::init_logger();
/// tracing::info!("fusion started");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// Calling it again is a no-op, so every test may call it.
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .try_init();
}
