//! Tracing subscriber setup for the `vsync` binary.

use tracing_subscriber::EnvFilter;

/// Install a console subscriber on stderr. `RUST_LOG` overrides the level
/// chosen by `--verbose`.
pub fn init(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
        .add_directive("sqlx=warn".parse().unwrap_or_else(|_| level.into()))
        .add_directive("hyper=warn".parse().unwrap_or_else(|_| level.into()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .try_init();
}
