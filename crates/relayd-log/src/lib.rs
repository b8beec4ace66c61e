// ABOUTME: Shared logging setup for relayd processes
// ABOUTME: init() for the host, init_for() for worker processes whose stderr the host forwards

use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
/// Used by the host (`relayd serve`) and one-shot commands.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .try_init();
}

/// Crate-filtered logging to stderr without ANSI colors. Default: INFO for the named
/// crate, WARN for everything else.
///
/// Worker processes use this: their stderr is captured line by line by the host and
/// re-emitted through its own subscriber, so escape codes would end up in the host log.
pub fn init_for(crate_name: &str) {
    let directive = format!("{crate_name}=info");
    let filter = EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        );

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .try_init();
}
