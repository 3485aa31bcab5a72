// Logging Module - tracing subscriber setup for the console
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

/// Level used when RUST_LOG is not set
pub fn default_level(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::WARN;
    }
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber; logs go to stderr, RUST_LOG takes precedence
pub fn init(verbose: u8, quiet: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level(verbose, quiet).into())
        .from_env_lossy();

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose > 0)
        .with_filter(filter);

    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry().with(console_layer).try_init();
}
