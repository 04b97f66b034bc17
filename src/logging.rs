use std::io;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::filter::FilterFn;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Directory holding the rolling retrieval log.
pub const LOG_DIRECTORY: &str = "logs";
/// File name prefix of the rolling retrieval log.
pub const LOG_FILE_PREFIX: &str = "pressforward.log";

pub fn configure_logging() {
    // feed-rs is chatty about malformed markup it recovers from
    let custom_filter = FilterFn::new(|metadata| {
        !(metadata.level() == &Level::WARN && metadata.target().starts_with("feed_rs"))
    });

    // Stdout log configuration
    let stdout_log = fmt::layer()
        .with_writer(io::stdout)
        .with_filter(EnvFilter::new(
            "info,retrieval=info,web_request=warn,db_query=warn,sqlx=off",
        ))
        .with_filter(custom_filter);

    // File log configuration, the raw log surfaced to admins
    let file_appender = rolling::daily(LOG_DIRECTORY, LOG_FILE_PREFIX);
    let file_log = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new("retrieval=debug,info,sqlx=warn"));

    tracing_subscriber::Registry::default()
        .with(stdout_log)
        .with(file_log)
        .init();
}

/// Stdout-only logging for the command line tools.
pub fn configure_cli_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}
