//! Tracing setup shared by the hub and worker binaries.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Install the global subscriber: stderr always, plus a daily rolling file
/// under `AGENT_LINK_LOG_DIR` when set.
///
/// Keep the returned guard alive for the life of the process or buffered
/// file output is lost.
pub fn init(file_prefix: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("AGENT_LINK_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
