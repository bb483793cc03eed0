use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// File name prefix for rolled log files.
const LOG_FILE_PREFIX: &str = "offline-engine.log";

/// Install the global subscriber. Logs go to stderr, and additionally to a
/// daily rolling file under `directory` when given. RUST_LOG overrides
/// `level`.
///
/// Keep the returned guard alive for the life of the program or buffered
/// file output is lost.
pub fn init(level: &str, directory: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

  let console = fmt::layer()
    .compact()
    .with_target(false)
    .with_writer(std::io::stderr);

  let registry = Registry::default().with(filter).with(console);

  match directory {
    Some(dir) => {
      let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let file = fmt::layer().with_ansi(false).with_writer(writer);
      // A subscriber may already be set (tests, embedding hosts)
      let _ = registry.with(file).try_init();
      Some(guard)
    }
    None => {
      let _ = registry.try_init();
      None
    }
  }
}
