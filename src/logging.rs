//! Process-wide tracing setup.
//!
//! Logs go to stderr, or to a daily-rotated file when a directory is
//! configured. Initialization happens at most once per process.

use color_eyre::{eyre::eyre, Result};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "lifevault.log";

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();

struct LoggingState {
  dir: Option<PathBuf>,
  // Flushes the file writer when the process exits.
  _guard: Option<WorkerGuard>,
}

/// Install the global subscriber. Repeat calls are no-ops.
///
/// `RUST_LOG` takes precedence over `config.level`.
pub fn init(config: &LogConfig) -> Result<()> {
  let state = LOGGING_STATE.get_or_try_init(|| -> Result<LoggingState> {
    let filter = EnvFilter::try_from_default_env()
      .or_else(|_| EnvFilter::try_new(&config.level))
      .map_err(|e| eyre!("Invalid log level {}: {}", config.level, e))?;

    let guard = match &config.dir {
      Some(dir) => {
        std::fs::create_dir_all(dir)
          .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
          .with_env_filter(filter)
          .with_writer(writer)
          .with_ansi(false)
          .try_init()
          .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
        Some(guard)
      }
      None => {
        tracing_subscriber::fmt()
          .with_env_filter(filter)
          .with_writer(std::io::stderr)
          .try_init()
          .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
        None
      }
    };

    info!(
      version = env!("CARGO_PKG_VERSION"),
      dir = ?config.dir,
      "logging initialized"
    );
    Ok(LoggingState {
      dir: config.dir.clone(),
      _guard: guard,
    })
  })?;

  if state.dir != config.dir {
    tracing::warn!(
      active = ?state.dir,
      requested = ?config.dir,
      "logging already initialized, ignoring new directory"
    );
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = LogConfig {
      level: "debug".to_string(),
      dir: Some(dir.path().to_path_buf()),
    };
    init(&config).unwrap();
    init(&config).unwrap();
    init(&LogConfig::default()).unwrap();
  }
}
