//! Logging infrastructure for tapline
//!
//! Logs are written to `~/.local/state/tapline/tapline.log` following XDG standards.
//!
//! The configured level applies to tapline's own targets (`tapline_core`,
//! `tapline`). Dependencies such as `hyper`, `reqwest` and `rusqlite` stay at
//! `warn` so a `debug` log shows batching decisions rather than HTTP internals.
//! `RUST_LOG` replaces the whole filter when set.
//!
//! tapline is usually embedded in a host app that installs its own global
//! subscriber first. In that case [`init`] leaves it in place and tapline's
//! events flow into the host's subscriber; the returned guard reports this
//! through [`LoggingGuard::is_installed`].

use crate::config::{Config, LoggingConfig};
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_NAME: &str = "tapline.log";

/// Targets the configured level applies to
const OWN_TARGETS: [&str; 2] = ["tapline_core", "tapline"];

/// Initialize the logging system in the XDG state directory
///
/// Sets up tracing with:
/// - File output to `$XDG_STATE_HOME/tapline/`
/// - Daily log rotation
/// - Configured level for tapline targets, `warn` for dependencies
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    init_in(&Config::state_dir(), config)
}

/// Initialize the logging system, writing into `log_dir`
///
/// For hosts whose writable area is not the XDG state directory (app
/// sandboxes, containers).
pub fn init_in(log_dir: &Path, config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);

    // Keep file writes off the threads calling add_event
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.level)));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            log_dir = %log_dir.display(),
            level = %config.level,
            "Logging initialized"
        );
    } else {
        tracing::info!("Global subscriber already set, tapline logs go to the host's subscriber");
    }

    Ok(LoggingGuard {
        _guard: guard,
        installed,
    })
}

/// Filter directives: `warn` globally, `level` for tapline's own targets
pub fn default_directives(level: &str) -> String {
    let mut directives = String::from("warn");
    for target in OWN_TARGETS {
        directives.push_str(&format!(",{}={}", target, level));
    }
    directives
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
    installed: bool,
}

impl LoggingGuard {
    /// Whether tapline's file subscriber became the global one
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Returns the log file path
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}
