//! Tracing subscriber setup shared by the `sshrc` and `sshrc-monitor`
//! binaries.

use std::fs::OpenOptions;
use std::io::IsTerminal;

use camino::{Utf8Path, Utf8PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Environment variable naming a file that receives client logs instead of
/// stderr.
pub const LOG_FILE_ENV: &str = "SSHRC_LOG";

/// Keeps the background log writer alive; drop it last to flush pending
/// events.
#[derive(Debug)]
#[must_use = "dropping the guard stops the log writer"]
pub struct TelemetryGuard {
    _guard: Option<WorkerGuard>,
}

impl TelemetryGuard {
    const fn disabled() -> Self {
        Self { _guard: None }
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// `default_level`; events go to the file named by [`LOG_FILE_ENV`] when
/// set, otherwise to stderr.
pub fn init_tracing(default_level: &str) -> TelemetryGuard {
    let log_file = std::env::var(LOG_FILE_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(Utf8PathBuf::from);
    install(default_level, log_file.as_deref())
}

/// Installs the global subscriber appending to `path`, falling back to
/// stderr when the file cannot be opened.
pub fn init_file_tracing(default_level: &str, path: &Utf8Path) -> TelemetryGuard {
    install(default_level, Some(path))
}

fn install(default_level: &str, log_file: Option<&Utf8Path>) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let mut open_failure = None;
    let (writer, guard, ansi) = match log_file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                (BoxMakeWriter::new(non_blocking), Some(guard), false)
            }
            Err(err) => {
                open_failure = Some((path.to_owned(), err));
                (BoxMakeWriter::new(std::io::stderr), None, stderr_is_terminal())
            }
        },
        None => (BoxMakeWriter::new(std::io::stderr), None, stderr_is_terminal()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer);

    if subscriber.try_init().is_err() {
        return TelemetryGuard::disabled();
    }

    if let Some((path, err)) = open_failure {
        tracing::warn!(path = %path, error = %err, "failed to open log file; logging to stderr");
    }

    TelemetryGuard { _guard: guard }
}

fn stderr_is_terminal() -> bool {
    std::io::stderr().is_terminal()
}
