//! Subscriber setup for binaries embedding the driver runtime.
//!
//! The library itself only emits `tracing` events (pool lifecycle, retry
//! attempts, keep-alive transitions); `dbdriver` installs a subscriber here.
//! Events go to `$XDG_STATE_HOME/dbdriver/dbdriver.log`, or to stderr when
//! the state dir cannot be used.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Pool and retry internals at debug, everything else at info. `RUST_LOG` wins.
const DEFAULT_FILTER: &str = "info,dbdriver_core=debug";

/// Per-event writer: a handle to the shared log file, or stderr if the
/// handle could not be duplicated.
enum EventSink {
    File(File),
    Stderr,
}

impl Write for EventSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EventSink::File(f) => f.write(buf),
            EventSink::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EventSink::File(f) => f.flush(),
            EventSink::Stderr => io::stderr().lock().flush(),
        }
    }
}

/// Hands out one [`EventSink`] per event over an append-mode log file.
struct LogFile(File);

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = EventSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.0
            .try_clone()
            .map(EventSink::File)
            .unwrap_or(EventSink::Stderr)
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Where `init_logging` writes.
pub fn log_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dbdriver")?;
    Ok(xdg_dirs.get_state_home().join("dbdriver.log"))
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// Install the file subscriber. An `Err` leaves no subscriber installed so
/// the caller can fall back to [`init_logging_stderr`].
pub fn init_logging() -> Result<()> {
    let path = log_path()?;
    let file = open_log(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(BoxMakeWriter::new(LogFile(file)))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))?;

    tracing::info!(path = %path.display(), "dbdriver logging to file");
    Ok(())
}

/// Install a stderr-only subscriber. Never fails; a subscriber that is
/// already installed is left in place.
pub fn init_logging_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_under_dbdriver_state_dir() {
        // xdg needs $HOME; skip where the environment has none.
        if let Ok(path) = log_path() {
            assert!(path.ends_with("dbdriver/dbdriver.log"), "{}", path.display());
        }
    }

    #[test]
    fn log_file_writer_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dbdriver.log");
        let sink = LogFile(open_log(&path).unwrap());

        sink.make_writer().write_all(b"first\n").unwrap();
        sink.make_writer().write_all(b"second\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }
}
