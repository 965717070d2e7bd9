//! Logging for remote-backup.
//!
//! Two layers live here:
//! - process diagnostics through the `tracing` ecosystem (stderr, pretty or JSON);
//! - [`RunLog`], the human-readable, timestamped log of a single job run that is
//!   echoed to stdout, appended to a per-job file and kept in memory so it can be
//!   stored with the run record and mailed out.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Diagnostics go to stderr so they never interleave with the run log on stdout.
/// The log level can be overridden at runtime via the `RUST_LOG` environment variable.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "remote_backup={}",
            default_level.as_str().to_lowercase()
        ))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Format used for every run log line prefix.
pub const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamped log of one job run.
///
/// Clones share the same buffer, so the archive builder, the retention engine
/// and storage adapters can all write into the run they are part of.
#[derive(Clone)]
pub struct RunLog {
    inner: Arc<Mutex<RunLogInner>>,
}

struct RunLogInner {
    buffer: String,
    echo: bool,
    file: Option<File>,
}

impl RunLog {
    /// A log that only accumulates into memory.
    pub fn buffered() -> Self {
        Self::new(false)
    }

    /// A log that additionally writes each line to stdout when `echo` is set.
    pub fn new(echo: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunLogInner {
                buffer: String::new(),
                echo,
                file: None,
            })),
        }
    }

    /// Append every line to `path` as well, creating the file if needed.
    pub fn with_file(self, path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.lock().file = Some(file);
        Ok(self)
    }

    pub fn log(&self, message: impl AsRef<str>) {
        let line = format!(
            "{} {}\n",
            Local::now().format(LINE_TIMESTAMP_FORMAT),
            message.as_ref()
        );

        let mut inner = self.lock();
        if inner.echo {
            let mut stdout = io::stdout().lock();
            let _ = stdout.write_all(line.as_bytes());
            let _ = stdout.flush();
        }
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(error = %e, "Failed to write run log file");
            }
        }
        inner.buffer.push_str(&line);
    }

    /// Snapshot of everything logged so far.
    pub fn contents(&self) -> String {
        self.lock().buffer.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RunLogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("bytes", &self.lock().buffer.len())
            .finish()
    }
}
