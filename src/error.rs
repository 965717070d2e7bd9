//! Error types shared across the backup pipeline.
//!
//! Only [`RunError`] marks a run as failed. Retention and notification
//! errors are logged by the orchestrator and never recorded on the run.

use std::path::PathBuf;
use thiserror::Error;

/// Archive creation failed. Carries every underlying problem that was
/// collected while dumping the database and walking the include paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("archive build failed: {}", .errors.join("; "))]
pub struct BuildError {
    pub errors: Vec<String>,
}

impl BuildError {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }

    pub fn single(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
        }
    }
}

/// Failure reported by a storage client.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("not connected")]
    NotConnected,

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("verification failed for {0}: checksum mismatch")]
    Checksum(String),

    #[error("{0}")]
    Other(String),
}

/// Errors that abort a run and populate `RunRecord::error`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("could not connect: {0}")]
    Connect(#[source] StorageError),

    #[error("upload failed: {0}")]
    Upload(#[source] StorageError),

    #[error("nothing to upload: {} does not exist", .0.display())]
    MissingArchive(PathBuf),
}

impl RunError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::Build(_) => FailureKind::Build,
            RunError::Connect(_) => FailureKind::Connect,
            RunError::Upload(_) | RunError::MissingArchive(_) => FailureKind::Upload,
        }
    }
}

/// Which stage of a run failed; persisted alongside the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Build,
    Connect,
    Upload,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Connect => "connect",
            Self::Upload => "upload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "build" => Some(Self::Build),
            "connect" => Some(Self::Connect),
            "upload" => Some(Self::Upload),
            _ => None,
        }
    }
}

/// A retention pass could not list the remote files and was skipped.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("listing files with prefix {prefix} failed: {source}")]
    Listing {
        prefix: String,
        #[source]
        source: StorageError,
    },
}

/// Notification dispatch failed.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Another process holds the run lock for this job.
#[derive(Debug, Error)]
#[error("job {job_id} is already running")]
pub struct JobBusy {
    pub job_id: String,
}
