use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::FailureKind;

const PREFIX_ROOT: &str = "remote-backup-";
const ARCHIVE_SUFFIX: &str = ".zip";
/// Sorts lexicographically in chronological order.
pub const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

static ARCHIVE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^remote-backup-(.+)-(\d{8}-\d{6})\.zip$").unwrap()
});

/// Name prefix that scopes every remote file of a job.
pub fn prefix(job_id: &str) -> String {
    format!("{PREFIX_ROOT}{job_id}-")
}

/// `remote-backup-<job id>-<YYYYMMDD-HHMMSS>.zip`, timestamp in UTC.
pub fn archive_file_name(job_id: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        prefix(job_id),
        created_at.format(ARCHIVE_TIMESTAMP_FORMAT),
        ARCHIVE_SUFFIX
    )
}

/// Recovers the job id and creation time from an archive file name.
pub fn parse_archive_name(name: &str) -> Option<(String, DateTime<Utc>)> {
    let caps = ARCHIVE_NAME.captures(name)?;
    let job_id = caps.get(1)?.as_str().to_string();
    let naive = NaiveDateTime::parse_from_str(caps.get(2)?.as_str(), ARCHIVE_TIMESTAMP_FORMAT).ok()?;
    Some((job_id, Utc.from_utc_datetime(&naive)))
}

/// Local working directory owned by one job during a run.
pub fn job_dir(work_dir: &Path, job_id: &str) -> PathBuf {
    work_dir.join(job_id)
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A recent successful run was reused because of the repeat limit.
    Skipped,
    Completed,
    Failed(FailureKind),
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Skipped => "skipped",
            RunOutcome::Completed => "completed",
            RunOutcome::Failed(kind) => kind.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "skipped" => Some(RunOutcome::Skipped),
            "completed" => Some(RunOutcome::Completed),
            other => FailureKind::parse(other).map(RunOutcome::Failed),
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one job execution, appended to the job's run history.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    /// Time used for repeat-limit comparisons; inherited from the reused run on a skip.
    pub effective_date: DateTime<Utc>,
    /// Empty when no archive was produced.
    pub archive_name: String,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub log_text: String,
}

impl RunRecord {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Who started a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    CommandLine { user: String },
    Web { remote_addr: String },
}

/// A file on a listable storage target, as seen during one retention pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub modified_at: DateTime<Utc>,
    /// Fetched lazily; only the size-budget pass needs it.
    pub size: Option<u64>,
}
