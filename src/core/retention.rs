//! Pruning of old backups on a listable storage target.
//!
//! A pass lists the files of one job (by prefix), decides which ones to keep
//! under one budget and deletes the rest, oldest first. Passes are independent;
//! the orchestrator runs the configured ones in the order age, count, size and
//! each pass lists again, so it sees what the previous pass left behind.
//!
//! Deletion is best effort: a file that cannot be deleted is logged and the
//! pass moves on.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use tracing::{debug, warn};

use crate::config::RetentionSettings;
use crate::core::models::RemoteFile;
use crate::core::storage::ListableStorage;
use crate::error::{RetentionError, StorageError};
use crate::logging::RunLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Delete files modified before the cutoff.
    KeepNewer(DateTime<Utc>),
    /// Keep the newest `n` files.
    KeepCount(usize),
    /// Keep the newest files whose cumulative size fits in the budget.
    KeepSizeBudget(u64),
}

impl RetentionPolicy {
    /// The configured passes in execution order: age, count, size. A value
    /// of `0` leaves its pass off.
    pub fn from_settings(settings: &RetentionSettings, now: DateTime<Utc>) -> Vec<Self> {
        let mut policies = Vec::new();
        if let Some(days) = settings.keep_days.filter(|d| *d > 0) {
            let days = i64::try_from(days).unwrap_or(i64::MAX);
            let cutoff = Duration::try_days(days)
                .and_then(|d| now.checked_sub_signed(d))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            policies.push(Self::KeepNewer(cutoff));
        }
        if let Some(count) = settings.keep_count.filter(|n| *n > 0) {
            policies.push(Self::KeepCount(count));
        }
        if let Some(bytes) = settings.keep_size_bytes.filter(|b| *b > 0) {
            policies.push(Self::KeepSizeBudget(bytes));
        }
        policies
    }

    fn label(&self) -> &'static str {
        match self {
            Self::KeepNewer(_) => "Deleting by date",
            Self::KeepCount(_) => "Deleting by number",
            Self::KeepSizeBudget(_) => "Deleting by size",
        }
    }
}

/// Result of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    /// Files matching the prefix when the pass started.
    pub examined: usize,
    /// Files the policy retained.
    pub kept: usize,
    /// Total size of the retained files.
    pub kept_bytes: u64,
    /// Ids deleted successfully, oldest first.
    pub deleted: Vec<String>,
    /// Ids the policy selected but the storage refused to delete.
    pub failed: Vec<String>,
}

/// Which files a policy keeps and which it deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: Vec<RemoteFile>,
    /// Oldest first.
    pub delete: Vec<RemoteFile>,
}

fn oldest_first(a: &RemoteFile, b: &RemoteFile) -> Ordering {
    a.modified_at
        .cmp(&b.modified_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Every file older than `cutoff` goes, regardless of listing order.
pub fn plan_keep_newer(mut files: Vec<RemoteFile>, cutoff: DateTime<Utc>) -> RetentionPlan {
    files.sort_by(oldest_first);
    let (delete, keep): (Vec<_>, Vec<_>) =
        files.into_iter().partition(|f| f.modified_at < cutoff);
    RetentionPlan { keep, delete }
}

pub fn plan_keep_count(mut files: Vec<RemoteFile>, count: usize) -> RetentionPlan {
    files.sort_by(oldest_first);
    let excess = files.len().saturating_sub(count);
    let keep = files.split_off(excess);
    RetentionPlan {
        keep,
        delete: files,
    }
}

/// Walks newest to oldest adding sizes; once the running total exceeds the
/// budget every remaining file is deleted. Unknown sizes count as zero, so
/// callers must fill in sizes at least up to the first file over budget.
pub fn plan_keep_size(mut files: Vec<RemoteFile>, budget: u64) -> RetentionPlan {
    files.sort_by(|a, b| oldest_first(b, a));

    let mut running: u64 = 0;
    let mut keep = Vec::new();
    let mut delete = Vec::new();
    for file in files {
        running = running.saturating_add(file.size.unwrap_or(0));
        if running > budget {
            delete.push(file);
        } else {
            keep.push(file);
        }
    }
    delete.reverse();
    RetentionPlan { keep, delete }
}

/// Runs one retention pass against `storage`.
pub async fn apply(
    storage: &mut dyn ListableStorage,
    prefix: &str,
    policy: RetentionPolicy,
    log: &RunLog,
) -> Result<RetentionSummary, RetentionError> {
    let label = policy.label();
    match policy {
        RetentionPolicy::KeepNewer(cutoff) => log.log(format!(
            "{label}: Keeping files newer than {} (prefix: {prefix}).",
            cutoff.to_rfc2822()
        )),
        RetentionPolicy::KeepCount(n) => {
            log.log(format!("{label}: Keeping {n} files (prefix: {prefix})."))
        }
        RetentionPolicy::KeepSizeBudget(bytes) => log.log(format!(
            "{label}: Keeping {} of (newest) backup data (prefix: {prefix}).",
            format_mb(bytes)
        )),
    }

    let files = list(storage, prefix).await?;
    let examined = files.len();

    let mut plan = match policy {
        RetentionPolicy::KeepNewer(cutoff) => plan_keep_newer(files, cutoff),
        RetentionPolicy::KeepCount(n) => {
            let plan = plan_keep_count(files, n);
            if plan.delete.is_empty() {
                log.log(format!(
                    "{label}: Nothing to delete. {examined} files on server."
                ));
            } else {
                log.log(format!(
                    "{label}: Deleting the {} oldest of {examined} files.",
                    plan.delete.len()
                ));
            }
            plan
        }
        RetentionPolicy::KeepSizeBudget(budget) => {
            let files = fill_sizes(storage, prefix, files, budget).await?;
            plan_keep_size(files, budget)
        }
    };

    let kept_bytes = kept_size(storage, prefix, &mut plan.keep).await?;
    let mut summary = RetentionSummary {
        examined,
        kept: plan.keep.len(),
        kept_bytes,
        ..Default::default()
    };

    for file in plan.delete {
        match policy {
            RetentionPolicy::KeepNewer(_) => log.log(format!(
                "{label}: Deleting {} ({})",
                file.id,
                file.modified_at.to_rfc2822()
            )),
            _ => log.log(format!("{label}: Deleting {}", file.id)),
        }

        match storage.delete(&file.id).await {
            Ok(()) => summary.deleted.push(file.id),
            Err(e) => {
                warn!(file = %file.id, error = %e, "Retention delete failed");
                log.log(format!("{label}: Could not delete {}: {e}", file.id));
                summary.failed.push(file.id);
            }
        }
    }

    log.log(format!(
        "{label}: Kept {} files with {} of backup data.",
        summary.kept,
        format_mb(summary.kept_bytes)
    ));
    debug!(
        prefix,
        examined = summary.examined,
        kept = summary.kept,
        kept_bytes = summary.kept_bytes,
        deleted = summary.deleted.len(),
        failed = summary.failed.len(),
        "Retention pass finished"
    );

    Ok(summary)
}

async fn list(
    storage: &mut dyn ListableStorage,
    prefix: &str,
) -> Result<Vec<RemoteFile>, RetentionError> {
    let listing_error = |source: StorageError| RetentionError::Listing {
        prefix: prefix.to_string(),
        source,
    };

    let ids = storage.find(prefix).await.map_err(listing_error)?;
    let mut files = Vec::with_capacity(ids.len());
    for id in ids {
        let modified_at = storage.modified_at(&id).await.map_err(listing_error)?;
        files.push(RemoteFile {
            id,
            modified_at,
            size: None,
        });
    }
    Ok(files)
}

/// Fetches sizes newest first, stopping once the budget is exceeded: older
/// files are deleted whatever their size.
async fn fill_sizes(
    storage: &mut dyn ListableStorage,
    prefix: &str,
    mut files: Vec<RemoteFile>,
    budget: u64,
) -> Result<Vec<RemoteFile>, RetentionError> {
    files.sort_by(|a, b| oldest_first(b, a));

    let mut running: u64 = 0;
    for file in files.iter_mut() {
        if running > budget {
            break;
        }
        let size = storage
            .size(&file.id)
            .await
            .map_err(|source| RetentionError::Listing {
                prefix: prefix.to_string(),
                source,
            })?;
        running = running.saturating_add(size);
        file.size = Some(size);
    }
    Ok(files)
}

/// Sums the sizes of the kept files, fetching the ones the plan never needed.
async fn kept_size(
    storage: &mut dyn ListableStorage,
    prefix: &str,
    files: &mut [RemoteFile],
) -> Result<u64, RetentionError> {
    let mut total: u64 = 0;
    for file in files.iter_mut() {
        let size = match file.size {
            Some(size) => size,
            None => {
                let size = storage
                    .size(&file.id)
                    .await
                    .map_err(|source| RetentionError::Listing {
                        prefix: prefix.to_string(),
                        source,
                    })?;
                file.size = Some(size);
                size
            }
        };
        total = total.saturating_add(size);
    }
    Ok(total)
}

pub fn format_mb(bytes: u64) -> String {
    format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
}
