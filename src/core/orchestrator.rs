use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::core::archive::ArchiveBuilder;
use crate::core::lock::JobLock;
use crate::core::models::{self, RunOutcome, RunRecord, Trigger};
use crate::core::notifications::{Notification, NotificationChannel};
use crate::core::retention::{self, RetentionPolicy};
use crate::core::storage::{ListableStorage, StorageClient, StorageFactory};
use crate::db::RunHistory;
use crate::error::RunError;
use crate::logging::RunLog;

/// Drives one job execution: repeat check, build, upload with retention,
/// notification and the persisted run record.
pub struct BackupOrchestrator {
    history: RunHistory,
    builder: Arc<dyn ArchiveBuilder>,
    storage: Arc<dyn StorageFactory>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    work_dir: PathBuf,
}

impl BackupOrchestrator {
    pub fn new(
        history: RunHistory,
        builder: Arc<dyn ArchiveBuilder>,
        storage: Arc<dyn StorageFactory>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            history,
            builder,
            storage,
            notifier: None,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub async fn run(&self, job: &JobConfig, trigger: &Trigger, log: &RunLog) -> Result<RunRecord> {
        self.run_at(job, trigger, log, Utc::now()).await
    }

    /// Runs `job` as if started at `now`.
    ///
    /// Build, connect and upload failures end up in the returned record. An
    /// `Err` means nothing was recorded: the job is locked by another process
    /// ([`JobBusy`](crate::error::JobBusy)) or the history is unavailable.
    #[tracing::instrument(skip_all, fields(job_id = %job.id))]
    pub async fn run_at(
        &self,
        job: &JobConfig,
        trigger: &Trigger,
        log: &RunLog,
        now: DateTime<Utc>,
    ) -> Result<RunRecord> {
        let _lock = JobLock::acquire(&models::job_dir(&self.work_dir, &job.id), &job.id)?;

        log.log(format!("Starting backup job #{}", job.id));
        log_trigger(job, trigger, log);

        let last = self.history.last(&job.id).await?;

        let (archive_name, effective_date, result) = match reusable_run(job, last.as_ref(), now) {
            Some(previous) => {
                log.log(format!(
                    "There was a successful job within the set repeat limit of {} hours.",
                    job.repeat_limit_hours.unwrap_or_default()
                ));
                log.log("Aborting backup.");
                (previous.archive_name.clone(), previous.effective_date, None)
            }
            None => {
                let (archive_name, result) = self.build_and_upload(job, now, log).await;
                match &result {
                    Ok(()) => log.log("Backup complete."),
                    Err(e) => report_error(e, log),
                }
                self.notify(job, result.is_ok(), log).await;
                (archive_name, now, Some(result))
            }
        };

        let (outcome, error) = match result {
            None => (RunOutcome::Skipped, None),
            Some(Ok(())) => (RunOutcome::Completed, None),
            Some(Err(e)) => (RunOutcome::Failed(e.kind()), Some(e.to_string())),
        };

        let record = RunRecord {
            id: Uuid::now_v7().to_string(),
            job_id: job.id.clone(),
            started_at: now,
            effective_date,
            archive_name,
            outcome,
            error,
            log_text: log.contents(),
        };
        self.history.append(&record).await?;

        info!(
            outcome = %record.outcome,
            archive = %record.archive_name,
            "Run recorded"
        );
        Ok(record)
    }

    /// Connects to the job's storage target and disconnects again.
    pub async fn test_connection(&self, job: &JobConfig, log: &RunLog) -> Result<(), RunError> {
        let mut client = self.storage.create(&job.storage).map_err(RunError::Connect)?;
        log.log(format!("Connecting to: {}", client.describe()));

        let result = client.connect().await.map_err(RunError::Connect);
        if result.is_ok() {
            log.log("Connected");
            if client.as_listable().is_some() {
                log.log("Storage can list files; retention settings apply.");
            } else {
                log.log("Storage cannot list files; retention settings are ignored.");
            }
        }
        disconnect(job, client.as_mut(), log).await;

        match &result {
            Ok(()) => log.log("Connection test successful."),
            Err(e) => log.log(format!("Error: {e}")),
        }
        result
    }

    /// Returns the archive name (empty when the build failed) and the result.
    async fn build_and_upload(
        &self,
        job: &JobConfig,
        now: DateTime<Utc>,
        log: &RunLog,
    ) -> (String, Result<(), RunError>) {
        let archive = match self.builder.build(job, now, log).await {
            Ok(path) => path,
            Err(e) => return (String::new(), Err(e.into())),
        };
        let archive_name = file_name(&archive);

        let result = self.upload(job, &archive, now, log).await;
        (archive_name, result)
    }

    async fn upload(
        &self,
        job: &JobConfig,
        archive: &Path,
        now: DateTime<Utc>,
        log: &RunLog,
    ) -> Result<(), RunError> {
        let mut client = self.storage.create(&job.storage).map_err(RunError::Connect)?;
        log.log(format!("Connecting to: {}", client.describe()));

        let result = self.transfer(job, client.as_mut(), archive, now, log).await;
        disconnect(job, client.as_mut(), log).await;
        result
    }

    async fn transfer(
        &self,
        job: &JobConfig,
        client: &mut dyn StorageClient,
        archive: &Path,
        now: DateTime<Utc>,
        log: &RunLog,
    ) -> Result<(), RunError> {
        client.connect().await.map_err(RunError::Connect)?;
        log.log("Connected");

        if job.retention.is_configured() {
            match client.as_listable() {
                Some(listable) => prune(job, listable, now, log).await,
                None => log.log("Storage cannot list files; skipping retention."),
            }
        }

        if !tokio::fs::try_exists(archive).await.unwrap_or(false) {
            return Err(RunError::MissingArchive(archive.to_path_buf()));
        }

        let name = file_name(archive);
        log.log(format!("Uploading: {name}"));
        client.upload(archive).await.map_err(RunError::Upload)?;

        log.log(format!("Upload complete. Deleting file: {name}"));
        match tokio::fs::remove_file(archive).await {
            Ok(()) => log.log("File deleted."),
            Err(e) => {
                warn!(job_id = %job.id, archive = %name, error = %e, "Failed to delete uploaded archive");
                log.log(format!("Could not delete {name}: {e}"));
            }
        }
        Ok(())
    }

    async fn notify(&self, job: &JobConfig, success: bool, log: &RunLog) {
        let Some(recipient) = job.mail.to.as_deref().filter(|to| !to.trim().is_empty()) else {
            return;
        };
        let wanted = if success {
            job.mail.on_success
        } else {
            job.mail.on_failure
        };
        if !wanted {
            return;
        }
        let Some(notifier) = &self.notifier else {
            warn!(job_id = %job.id, "Notification requested but no channel is configured");
            log.log(format!("No notification channel configured; not sending log to {recipient}"));
            return;
        };

        let subject = if success {
            &job.mail.success_subject
        } else {
            &job.mail.failure_subject
        };
        let notification = Notification {
            job_id: job.id.clone(),
            recipient: recipient.to_string(),
            subject: subject.clone(),
            body: log.contents(),
            success,
        };

        match notifier.notify(&notification).await {
            Ok(()) => log.log(format!("Log mailed to {recipient}")),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Notification failed");
                log.log(format!("Could not send log to {recipient}: {e}"));
            }
        }
    }
}

/// The last run, if it succeeded recently enough to be reused.
fn reusable_run<'a>(
    job: &JobConfig,
    last: Option<&'a RunRecord>,
    now: DateTime<Utc>,
) -> Option<&'a RunRecord> {
    let hours = job.repeat_limit_hours.filter(|h| *h > 0)?;
    let limit = i64::try_from(hours).ok().and_then(Duration::try_hours)?;
    let last = last.filter(|record| !record.is_error())?;

    (now - last.effective_date < limit).then_some(last)
}

/// Age, count and size passes in that order; each sees what the previous left.
async fn prune(
    job: &JobConfig,
    storage: &mut dyn ListableStorage,
    now: DateTime<Utc>,
    log: &RunLog,
) {
    let prefix = models::prefix(&job.id);
    for policy in RetentionPolicy::from_settings(&job.retention, now) {
        match retention::apply(storage, &prefix, policy, log).await {
            Ok(summary) => debug!(
                job_id = %job.id,
                deleted = summary.deleted.len(),
                failed = summary.failed.len(),
                "Retention pass applied"
            ),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Retention pass failed");
                log.log(format!("Retention error: {e}"));
            }
        }
    }
}

async fn disconnect(job: &JobConfig, client: &mut dyn StorageClient, log: &RunLog) {
    log.log("Disconnecting.");
    if let Err(e) = client.disconnect().await {
        warn!(job_id = %job.id, error = %e, "Disconnect failed");
        log.log(format!("Disconnect failed: {e}"));
    }
}

fn log_trigger(job: &JobConfig, trigger: &Trigger, log: &RunLog) {
    match trigger {
        Trigger::CommandLine { user } => log.log(format!("Started from command line by {user}")),
        Trigger::Web { remote_addr } => {
            log.log(format!("Started from web interface by {remote_addr}"));
            match job.web.time_limit_secs {
                Some(secs) => log.log(format!("Time limit: {secs} seconds.")),
                None => log.log("No time limit."),
            }
            if job.web.ignore_user_abort {
                log.log("Run continues if the request is aborted.");
            }
        }
    }
}

fn report_error(error: &RunError, log: &RunLog) {
    match error {
        RunError::Build(build) => {
            log.log("Error: Could not create archive.");
            for cause in &build.errors {
                log.log(format!("Error: {cause}"));
            }
        }
        other => log.log(format!("Error: {other}")),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
