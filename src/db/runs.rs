use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::models::{RunOutcome, RunRecord};

const COLUMNS: &str =
    "id, job_id, started_at, effective_date, archive_name, outcome, error, log_text";

/// A `runs` row as stored, before timestamps and outcome are parsed.
struct RunRow {
    id: String,
    job_id: String,
    started_at: String,
    effective_date: String,
    archive_name: String,
    outcome: String,
    error: Option<String>,
    log_text: String,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            job_id: row.get(1)?,
            started_at: row.get(2)?,
            effective_date: row.get(3)?,
            archive_name: row.get(4)?,
            outcome: row.get(5)?,
            error: row.get(6)?,
            log_text: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        let outcome = RunOutcome::parse(&self.outcome)
            .ok_or_else(|| anyhow!("Unknown outcome {:?} in run {}", self.outcome, self.id))?;

        Ok(RunRecord {
            started_at: parse_timestamp(&self.started_at)?,
            effective_date: parse_timestamp(&self.effective_date)?,
            id: self.id,
            job_id: self.job_id,
            archive_name: self.archive_name,
            outcome,
            error: self.error,
            log_text: self.log_text,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow!("Invalid timestamp {:?}: {}", value, e))?
        .with_timezone(&Utc))
}

pub async fn append(conn: &Connection, record: RunRecord) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "INSERT INTO runs (id, job_id, started_at, effective_date, archive_name, outcome, error, log_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.job_id,
                record.started_at.to_rfc3339(),
                record.effective_date.to_rfc3339(),
                record.archive_name,
                record.outcome.as_str(),
                record.error,
                record.log_text
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn last(conn: &Connection, job_id: String) -> Result<Option<RunRecord>> {
    let row = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {COLUMNS} FROM runs WHERE job_id = ?1 ORDER BY seq DESC LIMIT 1"
            ))?;
            let mut rows = stmt.query_map(params![job_id], RunRow::from_row)?;
            let row = rows.next().transpose()?;
            Ok::<_, rusqlite::Error>(row)
        })
        .await
        .map_err(|e| anyhow!("Failed to read last run: {}", e))?;

    row.map(RunRow::into_record).transpose()
}

pub async fn list(conn: &Connection, job_id: String) -> Result<Vec<RunRecord>> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {COLUMNS} FROM runs WHERE job_id = ?1 ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map(params![job_id], RunRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })
        .await
        .map_err(|e| anyhow!("Failed to list runs: {}", e))?;

    rows.into_iter().map(RunRow::into_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RunHistory;
    use crate::error::FailureKind;
    use chrono::{Duration, TimeZone};

    fn record(job_id: &str, hour: u32, outcome: RunOutcome) -> RunRecord {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap();
        RunRecord {
            id: uuid::Uuid::now_v7().to_string(),
            job_id: job_id.to_string(),
            started_at: at,
            effective_date: at,
            archive_name: format!("remote-backup-{job_id}-20240301-{hour:02}0000.zip"),
            outcome,
            error: match outcome {
                RunOutcome::Failed(_) => Some("could not connect: refused".into()),
                _ => None,
            },
            log_text: "2024-03-01 00:00:00 Backup complete.\n".into(),
        }
    }

    #[tokio::test]
    async fn last_returns_the_latest_append() {
        let history = RunHistory::in_memory().await.unwrap();
        assert!(history.last("1").await.unwrap().is_none());

        let first = record("1", 1, RunOutcome::Completed);
        let second = record("1", 2, RunOutcome::Failed(FailureKind::Connect));
        history.append(&first).await.unwrap();
        history.append(&second).await.unwrap();
        history.append(&record("2", 3, RunOutcome::Completed)).await.unwrap();

        assert_eq!(history.last("1").await.unwrap(), Some(second.clone()));
        assert_eq!(history.list("1").await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn insertion_order_wins_over_timestamps() {
        let history = RunHistory::in_memory().await.unwrap();
        let mut late = record("1", 9, RunOutcome::Completed);
        let early = record("1", 1, RunOutcome::Skipped);
        late.started_at += Duration::days(1);

        history.append(&late).await.unwrap();
        history.append(&early).await.unwrap();

        let last = history.last("1").await.unwrap().unwrap();
        assert_eq!(last.outcome, RunOutcome::Skipped);
        assert_eq!(last.effective_date, early.effective_date);
    }

    #[tokio::test]
    async fn history_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("history.db");

        let run = record("nightly", 4, RunOutcome::Completed);
        RunHistory::open(&path).await.unwrap().append(&run).await.unwrap();

        let reopened = RunHistory::open(&path).await.unwrap();
        assert_eq!(reopened.last("nightly").await.unwrap(), Some(run));
    }
}
