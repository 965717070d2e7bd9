use anyhow::{Context, Result};
use std::path::Path;
use tokio_rusqlite::{Connection, rusqlite};

use crate::core::models::RunRecord;

pub mod runs;

/// Durable, append-only run history of every job.
#[derive(Clone)]
pub struct RunHistory {
    conn: Connection,
}

impl RunHistory {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .await
            .with_context(|| format!("Failed to open run history at {}", path.display()))?;
        Self::init(conn).await
    }

    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            let schema = include_str!("schema.sql");
            conn.execute_batch(schema)?;
            Ok::<(), rusqlite::Error>(())
        })
        .await?;

        Ok(Self { conn })
    }

    pub async fn append(&self, record: &RunRecord) -> Result<()> {
        runs::append(&self.conn, record.clone()).await
    }

    /// Most recent attempt of the job, successful or not.
    pub async fn last(&self, job_id: &str) -> Result<Option<RunRecord>> {
        runs::last(&self.conn, job_id.to_string()).await
    }

    /// Every attempt of the job, oldest first.
    pub async fn list(&self, job_id: &str) -> Result<Vec<RunRecord>> {
        runs::list(&self.conn, job_id.to_string()).await
    }
}
