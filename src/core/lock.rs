use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::JobBusy;

const LOCK_FILE: &str = "run.lock";

/// Exclusive advisory lock on one job's working directory.
///
/// Held for the whole run; released when dropped. Other processes trying to
/// run the same job in the meantime get [`JobBusy`].
#[derive(Debug)]
pub struct JobLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl JobLock {
    pub fn acquire(job_dir: &Path, job_id: &str) -> Result<Self> {
        std::fs::create_dir_all(job_dir)
            .with_context(|| format!("Failed to create {}", job_dir.display()))?;

        let path = job_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!(job_id, path = %path.display(), "Acquired job lock");
                Ok(Self { _lock: lock, path })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(JobBusy {
                job_id: job_id.to_string(),
            }
            .into()),
            Err((_, errno)) => Err(std::io::Error::from(errno))
                .with_context(|| format!("Failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_job_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("1");

        let held = JobLock::acquire(&job_dir, "1").unwrap();
        assert!(held.path().exists());

        let err = JobLock::acquire(&job_dir, "1").unwrap_err();
        assert!(err.downcast_ref::<JobBusy>().is_some());

        drop(held);
        assert!(JobLock::acquire(&job_dir, "1").is_ok());
    }

    #[test]
    fn different_jobs_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = JobLock::acquire(&dir.path().join("a"), "a").unwrap();
        let _b = JobLock::acquire(&dir.path().join("b"), "b").unwrap();
    }
}
