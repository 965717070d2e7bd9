use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use crate::core::storage::StorageClient;
use crate::error::StorageError;

/// Uploads by running an external program (rclone, scp, aws, ...).
///
/// `{file}` and `{name}` in the arguments are replaced with the archive path
/// and its file name. The program cannot list remote files, so retention is
/// never applied to this target.
pub struct CommandStorage {
    program: String,
    args: Vec<String>,
    resolved: Option<PathBuf>,
}

impl CommandStorage {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            resolved: None,
        }
    }

    fn expand_args(&self, path: &Path) -> Vec<String> {
        let file = path.display().to_string();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.args
            .iter()
            .map(|arg| arg.replace("{file}", &file).replace("{name}", &name))
            .collect()
    }
}

#[async_trait]
impl StorageClient for CommandStorage {
    fn describe(&self) -> String {
        format!("command {}", self.program)
    }

    /// Resolves the program on `PATH`; nothing is started yet.
    async fn connect(&mut self) -> Result<(), StorageError> {
        let resolved = which::which(&self.program)
            .map_err(|e| StorageError::Other(format!("{} not found: {e}", self.program)))?;
        self.resolved = Some(resolved);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), StorageError> {
        self.resolved = None;
        Ok(())
    }

    async fn upload(&mut self, path: &Path) -> Result<(), StorageError> {
        let program = self.resolved.as_ref().ok_or(StorageError::NotConnected)?;
        let args = self.expand_args(path);
        debug!(program = %program.display(), ?args, "Running upload command");

        let output = Command::new(program).args(&args).output().await?;
        if !output.status.success() {
            return Err(StorageError::Command {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
