use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use which::which;

use crate::config::DatabaseDumpConfig;
use crate::core::retention::format_mb;
use crate::logging::RunLog;

fn find_dump_executable(program: &str) -> Result<PathBuf, String> {
    which(program).map_err(|e| format!("Database dump program {program} not found: {e}"))
}

/// Runs the configured dump tool with its stdout redirected into `destination`.
///
/// Blocking; the archive builder calls this from its worker thread.
/// Returns the size of the dump in bytes.
pub fn dump_database(
    config: &DatabaseDumpConfig,
    destination: &Path,
    log: &RunLog,
) -> Result<u64, String> {
    let program = find_dump_executable(&config.program)?;
    log.log(format!("Dumping database with {}", program.display()));

    let file = File::create(destination)
        .map_err(|e| format!("Cannot create {}: {e}", destination.display()))?;

    let output = Command::new(&program)
        .args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| format!("Failed to execute {}: {e}", program.display()))?;

    if !output.status.success() {
        return Err(format!(
            "Database dump failed with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let bytes = std::fs::metadata(destination)
        .map_err(|e| format!("Cannot read {}: {e}", destination.display()))?
        .len();
    log.log(format!("Database dump complete ({})", format_mb(bytes)));
    Ok(bytes)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> DatabaseDumpConfig {
        DatabaseDumpConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            file_name: "database.sql".into(),
        }
    }

    #[test]
    fn stdout_becomes_the_dump_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("database.sql");
        let log = RunLog::buffered();

        let bytes = dump_database(&shell("printf 'CREATE TABLE t;'"), &dest, &log).unwrap();

        assert_eq!(bytes, 15);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "CREATE TABLE t;");
        assert!(log.contents().contains("Database dump complete"));
    }

    #[test]
    fn failure_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("database.sql");

        let err = dump_database(
            &shell("echo 'access denied for user' >&2; exit 2"),
            &dest,
            &RunLog::buffered(),
        )
        .unwrap_err();

        assert!(err.contains("access denied for user"), "{err}");
    }

    #[test]
    fn missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseDumpConfig {
            program: "no-such-dump-tool-91c2".into(),
            args: Vec::new(),
            file_name: "database.sql".into(),
        };
        let err = dump_database(&config, &dir.path().join("db.sql"), &RunLog::buffered())
            .unwrap_err();
        assert!(err.contains("not found"));
    }
}
