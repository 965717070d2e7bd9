//! Archive creation.
//!
//! The archive is written into a temporary file inside the job directory and
//! only renamed to its final `remote-backup-<id>-<timestamp>.zip` name when
//! every file was added. An existing archive of the same name is never
//! replaced. On any error the temporary file and the loose
//! database dump are removed and all collected problems are returned together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::JobConfig;
use crate::core::dump;
use crate::core::models::{archive_file_name, job_dir, parse_archive_name};
use crate::error::BuildError;
use crate::logging::RunLog;

#[async_trait]
pub trait ArchiveBuilder: Send + Sync {
    /// Builds the archive for `job` and returns its local path.
    async fn build(
        &self,
        job: &JobConfig,
        created_at: DateTime<Utc>,
        log: &RunLog,
    ) -> Result<PathBuf, BuildError>;
}

/// Zip archive of an optional database dump plus the job's include paths.
#[derive(Debug, Clone)]
pub struct ZipArchiveBuilder {
    site_root: PathBuf,
    work_dir: PathBuf,
}

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

impl ZipArchiveBuilder {
    pub fn new(site_root: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            site_root: site_root.into(),
            work_dir: work_dir.into(),
        }
    }

    fn build_blocking(
        &self,
        job: &JobConfig,
        created_at: DateTime<Utc>,
        log: &RunLog,
    ) -> Result<PathBuf, BuildError> {
        let job_dir = job_dir(&self.work_dir, &job.id);
        std::fs::create_dir_all(&job_dir).map_err(|e| {
            BuildError::single(format!("Cannot create {}: {e}", job_dir.display()))
        })?;
        report_leftovers(&job_dir, &job.id, log);

        let name = archive_file_name(&job.id, created_at);
        let archive_path = job_dir.join(&name);
        if archive_path.exists() {
            return Err(already_exists(&name));
        }
        log.log(format!("Creating archive: {name}"));

        let dump_file = match &job.database {
            Some(db) => {
                let path = job_dir.join(&db.file_name);
                if let Err(e) = dump::dump_database(db, &path, log) {
                    remove_quietly(&path);
                    return Err(BuildError::single(e));
                }
                Some((path, db.file_name.as_str()))
            }
            None => None,
        };

        let result = self.write_archive(job, &job_dir, dump_file.as_ref(), &archive_path);
        if let Some((path, _)) = &dump_file {
            remove_quietly(path);
        }

        let files = result?;
        log.log(format!("Added {files} files to archive"));
        Ok(archive_path)
    }

    fn write_archive(
        &self,
        job: &JobConfig,
        job_dir: &Path,
        dump: Option<&(PathBuf, &str)>,
        archive_path: &Path,
    ) -> Result<usize, BuildError> {
        let mut temp = NamedTempFile::new_in(job_dir)
            .map_err(|e| BuildError::single(format!("Cannot create temporary archive: {e}")))?;

        let mut errors = Vec::new();
        let mut files = 0;
        {
            let mut zip = ZipWriter::new(temp.as_file_mut());
            let mut names = HashSet::new();

            if let Some((path, name)) = dump {
                match add_file(&mut zip, path, name) {
                    Ok(()) => {
                        names.insert(name.to_string());
                        files += 1;
                    }
                    Err(e) => errors.push(e),
                }
            }

            match self.site_root.canonicalize() {
                Ok(root) => {
                    let excluded = self.excluded_paths(job, &root);
                    for include in &job.include {
                        files += collect(
                            &mut zip,
                            &root,
                            include,
                            &excluded,
                            &mut names,
                            &mut errors,
                        );
                    }
                }
                Err(e) if !job.include.is_empty() => errors.push(format!(
                    "Site root {} is not accessible: {e}",
                    self.site_root.display()
                )),
                Err(_) => {}
            }

            if errors.is_empty() {
                if let Err(e) = zip.finish() {
                    errors.push(format!("Cannot finish archive: {e}"));
                }
            }
        }

        if !errors.is_empty() {
            // Dropping the temporary file deletes it.
            return Err(BuildError::new(errors));
        }

        temp.persist_noclobber(archive_path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                already_exists(&file_name_of(archive_path))
            } else {
                BuildError::single(format!(
                    "Cannot move archive into place at {}: {}",
                    archive_path.display(),
                    e.error
                ))
            }
        })?;
        Ok(files)
    }

    /// Configured excludes plus the whole work directory, so a run never
    /// archives its own temporary files.
    fn excluded_paths(&self, job: &JobConfig, root: &Path) -> Vec<PathBuf> {
        let mut excluded: Vec<PathBuf> = job
            .exclude
            .iter()
            .map(|e| root.join(e.trim_start_matches('/')))
            .collect();
        excluded.push(
            self.work_dir
                .canonicalize()
                .unwrap_or_else(|_| self.work_dir.clone()),
        );
        excluded
    }
}

#[async_trait]
impl ArchiveBuilder for ZipArchiveBuilder {
    async fn build(
        &self,
        job: &JobConfig,
        created_at: DateTime<Utc>,
        log: &RunLog,
    ) -> Result<PathBuf, BuildError> {
        let builder = self.clone();
        let job = job.clone();
        let log = log.clone();

        tokio::task::spawn_blocking(move || builder.build_blocking(&job, created_at, &log))
            .await
            .map_err(|e| BuildError::single(format!("Archive task failed: {e}")))?
    }
}

/// Adds everything below `root/include` that is not excluded. Returns the
/// number of files added; problems are pushed onto `errors`.
fn collect<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    root: &Path,
    include: &str,
    excluded: &[PathBuf],
    names: &mut HashSet<String>,
    errors: &mut Vec<String>,
) -> usize {
    let start = root.join(include.trim_start_matches('/'));
    if !start.exists() {
        errors.push(format!("Include path not found: {}", start.display()));
        return 0;
    }

    let mut added = 0;
    let walker = WalkDir::new(&start)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !excluded.iter().any(|x| entry.path().starts_with(x)));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(format!("Cannot read {include}: {e}"));
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = path.strip_prefix(root).ok().and_then(entry_name) else {
            continue;
        };
        if !names.insert(name.clone()) {
            continue;
        }

        if entry.file_type().is_dir() {
            if let Err(e) = zip.add_directory(format!("{name}/"), file_options()) {
                errors.push(format!("Cannot add {name}/: {e}"));
            }
        } else if path.is_file() {
            match add_file(zip, path, &name) {
                Ok(()) => added += 1,
                Err(e) => errors.push(e),
            }
        } else {
            debug!(path = %path.display(), "Skipping entry that is not a regular file");
        }
    }
    added
}

fn add_file<W: Write + Seek>(zip: &mut ZipWriter<W>, path: &Path, name: &str) -> Result<(), String> {
    let mut file = File::open(path).map_err(|e| format!("Cannot read {}: {e}", path.display()))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let options = file_options().large_file(size >= u64::from(u32::MAX));

    zip.start_file(name, options)
        .map_err(|e| format!("Cannot add {name}: {e}"))?;
    io::copy(&mut file, zip).map_err(|e| format!("Cannot add {name}: {e}"))?;
    Ok(())
}

/// Archive member name: relative path with `/` separators.
fn entry_name(relative: &Path) -> Option<String> {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn report_leftovers(job_dir: &Path, job_id: &str, log: &RunLog) {
    let Ok(entries) = std::fs::read_dir(job_dir) else {
        return;
    };
    let mut leftovers: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| parse_archive_name(name).is_some_and(|(id, _)| id == job_id))
        .collect();
    leftovers.sort();

    for name in leftovers {
        warn!(job_id, archive = %name, "Archive from an earlier run was never uploaded");
        log.log(format!("Archive from an earlier run is still present: {name}"));
    }
}

fn already_exists(name: &str) -> BuildError {
    BuildError::single(format!(
        "Archive {name} already exists and is kept for a manual retry"
    ))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}
