use chrono::{TimeZone, Utc};
use remote_backup::config::{DatabaseDumpConfig, JobConfig, StorageTarget};
use remote_backup::core::{ArchiveBuilder, ZipArchiveBuilder};
use remote_backup::logging::RunLog;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

struct Site {
    _dir: tempfile::TempDir,
    root: PathBuf,
    work_dir: PathBuf,
}

/// A site with the backup work directory nested inside an included folder.
fn site() -> Site {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("site");
    let uploads = root.join("uploads");
    let work_dir = uploads.join(".remote-backup");

    std::fs::create_dir_all(uploads.join("cache")).unwrap();
    std::fs::create_dir_all(&work_dir).unwrap();
    std::fs::write(root.join("index.php"), b"<?php echo 1;").unwrap();
    std::fs::write(root.join("config.php"), b"secret").unwrap();
    std::fs::write(uploads.join("photo.jpg"), vec![1u8; 2048]).unwrap();
    std::fs::write(uploads.join(".htaccess"), b"deny from all").unwrap();
    std::fs::write(uploads.join("cache").join("thumb.jpg"), b"thumb").unwrap();
    std::fs::write(work_dir.join("stale.zip"), b"old").unwrap();

    Site {
        _dir: dir,
        root,
        work_dir,
    }
}

fn job(include: &[&str], exclude: &[&str]) -> JobConfig {
    let mut job = JobConfig::new(
        "1",
        StorageTarget::Directory {
            path: "/unused".into(),
            create: false,
        },
    );
    job.include = include.iter().map(|s| s.to_string()).collect();
    job.exclude = exclude.iter().map(|s| s.to_string()).collect();
    job
}

fn dump(script: &str) -> DatabaseDumpConfig {
    DatabaseDumpConfig {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        file_name: "database.sql".into(),
    }
}

fn entries(archive: &Path) -> Vec<String> {
    let zip = zip::ZipArchive::new(File::open(archive).unwrap()).unwrap();
    zip.file_names().map(String::from).collect()
}

fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn archives_includes_minus_excludes_and_work_dir() {
    let site = site();
    let builder = ZipArchiveBuilder::new(&site.root, &site.work_dir);
    let created = Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap();
    let log = RunLog::buffered();

    let archive = builder
        .build(&job(&["index.php", "uploads"], &["uploads/cache"]), created, &log)
        .await
        .unwrap();

    assert_eq!(
        archive,
        site.work_dir.join("1").join("remote-backup-1-20240601-030000.zip")
    );

    let files: BTreeSet<String> = entries(&archive)
        .into_iter()
        .filter(|name| !name.ends_with('/'))
        .collect();
    let expected: BTreeSet<String> = ["index.php", "uploads/.htaccess", "uploads/photo.jpg"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(files, expected);
    assert!(log.contents().contains("Added 3 files to archive"));

    // Only the finished archive is left behind.
    assert_eq!(
        dir_listing(&site.work_dir.join("1")),
        vec!["remote-backup-1-20240601-030000.zip"]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn database_dump_is_the_first_entry_and_is_cleaned_up() {
    let site = site();
    let builder = ZipArchiveBuilder::new(&site.root, &site.work_dir);
    let mut job = job(&["index.php"], &[]);
    job.database = Some(dump("echo 'CREATE TABLE pages (id int);'"));

    let archive = builder
        .build(&job, Utc::now(), &RunLog::buffered())
        .await
        .unwrap();

    let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
    assert_eq!(zip.len(), 2);
    let mut first = zip.by_index(0).unwrap();
    assert_eq!(first.name(), "database.sql");
    let mut sql = String::new();
    std::io::Read::read_to_string(&mut first, &mut sql).unwrap();
    assert_eq!(sql, "CREATE TABLE pages (id int);\n");

    assert!(!site.work_dir.join("1").join("database.sql").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn failed_dump_leaves_nothing_behind() {
    let site = site();
    let builder = ZipArchiveBuilder::new(&site.root, &site.work_dir);
    let mut job = job(&["index.php"], &[]);
    job.database = Some(dump("echo 'connection refused' >&2; exit 1"));

    let err = builder
        .build(&job, Utc::now(), &RunLog::buffered())
        .await
        .unwrap_err();

    assert_eq!(err.errors.len(), 1);
    assert!(err.errors[0].contains("connection refused"));
    assert!(dir_listing(&site.work_dir.join("1")).is_empty());
}

#[tokio::test]
async fn missing_include_paths_are_all_reported() {
    let site = site();
    let builder = ZipArchiveBuilder::new(&site.root, &site.work_dir);

    let err = builder
        .build(
            &job(&["index.php", "missing", "also-missing"], &[]),
            Utc::now(),
            &RunLog::buffered(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.errors.len(), 2);
    assert!(err.errors.iter().all(|e| e.starts_with("Include path not found")));
    assert!(dir_listing(&site.work_dir.join("1")).is_empty());
}

#[tokio::test]
async fn leftover_archives_are_reported_not_deleted() {
    let site = site();
    let job_dir = site.work_dir.join("1");
    std::fs::create_dir_all(&job_dir).unwrap();
    std::fs::write(job_dir.join("remote-backup-1-20240101-000000.zip"), b"old").unwrap();

    let builder = ZipArchiveBuilder::new(&site.root, &site.work_dir);
    let log = RunLog::buffered();
    builder
        .build(
            &job(&["index.php"], &[]),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            &log,
        )
        .await
        .unwrap();

    assert!(log
        .contents()
        .contains("still present: remote-backup-1-20240101-000000.zip"));
    assert_eq!(
        dir_listing(&job_dir),
        vec![
            "remote-backup-1-20240101-000000.zip",
            "remote-backup-1-20240201-000000.zip"
        ]
    );
}

#[tokio::test]
async fn existing_archive_with_the_same_name_is_not_replaced() {
    let site = site();
    let job_dir = site.work_dir.join("1");
    std::fs::create_dir_all(&job_dir).unwrap();
    let existing = job_dir.join("remote-backup-1-20240201-000000.zip");
    std::fs::write(&existing, b"not yet uploaded").unwrap();

    let builder = ZipArchiveBuilder::new(&site.root, &site.work_dir);
    let err = builder
        .build(
            &job(&["index.php"], &[]),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
            &RunLog::buffered(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.errors.len(), 1);
    assert!(err.errors[0].contains("already exists"));
    assert_eq!(std::fs::read(&existing).unwrap(), b"not yet uploaded");
    assert_eq!(
        dir_listing(&job_dir),
        vec!["remote-backup-1-20240201-000000.zip"]
    );
}
