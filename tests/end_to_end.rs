use chrono::{Duration, Utc};
use filetime::FileTime;
use remote_backup::config::{AppConfig, JobConfig, StorageTarget};
use remote_backup::context::AppContext;
use remote_backup::core::{RunOutcome, Trigger};
use remote_backup::db::RunHistory;
use remote_backup::logging::RunLog;
use std::fs::File;
use std::path::Path;

fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn nightly_job_against_a_directory_target() {
    let dir = tempfile::tempdir().unwrap();
    let site_root = dir.path().join("site");
    let target = dir.path().join("remote");
    std::fs::create_dir_all(site_root.join("templates")).unwrap();
    std::fs::write(site_root.join("templates").join("home.php"), b"<h1>home</h1>").unwrap();
    std::fs::create_dir_all(&target).unwrap();

    // Four earlier backups, one per day, the newest yesterday.
    let now = Utc::now();
    let mut previous = Vec::new();
    for days_ago in (1..=4).rev() {
        let name = format!("remote-backup-nightly-2024010{}-000000.zip", 5 - days_ago);
        let path = target.join(&name);
        std::fs::write(&path, b"old archive").unwrap();
        let mtime = now - Duration::days(days_ago);
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime.timestamp(), 0)).unwrap();
        previous.push(name);
    }

    let mut job = JobConfig::new(
        "nightly",
        StorageTarget::Directory {
            path: target.clone(),
            create: false,
        },
    );
    job.include = vec!["templates".into()];
    job.retention.keep_count = Some(2);
    job.repeat_limit_hours = Some(12);

    let config = AppConfig {
        work_dir: dir.path().join("work"),
        history_db: dir.path().join("history.db"),
        site_root: site_root.clone(),
        jobs: vec![job.clone()],
        ..Default::default()
    };
    let ctx = AppContext::new(config, RunHistory::in_memory().await.unwrap());
    let orchestrator = ctx.orchestrator();
    let trigger = Trigger::CommandLine {
        user: "cron".into(),
    };

    let record = orchestrator
        .run(&job, &trigger, &RunLog::buffered())
        .await
        .unwrap();

    assert_eq!(record.outcome, RunOutcome::Completed, "{}", record.log_text);
    let mut expected = vec![
        previous[2].clone(),
        previous[3].clone(),
        record.archive_name.clone(),
    ];
    expected.sort();
    assert_eq!(listing(&target), expected);

    let zip = zip::ZipArchive::new(File::open(target.join(&record.archive_name)).unwrap()).unwrap();
    assert!(zip.file_names().any(|n| n == "templates/home.php"));

    // Nothing but the lock file is left in the job directory.
    assert_eq!(listing(&dir.path().join("work").join("nightly")), vec!["run.lock"]);

    // A second trigger inside the repeat limit reuses the run.
    let again = orchestrator
        .run(&job, &trigger, &RunLog::buffered())
        .await
        .unwrap();
    assert_eq!(again.outcome, RunOutcome::Skipped);
    assert_eq!(again.archive_name, record.archive_name);
    assert_eq!(listing(&target).len(), 3);
}
