use anyhow::{Context, Result, bail};
use clap::Parser;
use nix::unistd::{Uid, User};
use remote_backup::config::{AppConfig, DEFAULT_CONFIG_PATH};
use remote_backup::context::AppContext;
use remote_backup::core::Trigger;
use remote_backup::db::RunHistory;
use remote_backup::error::JobBusy;
use remote_backup::logging::{self, LogConfig, RunLog};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Exit status when another process is already running the job.
const EXIT_BUSY: u8 = 75;

#[derive(Parser)]
#[command(name = "remote-backup")]
#[command(about = "Archive site files and a database dump, upload them and prune old backups", long_about = None)]
struct Cli {
    /// Job to run; lists the configured jobs when omitted
    job_id: Option<String>,

    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Only connect to the job's storage target and disconnect again
    #[arg(long, conflicts_with = "history")]
    test_connection: bool,

    /// Print the job's recorded runs instead of running it
    #[arg(long)]
    history: bool,

    /// Do not echo the run log to stdout
    #[arg(long, short)]
    quiet: bool,

    #[arg(long, short)]
    verbose: bool,

    /// Diagnostics as JSON on stderr
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    logging::init(LogConfig {
        json: cli.json,
        verbose: cli.verbose,
    });

    let config = AppConfig::load(&cli.config)?;

    let Some(job_id) = cli.job_id.as_deref() else {
        print_jobs(&config);
        return Ok(ExitCode::SUCCESS);
    };
    let Some(job) = config.job(job_id).cloned() else {
        bail!("Unknown job id {job_id:?}; run without arguments to list jobs");
    };

    let history = RunHistory::open(&config.history_db).await?;
    let ctx = AppContext::new(config, history);

    if cli.history {
        print_history(&ctx, &job.id).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let log_path = ctx.config.log_file(&job.id);
    let log = RunLog::new(!cli.quiet)
        .with_file(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let orchestrator = ctx.orchestrator();

    if cli.test_connection {
        return Ok(match orchestrator.test_connection(&job, &log).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(_) => ExitCode::FAILURE,
        });
    }

    let trigger = Trigger::CommandLine {
        user: current_user(),
    };
    match orchestrator.run(&job, &trigger, &log).await {
        Ok(record) if record.is_error() => {
            error!(job_id = %job.id, outcome = %record.outcome, "Backup failed");
            Ok(ExitCode::FAILURE)
        }
        Ok(record) => {
            info!(job_id = %job.id, outcome = %record.outcome, "Backup finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.downcast_ref::<JobBusy>().is_some() => {
            error!(job_id = %job.id, "{e}");
            Ok(ExitCode::from(EXIT_BUSY))
        }
        Err(e) => Err(e.context(format!("Failed to run job {}", job.id))),
    }
}

fn print_jobs(config: &AppConfig) {
    println!("remote-backup - Usage: remote-backup <job id>");
    println!(
        "Run jobs as a user that can read all included files and write to the storage target.\n"
    );
    println!("Available jobs:");
    println!(" id => name");
    println!("-----------------");
    for job in &config.jobs {
        println!(" {} => {}", job.id, job.name);
    }
}

async fn print_history(ctx: &AppContext, job_id: &str) -> Result<()> {
    let runs = ctx.history.list(job_id).await?;
    if runs.is_empty() {
        println!("No runs recorded for job {job_id}.");
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {:<9}  effective {}  {}{}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.outcome,
            run.effective_date.format("%Y-%m-%d %H:%M:%S"),
            if run.archive_name.is_empty() {
                "-"
            } else {
                &run.archive_name
            },
            run.error
                .as_deref()
                .map(|e| format!("  error: {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn current_user() -> String {
    let uid = Uid::current();
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}
