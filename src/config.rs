use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "remote-backup.toml";
const ENV_PREFIX: &str = "REMOTE_BACKUP_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Root of the job-scoped local archive directories (`<work_dir>/<job id>/`).
    pub work_dir: PathBuf,
    /// SQLite file holding the run history of every job.
    pub history_db: PathBuf,
    /// Include and exclude paths are resolved relative to this directory.
    pub site_root: PathBuf,
    /// Run logs are appended to `<log_dir>/backup-<job id>.txt`; defaults to
    /// `<work_dir>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/var/lib/remote-backup"),
            history_db: PathBuf::from("/var/lib/remote-backup/history.db"),
            site_root: PathBuf::from("."),
            log_dir: None,
            notifications: NotificationConfig::default(),
            jobs: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Layers defaults, the TOML file and `REMOTE_BACKUP_*` environment
    /// variables (nested keys separated by `__`), then validates the jobs.
    pub fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(content))
            .extract()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn job(&self, id: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn log_file(&self, job_id: &str) -> PathBuf {
        let dir = self
            .log_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join("logs"));
        dir.join(format!("backup-{job_id}.txt"))
    }

    fn validate(&self) -> Result<()> {
        // Hyphens are excluded so that one job's prefix never matches another job's files.
        let id_pattern = Regex::new(r"^[A-Za-z0-9_]+$")?;
        let mut seen = HashSet::new();

        for job in &self.jobs {
            if !id_pattern.is_match(&job.id) {
                bail!(
                    "Invalid job id {:?}: only letters, digits and underscores are allowed",
                    job.id
                );
            }
            if !seen.insert(job.id.as_str()) {
                bail!("Duplicate job id {:?}", job.id);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Paths relative to the site root, archived recursively.
    #[serde(default)]
    pub include: Vec<String>,
    /// Paths relative to the site root that are skipped while archiving.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub database: Option<DatabaseDumpConfig>,
    pub storage: StorageTarget,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default = "default_repeat_limit_hours")]
    pub repeat_limit_hours: Option<u64>,
    #[serde(default)]
    pub mail: MailSettings,
    #[serde(default)]
    pub web: WebSettings,
}

fn default_repeat_limit_hours() -> Option<u64> {
    Some(12)
}

impl JobConfig {
    /// Minimal job used by tests and embedders; everything optional is off.
    pub fn new(id: impl Into<String>, storage: StorageTarget) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            include: Vec::new(),
            exclude: Vec::new(),
            database: None,
            storage,
            retention: RetentionSettings::default(),
            repeat_limit_hours: None,
            mail: MailSettings::default(),
            web: WebSettings::default(),
        }
    }
}

/// External dump tool whose stdout becomes the database file in the archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseDumpConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_dump_file_name")]
    pub file_name: String,
}

fn default_dump_file_name() -> String {
    "database.sql".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageTarget {
    /// A local or mounted directory. Supports listing, so retention applies.
    Directory {
        path: PathBuf,
        #[serde(default)]
        create: bool,
    },
    /// An external upload program. `{file}` and `{name}` in `args` are
    /// replaced with the archive path and file name.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTarget::Directory { path, .. } => write!(f, "directory {}", path.display()),
            StorageTarget::Command { program, .. } => write!(f, "command {}", program),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetentionSettings {
    pub keep_days: Option<u64>,
    pub keep_count: Option<usize>,
    pub keep_size_bytes: Option<u64>,
}

impl RetentionSettings {
    /// Whether any pass is on. `0` counts as off.
    pub fn is_configured(&self) -> bool {
        self.keep_days.is_some_and(|d| d > 0)
            || self.keep_count.is_some_and(|n| n > 0)
            || self.keep_size_bytes.is_some_and(|b| b > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailSettings {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub on_success: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default = "default_success_subject")]
    pub success_subject: String,
    #[serde(default = "default_failure_subject")]
    pub failure_subject: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            to: None,
            on_success: false,
            on_failure: true,
            success_subject: default_success_subject(),
            failure_subject: default_failure_subject(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_success_subject() -> String {
    "Automatic Backup Successful".to_string()
}

fn default_failure_subject() -> String {
    "Automatic Backup Failed".to_string()
}

/// Only consulted when a run is triggered through a web request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSettings {
    #[serde(default = "default_time_limit")]
    pub time_limit_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub ignore_user_abort: bool,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            time_limit_secs: default_time_limit(),
            ignore_user_abort: true,
        }
    }
}

fn default_time_limit() -> Option<u64> {
    Some(600)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Sendmail,
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationConfig {
    #[serde(default)]
    pub channel: NotificationChannelType,
    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: String,
    /// Sender address; defaults to the recipient.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub slack_webhook: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            channel: NotificationChannelType::None,
            sendmail_path: default_sendmail_path(),
            from: None,
            slack_webhook: None,
        }
    }
}

fn default_sendmail_path() -> String {
    "/usr/sbin/sendmail".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        work_dir = "/tmp/rb"
        history_db = "/tmp/rb/history.db"
        site_root = "/srv/site"

        [notifications]
        channel = "sendmail"

        [[jobs]]
        id = "nightly"
        name = "Nightly site backup"
        include = ["site", "index.php"]
        exclude = ["site/cache"]
        storage = { kind = "directory", path = "/mnt/backups", create = true }
        retention = { keep_count = 7 }

        [[jobs]]
        id = "db_only"
        repeat_limit_hours = 0
        storage = { kind = "command", program = "rclone", args = ["copy", "{file}", "remote:"] }
        mail = { to = "ops@example.com", on_success = true }
    "#;

    #[test]
    fn parses_jobs_with_defaults() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.work_dir, PathBuf::from("/tmp/rb"));
        assert_eq!(config.notifications.channel, NotificationChannelType::Sendmail);
        assert_eq!(config.notifications.sendmail_path, "/usr/sbin/sendmail");
        assert_eq!(config.jobs.len(), 2);

        let nightly = config.job("nightly").unwrap();
        assert_eq!(nightly.include, vec!["site", "index.php"]);
        assert_eq!(nightly.retention.keep_count, Some(7));
        assert!(nightly.retention.is_configured());
        assert_eq!(nightly.repeat_limit_hours, Some(12));
        assert!(nightly.mail.on_failure);
        assert!(!nightly.mail.on_success);
        assert_eq!(nightly.web.time_limit_secs, Some(600));
        assert_eq!(
            nightly.storage,
            StorageTarget::Directory {
                path: PathBuf::from("/mnt/backups"),
                create: true
            }
        );

        let db_only = config.job("db_only").unwrap();
        assert_eq!(db_only.repeat_limit_hours, Some(0));
        assert_eq!(db_only.mail.to.as_deref(), Some("ops@example.com"));
        assert_eq!(db_only.mail.failure_subject, "Automatic Backup Failed");
        assert!(!db_only.retention.is_configured());
        assert!(matches!(db_only.storage, StorageTarget::Command { .. }));
    }

    #[test]
    fn log_file_defaults_below_work_dir() {
        let mut config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.log_file("nightly"),
            PathBuf::from("/tmp/rb/logs/backup-nightly.txt")
        );

        config.log_dir = Some(PathBuf::from("/var/log/rb"));
        assert_eq!(
            config.log_file("nightly"),
            PathBuf::from("/var/log/rb/backup-nightly.txt")
        );
    }

    #[test]
    fn rejects_hyphenated_job_ids() {
        let toml = r#"
            [[jobs]]
            id = "site-a"
            storage = { kind = "directory", path = "/mnt" }
        "#;
        assert!(AppConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let toml = r#"
            [[jobs]]
            id = "a"
            storage = { kind = "directory", path = "/mnt" }

            [[jobs]]
            id = "a"
            storage = { kind = "directory", path = "/mnt" }
        "#;
        assert!(AppConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let config =
            AppConfig::from_toml_str(include_str!("../remote-backup.example.toml")).unwrap();
        let nightly = config.job("nightly").unwrap();
        assert_eq!(nightly.retention.keep_size_bytes, Some(10_737_418_240));
        assert_eq!(
            nightly.database.as_ref().map(|db| db.program.as_str()),
            Some("mysqldump")
        );
        assert_eq!(config.job("offsite").unwrap().repeat_limit_hours, Some(0));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert!(config.jobs.is_empty());
        assert_eq!(config.notifications.channel, NotificationChannelType::None);
    }
}
