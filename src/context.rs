use crate::adapters;
use crate::config::AppConfig;
use crate::core::notifications::create_notifier;
use crate::core::{BackupOrchestrator, ZipArchiveBuilder};
use crate::db::RunHistory;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub history: RunHistory,
}

impl AppContext {
    pub fn new(config: AppConfig, history: RunHistory) -> Self {
        Self {
            config: Arc::new(config),
            history,
        }
    }

    /// Orchestrator wired with the configured archive builder, storage
    /// adapters and notification channel.
    pub fn orchestrator(&self) -> BackupOrchestrator {
        let builder = ZipArchiveBuilder::new(&self.config.site_root, &self.config.work_dir);

        BackupOrchestrator::new(
            self.history.clone(),
            Arc::new(builder),
            Arc::new(adapters::create_storage),
            &self.config.work_dir,
        )
        .with_notifier(create_notifier(&self.config.notifications))
    }
}
