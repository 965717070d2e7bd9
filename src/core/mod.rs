pub mod archive;
pub mod dump;
pub mod lock;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod retention;
pub mod storage;

pub use archive::{ArchiveBuilder, ZipArchiveBuilder};
pub use models::{RemoteFile, RunOutcome, RunRecord, Trigger};
pub use orchestrator::BackupOrchestrator;
pub use retention::{RetentionPolicy, RetentionSummary};
pub use storage::{ListableStorage, StorageClient, StorageFactory};
