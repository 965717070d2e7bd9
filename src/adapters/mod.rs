use crate::config::StorageTarget;
use crate::core::storage::StorageClient;
use crate::error::StorageError;

pub mod command;
pub mod directory;
pub mod simulated;

pub use command::CommandStorage;
pub use directory::DirectoryStorage;
pub use simulated::{SimulatedController, SimulatedStorage};

/// Builds the client for a configured storage target.
///
/// Usable directly as a [`StorageFactory`](crate::core::storage::StorageFactory).
pub fn create_storage(target: &StorageTarget) -> Result<Box<dyn StorageClient>, StorageError> {
    match target {
        StorageTarget::Directory { path, create } => {
            Ok(Box::new(DirectoryStorage::new(path.clone(), *create)))
        }
        StorageTarget::Command { program, args } => {
            if program.trim().is_empty() {
                return Err(StorageError::Other("upload command is empty".into()));
            }
            Ok(Box::new(CommandStorage::new(program.clone(), args.clone())))
        }
    }
}
