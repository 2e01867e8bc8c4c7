//! Central alert storage: pluggable backend behind the [`AlertStore`] trait.

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;

#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::AlertStore;
pub use error::{StorageError, StorageResult};

use crate::config::StorageConfig;

/// Build the configured store. Falls back to in-memory when no persistent
/// backend is configured (or compiled in).
pub async fn create_store(config: Option<&StorageConfig>) -> anyhow::Result<Box<dyn AlertStore>> {
    match config {
        None | Some(StorageConfig::None) => Ok(Box::new(memory::MemoryStore::new())),

        #[cfg(feature = "storage-sqlite")]
        Some(StorageConfig::Sqlite { path, .. }) => {
            let store = sqlite::SqliteStore::new(path).await?;
            Ok(Box::new(store))
        }

        #[cfg(not(feature = "storage-sqlite"))]
        Some(StorageConfig::Sqlite { .. }) => {
            tracing::warn!("sqlite storage requested but not compiled in, using in-memory store");
            Ok(Box::new(memory::MemoryStore::new()))
        }
    }
}
