//! Storage backends for monitoring records and results
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` lets the controller and aggregators
//!   run against SQLite or plain memory
//! - **Async**: All operations are async for compatibility with Tokio actors
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database shared by controller and aggregators
//! - **In-Memory**: No persistence, for tests or throwaway fleets
//!
//! ## Usage
//!
//! ```no_run
//! use fleetwatch::config::StorageConfig;
//! use fleetwatch::storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = storage::open(Some(&StorageConfig::default())).await?;
//!     let groups = backend.list_groups().await?;
//!     println!("{} groups", groups.len());
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tracing::info;

use crate::config::StorageConfig;

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::{
    BucketSpan, EvaluationRecord, Group, JobRecord, JobSpec, Monitor, NewResult, ResultBucket,
    ResultRow, StoredValue,
};

/// Opens the configured backend. A missing section means SQLite at the
/// default path.
pub async fn open(config: Option<&StorageConfig>) -> StorageResult<Arc<dyn StorageBackend>> {
    let config = config.cloned().unwrap_or_default();
    match config {
        StorageConfig::None => {
            info!("storage disabled, keeping records in memory");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => {
            let backend = sqlite::SqliteBackend::new(&path).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { path } => {
            tracing::warn!(
                "built without SQLite support, ignoring {} and keeping records in memory",
                path.display()
            );
            Ok(Arc::new(MemoryBackend::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_storage_keeps_records_in_memory() {
        let backend = open(Some(&StorageConfig::None)).await.unwrap();

        backend.create_group("core", "").await.unwrap();
        assert_eq!(backend.list_groups().await.unwrap().len(), 1);
        assert!(backend.health_check().await.unwrap().healthy);
    }

    #[cfg(feature = "storage-sqlite")]
    #[tokio::test]
    async fn sqlite_storage_opens_at_the_configured_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("fleet.db");

        let backend = open(Some(&StorageConfig::Sqlite { path: path.clone() }))
            .await
            .unwrap();

        assert!(backend.health_check().await.unwrap().healthy);
        assert!(path.exists());
    }
}
