//! Chunked blob storage.
//!
//! A blob is a *head* row (key, cumulative length, modify time) plus an
//! ordered run of bounded-size *part* rows. Writes and reads stream through
//! private temporary files so neither side ever holds a whole blob in
//! memory. The store is not job specific: any byte stream can be kept under a
//! string key. Keys that parse as a job data code are reserved for job data;
//! the job expiry sweep deletes such blobs once no job data row points at
//! them.
//!
//! ## Components
//!
//! - [`DataStorage`]: the entry point (`put`, `get`, `remove`, `keys`, ...)
//! - [`StorageSink`] / [`StorageReader`]: streaming write and read handles
//! - [`StorageRepository`]: persistence seam, with Postgres and in-memory
//!   implementations

pub mod error;
pub mod memory;
pub mod postgres;
pub mod reader;
pub mod repository;
pub mod sink;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorageRepository;
pub use postgres::PgStorageRepository;
pub use reader::StorageReader;
pub use repository::{PartRef, StorageHead, StorageRepository};
pub use sink::StorageSink;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info, instrument};

/// Default part size: 256 KiB.
pub const DEFAULT_PART_SIZE: usize = 256 * 1024;

/// Storage engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Upper bound on the bytes held by one part row.
    pub part_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

impl StorageConfig {
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }
}

/// Entry point of the blob store; cheap to clone.
#[derive(Clone)]
pub struct DataStorage {
    repository: Arc<dyn StorageRepository>,
    config: StorageConfig,
}

impl std::fmt::Debug for DataStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DataStorage {
    pub fn new(repository: Arc<dyn StorageRepository>, config: StorageConfig) -> StorageResult<Self> {
        if config.part_size == 0 {
            return Err(StorageError::IllegalState("part size must be positive".into()));
        }
        Ok(Self { repository, config })
    }

    /// Blob store backed by the `object_head` / `object_part` tables.
    pub fn postgres(pool: PgPool, config: StorageConfig) -> StorageResult<Self> {
        Self::new(Arc::new(PgStorageRepository::new(pool)), config)
    }

    /// Blob store that lives in process memory.
    pub fn in_memory(config: StorageConfig) -> StorageResult<Self> {
        Self::new(Arc::new(InMemoryStorageRepository::new()), config)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create the head for `key` and return a sink that fills it.
    ///
    /// A key that already exists is `IllegalState`.
    #[instrument(skip(self), err)]
    pub async fn put(&self, key: &str) -> StorageResult<StorageSink> {
        let head = self.repository.create_head(key).await?;
        debug!(key, head_id = head.id, "storage head created");
        StorageSink::new(self.repository.clone(), head, self.config.part_size)
    }

    /// Stream the blob stored under `key`, if any.
    #[instrument(skip(self), err)]
    pub async fn get(&self, key: &str) -> StorageResult<Option<StorageReader>> {
        let Some(head) = self.repository.find_head(key).await? else {
            return Ok(None);
        };
        let parts = self.repository.list_parts(head.id).await?;
        Ok(Some(StorageReader::new(self.repository.clone(), head, parts)))
    }

    /// Delete a blob. Returns whether it existed.
    #[instrument(skip(self), err)]
    pub async fn remove(&self, key: &str) -> StorageResult<bool> {
        let removed = self.repository.remove(key).await?;
        if removed {
            debug!(key, "storage head removed");
        }
        Ok(removed)
    }

    /// Delete every blob. Administrative reset.
    #[instrument(skip(self), err)]
    pub async fn clear(&self) -> StorageResult<()> {
        self.repository.clear().await?;
        info!("storage cleared");
        Ok(())
    }

    /// Keys of blobs not modified within `older_than`.
    pub async fn keys(&self, older_than: Duration) -> StorageResult<Vec<String>> {
        let before = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                StorageError::IllegalState(format!("age {older_than:?} is out of range"))
            })?;
        self.repository.keys_modified_before(before).await
    }

    /// Number of blobs.
    pub async fn size(&self) -> StorageResult<u64> {
        self.repository.size().await
    }

    /// Sum of all blob lengths.
    pub async fn total_bytes(&self) -> StorageResult<u64> {
        self.repository.total_bytes().await
    }
}
