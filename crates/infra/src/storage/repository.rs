//! Persistence seam of the storage engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;

/// Logical blob: a key plus the running total of its parts' lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHead {
    pub id: i64,
    pub key: String,
    pub length: u64,
    pub modify_timestamp: DateTime<Utc>,
}

/// One stored chunk of a head, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRef {
    pub id: i64,
    /// Drawn from one sequence shared by all heads.
    pub ordering: i64,
    pub length: u64,
}

/// Head and part rows of the chunked blob store.
///
/// Implementations must keep a head's `length` equal to the sum of its
/// parts' lengths after every [`append_part`](Self::append_part).
#[async_trait]
pub trait StorageRepository: Send + Sync {
    /// Create an empty head. A duplicate key is `IllegalState`.
    async fn create_head(&self, key: &str) -> StorageResult<StorageHead>;

    async fn find_head(&self, key: &str) -> StorageResult<Option<StorageHead>>;

    /// Store `data` as the next part of the head and grow the head's length
    /// and modify time. Returns the head's new length.
    async fn append_part(&self, head_id: i64, data: &[u8]) -> StorageResult<u64>;

    /// Parts of a head in ascending ordering.
    async fn list_parts(&self, head_id: i64) -> StorageResult<Vec<PartRef>>;

    async fn read_part(&self, part_id: i64) -> StorageResult<Vec<u8>>;

    /// Delete a head and all its parts. Returns whether the head existed.
    async fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Delete every head and part.
    async fn clear(&self) -> StorageResult<()>;

    /// Keys of heads last modified before `cutoff`.
    async fn keys_modified_before(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<String>>;

    /// Number of heads.
    async fn size(&self) -> StorageResult<u64>;

    /// Sum of all head lengths.
    async fn total_bytes(&self) -> StorageResult<u64>;
}
