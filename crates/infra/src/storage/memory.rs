//! In-memory storage repository for tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::{StorageError, StorageResult};
use super::repository::{PartRef, StorageHead, StorageRepository};

#[derive(Debug, Default)]
struct MemoryState {
    next_head_id: i64,
    next_part_id: i64,
    next_ordering: i64,
    heads: HashMap<String, StorageHead>,
    parts: BTreeMap<i64, MemoryPart>,
}

#[derive(Debug)]
struct MemoryPart {
    head_id: i64,
    ordering: i64,
    /// Recorded at append time, like the `length` column.
    length: u64,
    data: Vec<u8>,
}

/// Heads and parts kept in process memory.
///
/// Behaves like the Postgres repository, including the shared ordering
/// sequence across heads; nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryStorageRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryStorageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::IllegalState("in-memory storage lock poisoned".into()))
    }

    /// Chop `drop` bytes off the stored payload of a head's `index`-th part,
    /// leaving recorded lengths alone.
    #[cfg(test)]
    pub(crate) fn truncate_part(&self, key: &str, index: usize, drop: usize) {
        let mut state = self.state().unwrap();
        let head_id = state.heads[key].id;
        let part_id = *state
            .parts
            .iter()
            .filter(|(_, part)| part.head_id == head_id)
            .map(|(id, _)| id)
            .nth(index)
            .unwrap();
        let payload = &mut state.parts.get_mut(&part_id).unwrap().data;
        payload.truncate(payload.len().saturating_sub(drop));
    }
}

#[async_trait]
impl StorageRepository for InMemoryStorageRepository {
    async fn create_head(&self, key: &str) -> StorageResult<StorageHead> {
        let mut state = self.state()?;
        if state.heads.contains_key(key) {
            return Err(StorageError::IllegalState(format!(
                "storage head [{}] already exists",
                key
            )));
        }

        state.next_head_id += 1;
        let head = StorageHead {
            id: state.next_head_id,
            key: key.to_string(),
            length: 0,
            modify_timestamp: Utc::now(),
        };
        state.heads.insert(key.to_string(), head.clone());
        Ok(head)
    }

    async fn find_head(&self, key: &str) -> StorageResult<Option<StorageHead>> {
        Ok(self.state()?.heads.get(key).cloned())
    }

    async fn append_part(&self, head_id: i64, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state()?;
        state.next_part_id += 1;
        state.next_ordering += 1;
        let part_id = state.next_part_id;
        let ordering = state.next_ordering;

        let head = state
            .heads
            .values_mut()
            .find(|h| h.id == head_id)
            .ok_or_else(|| StorageError::NotFound(format!("head id {}", head_id)))?;
        head.length += data.len() as u64;
        head.modify_timestamp = Utc::now();
        let length = head.length;

        state.parts.insert(
            part_id,
            MemoryPart {
                head_id,
                ordering,
                length: data.len() as u64,
                data: data.to_vec(),
            },
        );
        Ok(length)
    }

    async fn list_parts(&self, head_id: i64) -> StorageResult<Vec<PartRef>> {
        let state = self.state()?;
        let mut parts: Vec<PartRef> = state
            .parts
            .iter()
            .filter(|(_, part)| part.head_id == head_id)
            .map(|(id, part)| PartRef {
                id: *id,
                ordering: part.ordering,
                length: part.length,
            })
            .collect();
        parts.sort_by_key(|p| p.ordering);
        Ok(parts)
    }

    async fn read_part(&self, part_id: i64) -> StorageResult<Vec<u8>> {
        self.state()?
            .parts
            .get(&part_id)
            .map(|part| part.data.clone())
            .ok_or_else(|| StorageError::NotFound(format!("part id {}", part_id)))
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        let mut state = self.state()?;
        match state.heads.remove(key) {
            Some(head) => {
                state.parts.retain(|_, part| part.head_id != head.id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> StorageResult<()> {
        let mut state = self.state()?;
        state.heads.clear();
        state.parts.clear();
        Ok(())
    }

    async fn keys_modified_before(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let state = self.state()?;
        let mut heads: Vec<&StorageHead> = state
            .heads
            .values()
            .filter(|h| h.modify_timestamp < cutoff)
            .collect();
        heads.sort_by_key(|h| h.modify_timestamp);
        Ok(heads.into_iter().map(|h| h.key.clone()).collect())
    }

    async fn size(&self) -> StorageResult<u64> {
        Ok(self.state()?.heads.len() as u64)
    }

    async fn total_bytes(&self) -> StorageResult<u64> {
        Ok(self.state()?.heads.values().map(|h| h.length).sum())
    }
}
