use std::sync::Arc;

use async_trait::async_trait;
use colfs_lib::FsResult;

/// One row of the `filesystem` namespace table.
#[derive(Debug, Clone, Default)]
pub struct EntryRow {
    pub name: String,
    pub hash: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// Row-level access to the three storage tables, scoped to one
/// (owner, environment) pair at construction time.
///
/// `get_entry` must report a missing row as `FsError::NotFound`; every other
/// backend failure surfaces as `FsError::DbError`.
#[async_trait]
pub trait DbSession: Send + Sync {
    async fn get_entry(&self, dir: &str, name: &str) -> FsResult<EntryRow>;
    async fn insert_entry(&self, dir: &str, name: &str, hash: &[u8], metadata: &[u8]) -> FsResult<()>;
    /// Repoint an existing row at a new hash and metadata blob.
    async fn update_entry(&self, dir: &str, name: &str, hash: &[u8], metadata: &[u8]) -> FsResult<()>;
    async fn update_metadata(&self, dir: &str, name: &str, metadata: &[u8]) -> FsResult<()>;
    async fn delete_entry(&self, dir: &str, name: &str) -> FsResult<()>;
    /// Every row under one directory id.
    async fn list_dir(&self, dir: &str) -> FsResult<Vec<EntryRow>>;
    async fn entry_count(&self) -> FsResult<u64>;

    /// Whether at least one chunk row exists for `hash`.
    async fn chunk_exists(&self, hash: &[u8]) -> FsResult<bool>;
    async fn insert_chunk(&self, hash: &[u8], location: i32, data: &[u8]) -> FsResult<()>;
    /// All chunk rows for `hash` as (location, data), in no particular order.
    async fn read_chunks(&self, hash: &[u8]) -> FsResult<Vec<(i32, Vec<u8>)>>;

    /// Apply `delta` to the reference counter for `hash`. Missing counters
    /// start at zero.
    async fn adjust_refs(&self, hash: &[u8], delta: i64) -> FsResult<()>;
    async fn read_refs(&self, hash: &[u8]) -> FsResult<i64>;
}

pub type DbSessionRef = Arc<dyn DbSession>;
