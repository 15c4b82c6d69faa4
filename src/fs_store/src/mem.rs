use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use colfs_lib::{join_path, FsError, FsResult};

use crate::session::{DbSession, EntryRow};

#[derive(Default)]
struct MemTables {
    entries: BTreeMap<(String, String), (Vec<u8>, Vec<u8>)>,
    chunks: BTreeMap<(Vec<u8>, i32), Vec<u8>>,
    refs: HashMap<Vec<u8>, i64>,
}

/// In-memory `DbSession` used by the test suites and for single-process
/// experiments. Counter rows follow the database's semantics: a missing row
/// reads as zero and updates create it implicitly.
#[derive(Default)]
pub struct MemSession {
    tables: Mutex<MemTables>,
    chunk_inserts: AtomicU64,
    fail_ref_updates: AtomicBool,
}

impl MemSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total chunk rows written so far, for dedup assertions.
    pub fn chunk_insert_count(&self) -> u64 {
        self.chunk_inserts.load(Ordering::SeqCst)
    }

    /// Chunk rows currently stored for `hash`.
    pub fn chunk_row_count(&self, hash: &[u8]) -> usize {
        match self.tables.lock() {
            Ok(t) => t.chunks.keys().filter(|(h, _)| h == hash).count(),
            Err(_) => 0,
        }
    }

    /// Remove every chunk row for `hash` (cache bypass assertions).
    pub fn drop_chunks(&self, hash: &[u8]) {
        if let Ok(mut t) = self.tables.lock() {
            t.chunks.retain(|(h, _), _| h != hash);
        }
    }

    /// Make every following `adjust_refs` fail, to exercise the
    /// compensation paths.
    pub fn fail_ref_updates(&self, fail: bool) {
        self.fail_ref_updates.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> FsResult<MutexGuard<'_, MemTables>> {
        self.tables
            .lock()
            .map_err(|_| FsError::DbError("session tables poisoned".to_string()))
    }
}

#[async_trait]
impl DbSession for MemSession {
    async fn get_entry(&self, dir: &str, name: &str) -> FsResult<EntryRow> {
        let t = self.lock()?;
        match t.entries.get(&(dir.to_string(), name.to_string())) {
            Some((hash, metadata)) => Ok(EntryRow {
                name: name.to_string(),
                hash: hash.clone(),
                metadata: metadata.clone(),
            }),
            None => Err(FsError::NotFound(join_path(dir, name))),
        }
    }

    async fn insert_entry(&self, dir: &str, name: &str, hash: &[u8], metadata: &[u8]) -> FsResult<()> {
        let mut t = self.lock()?;
        t.entries.insert(
            (dir.to_string(), name.to_string()),
            (hash.to_vec(), metadata.to_vec()),
        );
        Ok(())
    }

    async fn update_entry(&self, dir: &str, name: &str, hash: &[u8], metadata: &[u8]) -> FsResult<()> {
        // CQL updates are upserts.
        self.insert_entry(dir, name, hash, metadata).await
    }

    async fn update_metadata(&self, dir: &str, name: &str, metadata: &[u8]) -> FsResult<()> {
        let mut t = self.lock()?;
        let row = t
            .entries
            .entry((dir.to_string(), name.to_string()))
            .or_default();
        row.1 = metadata.to_vec();
        Ok(())
    }

    async fn delete_entry(&self, dir: &str, name: &str) -> FsResult<()> {
        let mut t = self.lock()?;
        t.entries.remove(&(dir.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_dir(&self, dir: &str) -> FsResult<Vec<EntryRow>> {
        let t = self.lock()?;
        Ok(t.entries
            .iter()
            .filter(|((d, _), _)| d == dir)
            .map(|((_, name), (hash, metadata))| EntryRow {
                name: name.clone(),
                hash: hash.clone(),
                metadata: metadata.clone(),
            })
            .collect())
    }

    async fn entry_count(&self) -> FsResult<u64> {
        Ok(self.lock()?.entries.len() as u64)
    }

    async fn chunk_exists(&self, hash: &[u8]) -> FsResult<bool> {
        let t = self.lock()?;
        Ok(t.chunks.keys().any(|(h, _)| h == hash))
    }

    async fn insert_chunk(&self, hash: &[u8], location: i32, data: &[u8]) -> FsResult<()> {
        let mut t = self.lock()?;
        t.chunks.insert((hash.to_vec(), location), data.to_vec());
        self.chunk_inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_chunks(&self, hash: &[u8]) -> FsResult<Vec<(i32, Vec<u8>)>> {
        let t = self.lock()?;
        Ok(t.chunks
            .iter()
            .filter(|((h, _), _)| h == hash)
            .map(|((_, location), data)| (*location, data.clone()))
            .collect())
    }

    async fn adjust_refs(&self, hash: &[u8], delta: i64) -> FsResult<()> {
        if self.fail_ref_updates.load(Ordering::SeqCst) {
            return Err(FsError::DbError("counter update failed".to_string()));
        }
        let mut t = self.lock()?;
        *t.refs.entry(hash.to_vec()).or_insert(0) += delta;
        Ok(())
    }

    async fn read_refs(&self, hash: &[u8]) -> FsResult<i64> {
        let t = self.lock()?;
        Ok(t.refs.get(hash).copied().unwrap_or(0))
    }
}
