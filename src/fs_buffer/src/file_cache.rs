use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use colfs_lib::{EntryAttr, FsError, FsResult};
use fs_store::FileStore;
use log::debug;

use crate::file_data::{FileData, FileHandle};

/// Path-keyed cache of open-file records. Lookups take the read lock;
/// inserts double-check under the write lock so racing opens collapse onto
/// one shared record. Neither lock is held across database I/O.
#[derive(Default)]
pub struct FileCache {
    files: RwLock<HashMap<String, Arc<FileData>>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, path: &str) -> Option<Arc<FileData>> {
        self.files.read().ok()?.get(path).cloned()
    }

    fn insert_shared(&self, path: &str, data: Arc<FileData>) -> FsResult<Arc<FileData>> {
        let mut map = self
            .files
            .write()
            .map_err(|_| FsError::IoError("open-file cache poisoned".to_string()))?;
        Ok(map.entry(path.to_string()).or_insert(data).clone())
    }

    /// Open an existing file. The first open of a path fetches metadata and
    /// body; subsequent opens share the buffered record.
    pub async fn open(&self, store: &FileStore, path: &str) -> FsResult<FileHandle> {
        if let Some(data) = self.lookup(path) {
            return Ok(FileHandle::new(data));
        }
        let record = store.get_filedata(path).await?;
        let body = store.content().read_body(&record.hash).await?;
        let data = FileData::new(path, record.hash, body, record.meta.attr);
        let shared = self.insert_shared(path, data)?;
        Ok(FileHandle::new(shared))
    }

    /// Create a new empty file. The path must not exist yet; any lookup
    /// failure other than `NotFound` aborts the create.
    pub async fn create(&self, store: &FileStore, path: &str, attr: EntryAttr) -> FsResult<FileHandle> {
        match store.get_filedata(path).await {
            Ok(_) => return Err(FsError::AlreadyExists(path.to_string())),
            Err(FsError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        store.create_file(path, &attr, b"").await?;
        let data = FileData::new(path, Vec::new(), Vec::new(), attr);
        let shared = self.insert_shared(path, data)?;
        Ok(FileHandle::new(shared))
    }

    /// Release one handle. The last handle flushes the record and drops the
    /// path from the cache; on a flush failure the record stays buffered.
    pub async fn release(&self, store: &FileStore, mut handle: FileHandle) -> FsResult<()> {
        handle.mark_closed();
        let data = handle.file().clone();
        drop(handle);
        if data.release() > 0 {
            return Ok(());
        }
        data.flush(store).await?;
        if let Ok(mut map) = self.files.write() {
            // an open may have raced the last release; only drop idle records
            if data.ref_count() == 0 {
                map.remove(data.path());
                debug!("closed {}", data.path());
            }
        }
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files
            .read()
            .map(|map| map.contains_key(path))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colfs_lib::MountConfig;
    use fs_store::{DbSession, DbSessionRef, MemSession};

    fn fixture() -> (FileCache, FileStore, Arc<MemSession>) {
        let session = Arc::new(MemSession::new());
        let config = MountConfig {
            fcache_ttl_secs: 0,
            ..Default::default()
        };
        let session_ref: DbSessionRef = session.clone();
        let store = FileStore::new(session_ref, &config);
        (FileCache::new(), store, session)
    }

    fn attr() -> EntryAttr {
        EntryAttr::new_file(0o644, 1000, 1000)
    }

    #[tokio::test]
    async fn test_create_then_reopen_after_release() {
        let (cache, store, _session) = fixture();
        let mut handle = cache.create(&store, "f", attr()).await.unwrap();
        handle.write(b"hello", 0);
        cache.release(&store, handle).await.unwrap();
        assert!(!cache.contains("f"));

        let mut reopened = cache.open(&store, "f").await.unwrap();
        assert_eq!(reopened.read(0, 64), b"hello");
        assert_eq!(reopened.attr().size, 5);
        cache.release(&store, reopened).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_refuses_existing_path() {
        let (cache, store, _session) = fixture();
        let handle = cache.create(&store, "f", attr()).await.unwrap();
        cache.release(&store, handle).await.unwrap();
        let err = cache.create(&store, "f", attr()).await.unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (cache, store, _session) = fixture();
        assert!(cache.open(&store, "ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_opens_share_one_record() {
        let (cache, store, _session) = fixture();
        let mut first = cache.create(&store, "f", attr()).await.unwrap();
        first.write(b"buffered", 0);

        let mut second = cache.open(&store, "f").await.unwrap();
        // sees the unflushed buffer, not the empty database row
        assert_eq!(second.read(0, 64), b"buffered");
        assert_eq!(first.file().ref_count(), 2);

        cache.release(&store, first).await.unwrap();
        assert!(cache.contains("f"));
        cache.release(&store, second).await.unwrap();
        assert!(!cache.contains("f"));
    }

    #[tokio::test]
    async fn test_release_flushes_dirty_state() {
        let (cache, store, session) = fixture();
        let mut handle = cache.create(&store, "f", attr()).await.unwrap();
        handle.write(b"data", 0);
        cache.release(&store, handle).await.unwrap();
        let record = store.get_filedata("f").await.unwrap();
        assert_eq!(record.meta.attr.size, 4);
        assert_eq!(session.read_refs(&record.hash).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_flush_clears_dirty_once() {
        let (cache, store, session) = fixture();
        let mut handle = cache.create(&store, "f", attr()).await.unwrap();
        handle.write(b"data", 0);
        handle.flush(&store).await.unwrap();
        assert!(!handle.file().is_dirty());
        let writes = session.chunk_insert_count();
        // clean flush is a no-op
        handle.flush(&store).await.unwrap();
        assert_eq!(session.chunk_insert_count(), writes);
        cache.release(&store, handle).await.unwrap();
    }
}
