use std::time::Duration;

use colfs_lib::{join_path, split_path, EntryAttr, EntryMeta, FsError, FsResult, MountConfig};
use log::warn;
use uuid::Uuid;

use crate::content::ContentStore;
use crate::meta_cache::MetaCache;
use crate::resolver::DirResolver;
use crate::session::DbSessionRef;

/// Decoded namespace row for one path.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub hash: Vec<u8>,
    pub meta: EntryMeta,
}

/// Namespace operations over the database session, fronted by the TTL
/// metadata cache and the directory resolver.
pub struct FileStore {
    session: DbSessionRef,
    content: ContentStore,
    resolver: DirResolver,
    cache: MetaCache,
}

impl FileStore {
    pub fn new(session: DbSessionRef, config: &MountConfig) -> Self {
        let mut content = ContentStore::new(session.clone());
        if config.cache_enabled {
            content = content.with_cache(&config.cache_group(), config.cache_size_bytes);
        }
        Self {
            content,
            resolver: DirResolver::new(session.clone()),
            cache: MetaCache::new(Duration::from_secs(config.fcache_ttl_secs)),
            session,
        }
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Split `path` and resolve the parent directory to its UUID. A parent
    /// that fails to resolve is an I/O error here: only the final component
    /// may report `NotFound` to callers.
    async fn locate(&self, path: &str) -> FsResult<(String, String)> {
        let (dir, name) = split_path(path);
        let dir_id = match self.resolver.find_dir(dir).await {
            Ok(id) => id,
            Err(FsError::NotFound(_)) => {
                return Err(FsError::IoError(format!("parent directory {} not found", dir)))
            }
            Err(err) => return Err(err),
        };
        Ok((dir_id, name.to_string()))
    }

    /// Look up one path, serving from the metadata cache while the entry is
    /// fresh. `NotFound` is preserved for the final component; any other
    /// database failure surfaces as an I/O error.
    pub async fn get_filedata(&self, path: &str) -> FsResult<FileRecord> {
        if let Some(record) = self.cache.get(path) {
            return Ok(record);
        }
        let (dir_id, name) = self.locate(path).await?;
        let row = match self.session.get_entry(&dir_id, &name).await {
            Ok(row) => row,
            Err(err @ FsError::NotFound(_)) => return Err(err),
            Err(err) => return Err(FsError::IoError(err.to_string())),
        };
        let meta = EntryMeta::decode(&row.metadata)?;
        let record = FileRecord { hash: row.hash, meta };
        self.cache.put(path, record.clone());
        Ok(record)
    }

    /// Insert a namespace row for a new file or symlink. A non-empty hash
    /// gains a reference.
    pub async fn create_file(&self, path: &str, attr: &EntryAttr, hash: &[u8]) -> FsResult<()> {
        let blob = EntryMeta::new(*attr).encode()?;
        let (dir_id, name) = self.locate(path).await?;
        self.session.insert_entry(&dir_id, &name, hash, &blob).await?;
        if !hash.is_empty() {
            self.content.increment_ref(hash).await?;
        }
        Ok(())
    }

    /// Insert a directory row; the hash column receives a fresh time-ordered
    /// UUID that keys the directory's children.
    pub async fn make_directory(&self, path: &str, attr: &EntryAttr) -> FsResult<()> {
        let blob = EntryMeta::new(*attr).encode()?;
        let (dir_id, name) = self.locate(path).await?;
        let id = Uuid::now_v7();
        self.session.insert_entry(&dir_id, &name, id.as_bytes(), &blob).await
    }

    /// Rewrite only the metadata column of an existing row.
    pub async fn write_metadata(&self, path: &str, meta: &EntryMeta) -> FsResult<()> {
        let blob = meta.encode()?;
        let (dir_id, name) = self.locate(path).await?;
        self.cache.evict(path);
        self.session.update_metadata(&dir_id, &name, &blob).await
    }

    /// Persist a rewritten body: store the chunks, repoint the row, and move
    /// the reference from the old hash to the new one. Returns the new hash.
    /// When the body hashes to the same value as before, neither counter
    /// moves.
    pub async fn update_file(
        &self,
        path: &str,
        data: &[u8],
        attr: &EntryAttr,
        old_hash: &[u8],
    ) -> FsResult<Vec<u8>> {
        let hash = self.content.write_body(data).await?;
        let blob = EntryMeta::new(*attr).encode()?;
        let (dir_id, name) = self.locate(path).await?;
        self.session.update_entry(&dir_id, &name, &hash, &blob).await?;
        if hash != old_hash {
            self.content.increment_ref(&hash).await?;
            if !old_hash.is_empty() {
                self.content.decrement_ref(old_hash).await?;
            }
        }
        self.cache.evict(path);
        Ok(hash)
    }

    /// Remove one namespace row and release its reference.
    pub async fn delete_file(&self, path: &str) -> FsResult<()> {
        let (dir_id, name) = self.locate(path).await?;
        let row = self.session.get_entry(&dir_id, &name).await?;
        self.session.delete_entry(&dir_id, &name).await?;
        if !row.hash.is_empty() {
            self.content.decrement_ref(&row.hash).await?;
        }
        self.cache.evict(path);
        Ok(())
    }

    /// Move a single namespace row. Once the new row is in place the rename
    /// is committed: a failure deleting the old row is logged and swallowed.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let (old_dir, old_name) = self.locate(old_path).await?;
        let row = self.session.get_entry(&old_dir, &old_name).await?;
        let (new_dir, new_name) = self.locate(new_path).await?;
        self.session
            .insert_entry(&new_dir, &new_name, &row.hash, &row.metadata)
            .await?;
        if let Err(err) = self.session.delete_entry(&old_dir, &old_name).await {
            warn!("rename {} -> {}: old row left behind: {}", old_path, new_path, err);
        }
        self.cache.evict(old_path);
        self.cache.evict(new_path);
        Ok(())
    }

    /// Duplicate `src`'s row at `dst`, sharing the same body. If the counter
    /// update fails the new row is deleted again so no unbacked reference
    /// survives.
    pub async fn copy_file(&self, src: &str, dst: &str) -> FsResult<()> {
        let (src_dir, src_name) = self.locate(src).await?;
        let row = self.session.get_entry(&src_dir, &src_name).await?;
        let (dst_dir, dst_name) = self.locate(dst).await?;
        self.session
            .insert_entry(&dst_dir, &dst_name, &row.hash, &row.metadata)
            .await?;
        if let Err(err) = self.content.increment_ref(&row.hash).await {
            let _ = self.session.delete_entry(&dst_dir, &dst_name).await;
            return Err(err);
        }
        Ok(())
    }

    /// List a directory, pre-populating the metadata cache with every row.
    /// Returns (mode, name) pairs; rows with undecodable metadata are
    /// skipped.
    pub async fn list_directory(&self, dir: &str) -> FsResult<Vec<(u32, String)>> {
        let dir_id = self.resolver.find_dir(dir).await?;
        let rows = self.session.list_dir(&dir_id).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let meta = match EntryMeta::decode(&row.metadata) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("skipping {} in {}: {}", row.name, dir, err);
                    continue;
                }
            };
            self.cache.put(
                &join_path(dir, &row.name),
                FileRecord {
                    hash: row.hash,
                    meta: meta.clone(),
                },
            );
            entries.push((meta.attr.mode, row.name));
        }
        Ok(entries)
    }

    pub async fn file_count(&self) -> FsResult<u64> {
        self.session.entry_count().await
    }

    /// Cache maintenance after a directory disappears or moves.
    pub fn evict_dir(&self, path: &str) {
        self.resolver.evict_prefix(path);
        self.cache.evict(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::body_hash;
    use crate::mem::MemSession;
    use crate::session::DbSession;
    use std::sync::Arc;

    fn store_with(fcache_ttl_secs: u64) -> (FileStore, Arc<MemSession>) {
        let session = Arc::new(MemSession::new());
        let config = MountConfig {
            fcache_ttl_secs,
            ..Default::default()
        };
        (FileStore::new(session.clone(), &config), session)
    }

    fn file_attr() -> EntryAttr {
        EntryAttr::new_file(0o644, 1000, 1000)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (store, _session) = store_with(60);
        store.create_file("f", &file_attr(), b"").await.unwrap();
        let record = store.get_filedata("f").await.unwrap();
        assert!(record.hash.is_empty());
        assert!(record.meta.attr.is_regular());
        assert!(store.get_filedata("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_metadata_cache_serves_fresh_entries() {
        let (store, session) = store_with(60);
        store.create_file("f", &file_attr(), b"").await.unwrap();
        store.get_filedata("f").await.unwrap();
        session.delete_entry("", "f").await.unwrap();
        // fresh cache entry answers even though the row is gone
        assert!(store.get_filedata("f").await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_ttl_always_reads_through() {
        let (store, session) = store_with(0);
        store.create_file("f", &file_attr(), b"").await.unwrap();
        store.get_filedata("f").await.unwrap();
        session.delete_entry("", "f").await.unwrap();
        assert!(store.get_filedata("f").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_file_moves_reference() {
        let (store, session) = store_with(0);
        store.create_file("f", &file_attr(), b"").await.unwrap();

        let first = store.update_file("f", b"one", &file_attr(), b"").await.unwrap();
        assert_eq!(session.read_refs(&first).await.unwrap(), 1);

        let second = store.update_file("f", b"two", &file_attr(), &first).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(session.read_refs(&first).await.unwrap(), 0);
        assert_eq!(session.read_refs(&second).await.unwrap(), 1);

        // unchanged content keeps the counter still
        let third = store.update_file("f", b"two", &file_attr(), &second).await.unwrap();
        assert_eq!(third, second);
        assert_eq!(session.read_refs(&second).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_file_releases_reference() {
        let (store, session) = store_with(0);
        store.create_file("f", &file_attr(), b"").await.unwrap();
        let hash = store.update_file("f", b"body", &file_attr(), b"").await.unwrap();
        store.delete_file("f").await.unwrap();
        assert!(store.get_filedata("f").await.unwrap_err().is_not_found());
        assert_eq!(session.read_refs(&hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_copy_file_shares_body() {
        let (store, session) = store_with(0);
        store.create_file("f", &file_attr(), b"").await.unwrap();
        let hash = store.update_file("f", b"body", &file_attr(), b"").await.unwrap();
        store.copy_file("f", "g").await.unwrap();
        assert_eq!(store.get_filedata("g").await.unwrap().hash, hash);
        assert_eq!(session.read_refs(&hash).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_copy_file_compensates_on_counter_failure() {
        let (store, session) = store_with(0);
        store.create_file("f", &file_attr(), b"").await.unwrap();
        store.update_file("f", b"body", &file_attr(), b"").await.unwrap();
        session.fail_ref_updates(true);
        assert!(store.copy_file("f", "g").await.is_err());
        session.fail_ref_updates(false);
        assert!(store.get_filedata("g").await.unwrap_err().is_not_found());
        assert_eq!(session.read_refs(&body_hash(b"body")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rename_moves_row() {
        let (store, _session) = store_with(0);
        store.create_file("old", &file_attr(), b"").await.unwrap();
        store.rename("old", "new").await.unwrap();
        assert!(store.get_filedata("old").await.unwrap_err().is_not_found());
        assert!(store.get_filedata("new").await.is_ok());
    }

    #[tokio::test]
    async fn test_directories_key_their_children() {
        let (store, _session) = store_with(0);
        store.make_directory("d", &EntryAttr::new_dir(0o755, 0, 0)).await.unwrap();
        store.create_file("d/x", &file_attr(), b"").await.unwrap();
        assert!(store.get_filedata("d/x").await.is_ok());

        let listing = store.list_directory("d").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].1, "x");

        let root = store.list_directory("").await.unwrap();
        let names: Vec<&str> = root.iter().map(|(_, name)| name.as_str()).collect();
        assert_eq!(names, vec!["d"]);
    }

    #[tokio::test]
    async fn test_missing_parent_is_io_error() {
        let (store, _session) = store_with(0);
        let err = store.get_filedata("ghost/f").await.unwrap_err();
        assert!(matches!(err, FsError::IoError(_)));
        // the directory itself stays NotFound for listings
        assert!(store.list_directory("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_directory_prepopulates_cache() {
        let (store, session) = store_with(60);
        store.make_directory("d", &EntryAttr::new_dir(0o755, 0, 0)).await.unwrap();
        store.create_file("d/x", &file_attr(), b"").await.unwrap();
        store.list_directory("d").await.unwrap();
        let dir_id = store.resolver.find_dir("d").await.unwrap();
        session.delete_entry(&dir_id, "x").await.unwrap();
        // served from the pre-populated cache
        assert!(store.get_filedata("d/x").await.is_ok());
    }

    #[tokio::test]
    async fn test_file_count() {
        let (store, _session) = store_with(0);
        store.create_file("a", &file_attr(), b"").await.unwrap();
        store.create_file("b", &file_attr(), b"").await.unwrap();
        assert_eq!(store.file_count().await.unwrap(), 2);
    }
}
