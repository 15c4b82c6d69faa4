use std::sync::Arc;

use colfs_lib::FsResult;
use log::debug;
use sha2::{Digest, Sha512};

use crate::body_cache::{self, BodyCache};
use crate::session::DbSessionRef;

/// Chunk rows hold at most this many bytes.
pub const BLOB_SIZE: usize = 1024 * 1024;

/// SHA-512 of a file body, the key of `filedata` and `fileref`.
pub fn body_hash(data: &[u8]) -> Vec<u8> {
    Sha512::digest(data).to_vec()
}

/// Content-addressed body storage with per-hash reference counting.
pub struct ContentStore {
    session: DbSessionRef,
    cache: Option<Arc<BodyCache>>,
}

impl ContentStore {
    pub fn new(session: DbSessionRef) -> Self {
        Self { session, cache: None }
    }

    /// Route reads through the named process-wide cache group.
    pub fn with_cache(mut self, group: &str, size_bytes: u64) -> Self {
        self.cache = Some(body_cache::group(group, size_bytes));
        self
    }

    /// Store `data` under its SHA-512, chunked at `BLOB_SIZE` byte offsets.
    /// A body already present anywhere in the cluster is not rewritten.
    pub async fn write_body(&self, data: &[u8]) -> FsResult<Vec<u8>> {
        let hash = body_hash(data);
        if self.session.chunk_exists(&hash).await? {
            return Ok(hash);
        }
        let mut location = 0usize;
        for piece in data.chunks(BLOB_SIZE) {
            self.session.insert_chunk(&hash, location as i32, piece).await?;
            location += piece.len();
        }
        debug!("stored body of {} bytes", data.len());
        Ok(hash)
    }

    /// Concatenated body for `hash`; the empty hash is the empty body.
    pub async fn read_body(&self, hash: &[u8]) -> FsResult<Vec<u8>> {
        if hash.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(cache) = &self.cache {
            if let Some(data) = cache.get(hash) {
                return Ok(data);
            }
            let data = self.read_raw(hash).await?;
            cache.put(hash, &data);
            return Ok(data);
        }
        self.read_raw(hash).await
    }

    async fn read_raw(&self, hash: &[u8]) -> FsResult<Vec<u8>> {
        let mut chunks = self.session.read_chunks(hash).await?;
        chunks.sort_by_key(|(location, _)| *location);
        let mut body = Vec::new();
        for (_, data) in chunks {
            body.extend_from_slice(&data);
        }
        Ok(body)
    }

    pub async fn increment_ref(&self, hash: &[u8]) -> FsResult<()> {
        if hash.is_empty() {
            return Ok(());
        }
        self.session.adjust_refs(hash, 1).await
    }

    pub async fn decrement_ref(&self, hash: &[u8]) -> FsResult<()> {
        if hash.is_empty() {
            return Ok(());
        }
        self.session.adjust_refs(hash, -1).await
    }
}
