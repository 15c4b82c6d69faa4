use std::collections::HashMap;
use std::sync::RwLock;

use colfs_lib::{FsError, FsResult};
use log::debug;
use uuid::Uuid;

use crate::session::DbSessionRef;

/// Resolves a directory path to the UUID its children are keyed under.
///
/// Results are cached positively and never expire on their own; callers
/// evict by prefix when a directory is removed or renamed so a recreated
/// path re-resolves.
pub struct DirResolver {
    session: DbSessionRef,
    cache: RwLock<HashMap<String, String>>,
}

impl DirResolver {
    pub fn new(session: DbSessionRef) -> Self {
        Self {
            session,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Walk `dir` one segment at a time starting from the root parent `""`.
    /// The root itself resolves to `""`.
    pub async fn find_dir(&self, dir: &str) -> FsResult<String> {
        if dir.is_empty() {
            return Ok(String::new());
        }
        if let Ok(cache) = self.cache.read() {
            if let Some(id) = cache.get(dir) {
                return Ok(id.clone());
            }
        }
        let mut parent = String::new();
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            let row = self.session.get_entry(&parent, segment).await?;
            let id = Uuid::from_slice(&row.hash).map_err(|e| {
                FsError::DbError(format!("bad directory id for {} under {}: {}", segment, parent, e))
            })?;
            parent = id.to_string();
        }
        debug!("resolved {} -> {}", dir, parent);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(dir.to_string(), parent.clone());
        }
        Ok(parent)
    }

    /// Drop `path` and everything below it from the cache.
    pub fn evict_prefix(&self, path: &str) {
        let Ok(mut cache) = self.cache.write() else {
            return;
        };
        let prefix = format!("{}/", path);
        cache.retain(|dir, _| dir != path && !dir.starts_with(&prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemSession;
    use crate::session::DbSession;
    use std::sync::Arc;

    async fn add_dir(session: &MemSession, parent: &str, name: &str) -> String {
        let id = Uuid::now_v7();
        session
            .insert_entry(parent, name, id.as_bytes(), b"{}")
            .await
            .unwrap();
        id.to_string()
    }

    #[tokio::test]
    async fn test_walks_segments() {
        let session = Arc::new(MemSession::new());
        let a = add_dir(&session, "", "a").await;
        let b = add_dir(&session, &a, "b").await;
        let resolver = DirResolver::new(session.clone());
        assert_eq!(resolver.find_dir("").await.unwrap(), "");
        assert_eq!(resolver.find_dir("a").await.unwrap(), a);
        assert_eq!(resolver.find_dir("a/b").await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_missing_segment_is_not_found() {
        let session = Arc::new(MemSession::new());
        add_dir(&session, "", "a").await;
        let resolver = DirResolver::new(session);
        assert!(resolver.find_dir("a/missing").await.unwrap_err().is_not_found());
        assert!(resolver.find_dir("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_positive_cache_survives_row_deletion() {
        let session = Arc::new(MemSession::new());
        let a = add_dir(&session, "", "a").await;
        let resolver = DirResolver::new(session.clone());
        assert_eq!(resolver.find_dir("a").await.unwrap(), a);
        session.delete_entry("", "a").await.unwrap();
        // still served from the cache until evicted
        assert_eq!(resolver.find_dir("a").await.unwrap(), a);
        resolver.evict_prefix("a");
        assert!(resolver.find_dir("a").await.is_err());
    }

    #[tokio::test]
    async fn test_evict_prefix_covers_subtree() {
        let session = Arc::new(MemSession::new());
        let a = add_dir(&session, "", "a").await;
        let b = add_dir(&session, &a, "b").await;
        add_dir(&session, "", "ab").await;
        let resolver = DirResolver::new(session.clone());
        resolver.find_dir("a/b").await.unwrap();
        resolver.find_dir("a").await.unwrap();
        let ab = resolver.find_dir("ab").await.unwrap();
        resolver.evict_prefix("a");
        session.delete_entry("", "a").await.unwrap();
        assert!(resolver.find_dir("a").await.is_err());
        assert!(resolver.find_dir("a/b").await.is_err());
        // sibling with a shared name prefix is untouched
        assert_eq!(resolver.find_dir("ab").await.unwrap(), ab);
        let _ = b;
    }
}
