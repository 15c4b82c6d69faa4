use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::store::FileRecord;

struct MetaEntry {
    record: FileRecord,
    stored_at: Instant,
}

/// Path-keyed cache of decoded namespace rows with a freshness TTL checked
/// on every lookup. Stale entries are evicted in place. A zero TTL turns
/// the cache off.
pub(crate) struct MetaCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, MetaEntry>>,
}

impl MetaCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, path: &str) -> Option<FileRecord> {
        {
            let map = self.entries.read().ok()?;
            let entry = map.get(path)?;
            if entry.stored_at.elapsed() < self.ttl {
                return Some(entry.record.clone());
            }
        }
        self.evict(path);
        None
    }

    pub(crate) fn put(&self, path: &str, record: FileRecord) {
        if self.ttl.is_zero() {
            return;
        }
        if let Ok(mut map) = self.entries.write() {
            map.insert(
                path.to_string(),
                MetaEntry {
                    record,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    pub(crate) fn evict(&self, path: &str) {
        if let Ok(mut map) = self.entries.write() {
            map.remove(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colfs_lib::{EntryAttr, EntryMeta};

    fn record() -> FileRecord {
        FileRecord {
            hash: vec![1, 2, 3],
            meta: EntryMeta::new(EntryAttr::new_file(0o644, 0, 0)),
        }
    }

    #[test]
    fn test_fresh_entry_hits() {
        let cache = MetaCache::new(Duration::from_secs(60));
        cache.put("a", record());
        let hit = cache.get("a").unwrap();
        assert_eq!(hit.hash, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let cache = MetaCache::new(Duration::ZERO);
        cache.put("a", record());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_evict() {
        let cache = MetaCache::new(Duration::from_secs(60));
        cache.put("a", record());
        cache.evict("a");
        assert!(cache.get("a").is_none());
    }
}
