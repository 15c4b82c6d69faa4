use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use log::warn;

static GROUPS: OnceLock<Mutex<HashMap<String, Arc<BodyCache>>>> = OnceLock::new();

/// Fetch or create the process-wide cache group `name`. The first caller
/// fixes the byte budget; later callers share the same group.
pub fn group(name: &str, size_bytes: u64) -> Arc<BodyCache> {
    let groups = GROUPS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = match groups.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    map.entry(name.to_string())
        .or_insert_with(|| Arc::new(BodyCache::new(name.to_string(), size_bytes)))
        .clone()
}

struct CacheSlot {
    data: Arc<Vec<u8>>,
    seq: u64,
}

#[derive(Default)]
struct CacheInner {
    used: u64,
    next_seq: u64,
    slots: HashMap<Vec<u8>, CacheSlot>,
}

/// Read-through cache of file bodies keyed by content hash, bounded by a
/// byte budget. Eviction drops the slot with the lowest access sequence
/// number.
pub struct BodyCache {
    name: String,
    capacity: u64,
    inner: Mutex<CacheInner>,
}

impl BodyCache {
    fn new(name: String, capacity: u64) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, hash: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().ok()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let slot = inner.slots.get_mut(hash)?;
        slot.seq = seq;
        Some(slot.data.as_ref().clone())
    }

    pub fn put(&self, hash: &[u8], data: &[u8]) {
        if data.len() as u64 > self.capacity {
            return;
        }
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("cache group {} poisoned, dropping entry", self.name);
                return;
            }
        };
        if inner.slots.contains_key(hash) {
            return;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.used += data.len() as u64;
        inner.slots.insert(
            hash.to_vec(),
            CacheSlot {
                data: Arc::new(data.to_vec()),
                seq,
            },
        );
        while inner.used > self.capacity {
            let oldest = inner
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.seq)
                .map(|(hash, _)| hash.clone());
            let Some(key) = oldest else { break };
            if let Some(slot) = inner.slots.remove(&key) {
                inner.used -= slot.data.len() as u64;
            }
        }
    }

    #[cfg(test)]
    fn used_bytes(&self) -> u64 {
        self.inner.lock().map(|inner| inner.used).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss() {
        let cache = BodyCache::new("t".to_string(), 1024);
        assert!(cache.get(b"h1").is_none());
        cache.put(b"h1", b"body");
        assert_eq!(cache.get(b"h1").unwrap(), b"body");
    }

    #[test]
    fn test_budget_eviction_drops_least_recent() {
        let cache = BodyCache::new("t".to_string(), 10);
        cache.put(b"a", &[1u8; 4]);
        cache.put(b"b", &[2u8; 4]);
        // touch "a" so "b" is the eviction candidate
        assert!(cache.get(b"a").is_some());
        cache.put(b"c", &[3u8; 4]);
        assert!(cache.get(b"b").is_none());
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"c").is_some());
        assert!(cache.used_bytes() <= 10);
    }

    #[test]
    fn test_oversized_body_not_cached() {
        let cache = BodyCache::new("t".to_string(), 4);
        cache.put(b"big", &[0u8; 8]);
        assert!(cache.get(b"big").is_none());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_named_groups_are_shared() {
        let a = group("7:test-shared", 64);
        let b = group("7:test-shared", 4096);
        a.put(b"h", b"x");
        assert_eq!(b.get(b"h").unwrap(), b"x");
    }
}
