//! Process-wide cache of chunk payloads.
//!
//! Keyed by `(file id, offset)`, bounded by entry count, evicted by
//! recency. Entries are `Arc<Vec<u8>>`, so a payload handed to a reader
//! stays valid no matter what eviction does afterwards.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A shared, internally synchronized chunk cache.
///
/// Cloning is cheap and yields a handle to the same cache.
#[derive(Debug, Clone)]
pub struct ChunkCache {
    inner: Arc<Mutex<CacheInner>>,
    max_entries: usize,
    max_chunk_length: usize,
}

#[derive(Debug)]
struct CacheInner {
    map: HashMap<(u64, u64), CachedChunk>,
    // Recency queue of (key, generation). Entries whose generation no longer
    // matches the map are stale and skipped during eviction.
    recency: VecDeque<((u64, u64), u64)>,
    clock: u64,
}

#[derive(Debug)]
struct CachedChunk {
    payload: Arc<Vec<u8>>,
    last_used: u64,
}

impl ChunkCache {
    /// Creates a cache holding up to `max_entries` chunks. Chunks larger
    /// than `max_chunk_length` bytes are never cached.
    #[must_use]
    pub fn new(max_entries: usize, max_chunk_length: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                map: HashMap::with_capacity(max_entries),
                recency: VecDeque::with_capacity(max_entries),
                clock: 0,
            })),
            max_entries,
            max_chunk_length,
        }
    }

    /// Looks up the chunk at `offset` in file `file_id`, refreshing its
    /// recency on a hit.
    pub fn get(&self, file_id: u64, offset: u64) -> Option<Arc<Vec<u8>>> {
        let mut guard = self.inner.lock().ok()?;
        let inner = &mut *guard;
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.map.get_mut(&(file_id, offset))?;
        entry.last_used = clock;
        let payload = Arc::clone(&entry.payload);
        inner.recency.push_back(((file_id, offset), clock));
        Some(payload)
    }

    /// Inserts a chunk payload, evicting least-recently-used entries to stay
    /// within bounds. Duplicate inserts are last-writer-wins.
    pub fn insert(&self, file_id: u64, offset: u64, payload: Arc<Vec<u8>>) {
        if payload.len() > self.max_chunk_length {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.clock += 1;
        let clock = inner.clock;
        inner.map.insert(
            (file_id, offset),
            CachedChunk {
                payload,
                last_used: clock,
            },
        );
        inner.recency.push_back(((file_id, offset), clock));
        inner.evict_to(self.max_entries);
    }

    /// Drops every cached chunk belonging to `file_id`. Used when a tree
    /// file is deleted so a recreated file cannot serve stale payloads.
    pub fn invalidate(&self, file_id: u64) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.map.retain(|(id, _), _| *id != file_id);
        inner.recency.retain(|((id, _), _)| *id != file_id);
    }

    /// Returns the number of cached chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    /// Returns true if the cache holds no chunks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn evict_to(&mut self, max_entries: usize) {
        while self.map.len() > max_entries {
            let Some((key, generation)) = self.recency.pop_front() else {
                break;
            };
            // Stale queue entry: the key was touched again later.
            let current = self.map.get(&key).map(|entry| entry.last_used);
            if current == Some(generation) {
                self.map.remove(&key);
            }
        }

        // Keep the recency queue from growing without bound on hot keys.
        if self.recency.len() > max_entries.saturating_mul(8).max(64) {
            let map = &self.map;
            self.recency
                .retain(|(key, generation)| map.get(key).map(|e| e.last_used) == Some(*generation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![byte; 8])
    }

    #[test]
    fn insert_and_get() {
        let cache = ChunkCache::new(16, 1024);
        cache.insert(1, 0, payload(0xAA));

        assert_eq!(cache.get(1, 0).unwrap().as_slice(), &[0xAA; 8]);
        assert!(cache.get(1, 8).is_none());
        assert!(cache.get(2, 0).is_none());
    }

    #[test]
    fn lru_eviction_keeps_recent_entries() {
        let cache = ChunkCache::new(2, 1024);
        cache.insert(1, 0, payload(0));
        cache.insert(1, 8, payload(1));

        // Touch offset 0 so offset 8 is the least recently used.
        cache.get(1, 0).unwrap();
        cache.insert(1, 16, payload(2));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(1, 0).is_some());
        assert!(cache.get(1, 8).is_none());
        assert!(cache.get(1, 16).is_some());
    }

    #[test]
    fn oversized_chunks_are_not_cached() {
        let cache = ChunkCache::new(16, 4);
        cache.insert(1, 0, Arc::new(vec![0u8; 64]));
        assert!(cache.get(1, 0).is_none());
    }

    #[test]
    fn invalidate_drops_only_that_file() {
        let cache = ChunkCache::new(16, 1024);
        cache.insert(1, 0, payload(0));
        cache.insert(2, 0, payload(1));

        cache.invalidate(1);
        assert!(cache.get(1, 0).is_none());
        assert!(cache.get(2, 0).is_some());
    }

    #[test]
    fn duplicate_insert_is_last_writer_wins() {
        let cache = ChunkCache::new(16, 1024);
        cache.insert(1, 0, payload(0));
        cache.insert(1, 0, payload(7));
        assert_eq!(cache.get(1, 0).unwrap().as_slice(), &[7; 8]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn shared_across_clones_and_threads() {
        let cache = ChunkCache::new(64, 1024);
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..16u64 {
                        cache.insert(t, i * 8, Arc::new(vec![t as u8; 8]));
                        cache.get(t, i * 8);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 64);
    }
}
