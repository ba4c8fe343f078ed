//! # Page Cache
//!
//! LRU object cache for pages, keyed by logical page id. Entries are
//! reference-counted page buffers; an entry is *evictable* only while the
//! cache holds the sole reference, so a page handed out to a reader (or
//! pinned by a cursor under a live snapshot) cannot be torn out from under
//! it.
//!
//! ## Eviction
//!
//! On insert, while the cache exceeds its entry limit the oldest entry is
//! inspected. If it is unevictable it is moved to the back of the LRU order
//! and eviction stops for this insertion (the scan does not continue past a
//! pinned entry). Otherwise it is removed. The just-inserted entry is at
//! the back of the order, so it is never the inspection candidate.
//!
//! `clear()` drops every entry at once. Outstanding references keep their
//! buffers alive independently of the cache, so no teardown coordination is
//! required.
//!
//! ## Hit accounting
//!
//! `get` promotes and counts a hit unless `no_hit` is set (used for
//! speculative prefetch so read-ahead does not distort the LRU order).
//! `get_if_exists` neither promotes nor counts.

use std::sync::Arc;

use lru::LruCache;

use crate::storage::page::PageBuf;

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub failed_evictions: u64,
}

pub struct PageCache {
    entries: LruCache<u64, Arc<PageBuf>>,
    limit: usize,
    counters: CacheCounters,
}

impl PageCache {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            limit: limit.max(1),
            counters: CacheCounters::default(),
        }
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counters(&self) -> CacheCounters {
        self.counters
    }

    /// Cached page for `id`, promoted to most-recent. Counts a hit unless
    /// `no_hit`.
    pub fn get(&mut self, id: u64, no_hit: bool) -> Option<Arc<PageBuf>> {
        match self.entries.get(&id) {
            Some(page) => {
                if !no_hit {
                    self.counters.hits += 1;
                }
                Some(Arc::clone(page))
            }
            None => {
                self.counters.misses += 1;
                None
            }
        }
    }

    /// Cached page for `id` without touching the eviction order.
    pub fn get_if_exists(&mut self, id: u64) -> Option<Arc<PageBuf>> {
        self.entries.peek(&id).map(Arc::clone)
    }

    /// Inserts (or replaces) the content for `id`, then evicts from the cold
    /// end while over the limit, stopping at the first unevictable entry.
    pub fn insert(&mut self, id: u64, page: Arc<PageBuf>) {
        self.entries.put(id, page);

        while self.entries.len() > self.limit {
            let Some((&old_id, old_page)) = self.entries.peek_lru() else {
                break;
            };
            if Arc::strong_count(old_page) > 1 {
                // In use somewhere; give it another round and stop scanning.
                self.counters.failed_evictions += 1;
                self.entries.promote(&old_id);
                break;
            }
            self.entries.pop_lru();
            self.counters.evictions += 1;
        }
    }

    pub fn remove(&mut self, id: u64) {
        self.entries.pop(&id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
