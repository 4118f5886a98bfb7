//! Byte-budgeted LRU cache of uploaded mesh resources.
//!
//! The cache owns opaque resource handles keyed by file identity and tracks
//! a caller-supplied approximate byte size per resource; it never inspects
//! resource internals. When an insertion pushes the tracked total over the
//! budget, least-recently-used entries are evicted synchronously and their
//! handles passed to a disposal callback, so the budget invariant holds the
//! moment `insert` returns.
//!
//! Insertion order doubles as the LRU queue: `insert` and `touch` move a
//! key to the most-recently-used end. An evicted entry is logically absent;
//! `get` on it is a miss and the caller reloads.

use std::collections::HashMap;

/// Disposal callback releasing an evicted resource's opaque handle.
pub type DisposeFn<H> = Box<dyn FnMut(&str, H) + Send>;

/// LRU, byte-budgeted cache of opaque resource handles.
pub struct MeshResourceCache<H> {
    entries: HashMap<String, Slot<H>>,
    /// LRU queue, least-recently-used first.
    order: Vec<String>,
    total_bytes: usize,
    budget: usize,
    placeholder: Option<String>,
    log_evictions: bool,
    on_dispose: DisposeFn<H>,
    clock: u64,
}

struct Slot<H> {
    handle: H,
    approx_bytes: usize,
    last_used: u64,
}

impl<H> MeshResourceCache<H> {
    /// Create a cache with a byte budget and a disposal callback.
    #[must_use]
    pub fn new(budget: usize, on_dispose: DisposeFn<H>) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            total_bytes: 0,
            budget,
            placeholder: None,
            log_evictions: false,
            on_dispose,
            clock: 0,
        }
    }

    /// Pin a key that eviction always skips (the shared placeholder mesh).
    pub fn set_placeholder_key(&mut self, key: Option<String>) {
        self.placeholder = key;
    }

    /// Toggle a debug log line per eviction.
    pub fn set_log_evictions(&mut self, enabled: bool) {
        self.log_evictions = enabled;
    }

    /// Change the byte budget. Takes effect immediately: entries are
    /// evicted at once if the new budget is already exceeded.
    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
        self.evict_to_fit();
    }

    /// The configured byte budget.
    #[must_use]
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Total tracked bytes across live entries.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a live resource. An evicted entry is a miss; the caller is
    /// expected to reload and re-insert. Does not affect LRU order — call
    /// [`touch`] to mark use.
    ///
    /// [`touch`]: MeshResourceCache::touch
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&H> {
        self.entries.get(key).map(|slot| &slot.handle)
    }

    /// Mark a key as most recently used.
    pub fn touch(&mut self, key: &str) {
        if let Some(slot) = self.entries.get_mut(key) {
            self.clock += 1;
            slot.last_used = self.clock;
            move_to_back(&mut self.order, key);
        }
    }

    /// Insert a resource, replacing (and disposing) any previous resource
    /// under the same key, then evict until the byte budget holds.
    pub fn insert(&mut self, key: impl Into<String>, handle: H, approx_bytes: usize) {
        let key = key.into();
        if let Some(old) = self.entries.remove(&key) {
            self.total_bytes -= old.approx_bytes;
            (self.on_dispose)(&key, old.handle);
            self.order.retain(|k| k != &key);
        }

        self.clock += 1;
        self.entries.insert(
            key.clone(),
            Slot {
                handle,
                approx_bytes,
                last_used: self.clock,
            },
        );
        self.total_bytes += approx_bytes;
        self.order.push(key);

        self.evict_to_fit();
    }

    /// Evict least-recently-used entries until the tracked total fits the
    /// budget or nothing evictable remains. The pinned placeholder entry is
    /// skipped.
    pub fn evict_to_fit(&mut self) {
        while self.total_bytes > self.budget {
            let victim = self
                .order
                .iter()
                .position(|key| Some(key.as_str()) != self.placeholder.as_deref());
            let Some(index) = victim else {
                break;
            };
            let key = self.order.remove(index);
            let slot = self.entries.remove(&key).expect("order key has an entry");
            self.total_bytes -= slot.approx_bytes;
            if self.log_evictions {
                tracing::debug!(
                    key = %key,
                    bytes = slot.approx_bytes,
                    last_used = slot.last_used,
                    total = self.total_bytes,
                    "evicting mesh resource"
                );
            }
            (self.on_dispose)(&key, slot.handle);
        }
    }
}

/// Move `key` to the most-recently-used end of the order queue.
fn move_to_back(order: &mut Vec<String>, key: &str) {
    if let Some(index) = order.iter().position(|k| k == key) {
        let key = order.remove(index);
        order.push(key);
    }
}
