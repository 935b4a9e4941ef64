//! Sharded LRU cache with byte-weighted entries.
//!
//! Entries carry a *charge*, the byte weight attributed to them; each shard
//! evicts from the cold end of its recency list until its share of the
//! total charge fits the capacity. Lookups hand out `Arc` handles, and an
//! evicted entry's memory is only reclaimed when the last handle drops, so
//! readers never observe a freed block. Entries with outstanding handles
//! are skipped by eviction: the cache may transiently exceed capacity by
//! exactly the charge of pinned entries.
//!
//! The recency list is kept as explicit neighbour indices into a slot
//! arena rather than boxed nodes, so shards stay compact and eviction is
//! pointer-chasing free.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use xxhash_rust::xxh3::Xxh3;

const NUM_SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << NUM_SHARD_BITS;

const NIL: usize = usize::MAX;

struct Entry<K, V> {
    key: K,
    value: Arc<V>,
    charge: usize,
    prev: usize,
    next: usize,
}

struct Shard<K, V> {
    capacity: usize,
    usage: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    /// Most-recently-used end of the recency list.
    head: usize,
    tail: usize,
}

impl<K: Hash + Eq + Clone, V> Shard<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            usage: 0,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn entry(&self, index: usize) -> &Entry<K, V> {
        self.slots[index].as_ref().expect("dangling cache index")
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let e = self.entry(index);
            (e.prev, e.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.slots[p].as_mut().unwrap().next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.slots[n].as_mut().unwrap().prev = prev,
        }
    }

    fn push_front(&mut self, index: usize) {
        {
            let e = self.slots[index].as_mut().unwrap();
            e.prev = NIL;
            e.next = self.head;
        }
        match self.head {
            NIL => self.tail = index,
            h => self.slots[h].as_mut().unwrap().prev = index,
        }
        self.head = index;
    }

    fn remove_slot(&mut self, index: usize) -> Entry<K, V> {
        self.unlink(index);
        let entry = self.slots[index].take().expect("dangling cache index");
        self.free.push(index);
        self.map.remove(&entry.key);
        self.usage -= entry.charge;
        entry
    }

    fn insert(&mut self, key: K, value: Arc<V>, charge: usize) {
        if let Some(&old) = self.map.get(&key) {
            self.remove_slot(old);
        }

        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index] = Some(Entry {
            key: key.clone(),
            value,
            charge,
            prev: NIL,
            next: NIL,
        });
        self.map.insert(key, index);
        self.push_front(index);
        self.usage += charge;
        self.evict_to_fit();
    }

    fn lookup(&mut self, key: &K) -> Option<Arc<V>> {
        let index = *self.map.get(key)?;
        self.unlink(index);
        self.push_front(index);
        Some(Arc::clone(&self.entry(index).value))
    }

    fn erase(&mut self, key: &K) {
        if let Some(&index) = self.map.get(key) {
            self.remove_slot(index);
        }
    }

    /// Evicts cold, unpinned entries until usage fits capacity.
    fn evict_to_fit(&mut self) {
        let mut cursor = self.tail;
        while self.usage > self.capacity && cursor != NIL {
            let prev = self.entry(cursor).prev;
            if Arc::strong_count(&self.entry(cursor).value) == 1 {
                self.remove_slot(cursor);
            }
            cursor = prev;
        }
    }

    /// Drops every entry without an outstanding handle.
    fn prune(&mut self) {
        let mut cursor = self.tail;
        while cursor != NIL {
            let prev = self.entry(cursor).prev;
            if Arc::strong_count(&self.entry(cursor).value) == 1 {
                self.remove_slot(cursor);
            }
            cursor = prev;
        }
    }
}

/// Thread-safe LRU cache, sharded by key hash to spread lock contention.
pub struct ShardedCache<K, V> {
    shards: Vec<Mutex<Shard<K, V>>>,
    next_id: AtomicU64,
}

impl<K: Hash + Eq + Clone, V> ShardedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        let shards = (0..NUM_SHARDS)
            .map(|_| Mutex::new(Shard::new(per_shard)))
            .collect();
        Self {
            shards,
            next_id: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<Shard<K, V>> {
        let mut hasher = Xxh3::new();
        key.hash(&mut hasher);
        let shard = (hasher.finish() >> (64 - NUM_SHARD_BITS)) as usize;
        &self.shards[shard]
    }

    /// Inserts and returns a handle to the cached value.
    pub fn insert(&self, key: K, value: V, charge: usize) -> Arc<V> {
        let value = Arc::new(value);
        let handle = Arc::clone(&value);
        self.shard(&key)
            .lock()
            .expect("cache mutex poisoned")
            .insert(key, value, charge);
        handle
    }

    pub fn lookup(&self, key: &K) -> Option<Arc<V>> {
        self.shard(key)
            .lock()
            .expect("cache mutex poisoned")
            .lookup(key)
    }

    pub fn erase(&self, key: &K) {
        self.shard(key)
            .lock()
            .expect("cache mutex poisoned")
            .erase(key);
    }

    /// Removes every unpinned entry.
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.lock().expect("cache mutex poisoned").prune();
        }
    }

    pub fn total_charge(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("cache mutex poisoned").usage)
            .sum()
    }

    /// Hands out a process-unique prefix for composing cache keys.
    pub fn new_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
