//! Fixed-capacity recency cache with O(1) get/put.

use std::hash::Hash;

use rustc_hash::FxHashMap;

const NIL: usize = usize::MAX;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// Least-recently-used cache backed by a slab and an intrusive recency list.
pub struct RecencyCache<K, V> {
    map: FxHashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    head: usize, // most recent
    tail: usize, // least recent
    cap: usize,
    evicted: u64,
}

impl<K: Hash + Eq + Clone, V> RecencyCache<K, V> {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            map: FxHashMap::default(),
            slots: Vec::with_capacity(cap),
            head: NIL,
            tail: NIL,
            cap,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn capacity(&self) -> usize { self.cap }
    pub fn evicted(&self) -> u64 { self.evicted }

    pub fn contains(&self, key: &K) -> bool { self.map.contains_key(key) }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        Some(&self.slots[idx].value)
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|&idx| &self.slots[idx].value)
    }

    /// Insert or replace; evicts the least recently used entry when full.
    pub fn put(&mut self, key: K, value: V) {
        if let Some(&idx) = self.map.get(&key) {
            self.slots[idx].value = value;
            self.detach(idx);
            self.push_front(idx);
            return;
        }
        let idx = if self.slots.len() < self.cap {
            self.slots.push(Slot { key: key.clone(), value, prev: NIL, next: NIL });
            self.slots.len() - 1
        } else {
            // Reuse the tail slot.
            let idx = self.tail;
            self.detach(idx);
            let old = std::mem::replace(
                &mut self.slots[idx],
                Slot { key: key.clone(), value, prev: NIL, next: NIL },
            );
            self.map.remove(&old.key);
            self.evicted += 1;
            idx
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev != NIL { self.slots[prev].next = next; } else { self.head = next; }
        if next != NIL { self.slots[next].prev = prev; } else { self.tail = prev; }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].next = self.head;
        if self.head != NIL { self.slots[self.head].prev = idx; }
        self.head = idx;
        if self.tail == NIL { self.tail = idx; }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut c = RecencyCache::with_capacity(2);
        c.put("a", 1);
        c.put("b", 2);
        assert_eq!(c.get(&"a"), Some(&1)); // b is now the oldest
        c.put("c", 3);
        assert!(c.contains(&"a"));
        assert!(!c.contains(&"b"));
        assert!(c.contains(&"c"));
        assert_eq!(c.len(), 2);
        assert_eq!(c.evicted(), 1);
    }

    #[test]
    fn put_existing_replaces_and_refreshes() {
        let mut c = RecencyCache::with_capacity(2);
        c.put("a", 1);
        c.put("b", 2);
        c.put("a", 10);
        c.put("c", 3);
        assert_eq!(c.peek(&"a"), Some(&10));
        assert!(!c.contains(&"b"));
    }

    #[test]
    fn capacity_one_keeps_latest() {
        let mut c = RecencyCache::with_capacity(0);
        assert_eq!(c.capacity(), 1);
        c.put(1u32, "x");
        c.put(2u32, "y");
        assert_eq!(c.len(), 1);
        assert_eq!(c.peek(&2), Some(&"y"));
        assert_eq!(c.peek(&1), None);
    }
}
