//! Fixed-bucket hash map.
//!
//! The bucket count is chosen once (a prime such as 251 keeps modulo hashing
//! of sequential keys well spread) and never changes, so the table never
//! rehashes behind a lock. Short chains live inline in a [`SmallVec`].

use smallvec::SmallVec;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

type Chain<K, V> = SmallVec<[(K, V); 2]>;

#[derive(Debug)]
pub struct BucketMap<K, V> {
    buckets: Vec<Chain<K, V>>,
    len: usize,
}

impl<K: Hash + Eq, V> BucketMap<K, V> {
    /// Creates a map with `buckets` chains (at least one).
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: (0..buckets).map(|_| SmallVec::new()).collect(),
            len: 0,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `value`, returning the previous value stored under `key`.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let chain = self.chain_mut(&key);
        if let Some((_, slot)) = chain.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(slot, value));
        }
        chain.push((key, value));
        self.len += 1;
        None
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.buckets[self.bucket_of(key)]
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let chain = self.chain_mut(key);
        let pos = chain.iter().position(|(k, _)| k == key)?;
        let (_, value) = chain.swap_remove(pos);
        self.len -= 1;
        Some(value)
    }

    /// Longest chain; useful to judge the bucket count.
    pub fn max_chain(&self) -> usize {
        self.buckets.iter().map(|c| c.len()).max().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets
            .iter()
            .flat_map(|chain| chain.iter().map(|(k, v)| (k, v)))
    }

    fn chain_mut(&mut self, key: &K) -> &mut Chain<K, V> {
        let bucket = self.bucket_of(key);
        &mut self.buckets[bucket]
    }

    fn bucket_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.buckets.len() as u64) as usize
    }
}
