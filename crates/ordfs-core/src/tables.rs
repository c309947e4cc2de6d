//! Keyed indexes over the dependency arenas.
//!
//! Three of these exist: directory pages by (mount, inode, logical block),
//! inode records by (filesystem, inode), and transient new-block records by
//! (filesystem, block number). The engine lock serializes all access; the
//! per-key creation gate lives beside the index in the engine core, not
//! here.
//!
//! Buckets are explicit so that `resize` is an observable operation with a
//! checkable contract: every entry is rehashed into the new table, none is
//! lost, none is duplicated.

use ordfs_types::{BlockNo, FsId, InodeNum, LogicalBlock, MountId};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub mount: MountId,
    pub ino: InodeNum,
    pub lbn: LogicalBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub fs: FsId,
    pub ino: InodeNum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub fs: FsId,
    pub blkno: BlockNo,
}

#[derive(Debug)]
pub struct DepIndex<K, V> {
    buckets: Vec<Vec<(K, V)>>,
    len: usize,
}

impl<K: Hash + Eq + Copy, V: Copy> DepIndex<K, V> {
    /// `buckets` must be a nonzero power of two.
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        assert!(
            buckets.is_power_of_two(),
            "index bucket count must be a power of two, got {buckets}"
        );
        Self {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    fn bucket_of(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.buckets.len() - 1)
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let bucket = &self.buckets[self.bucket_of(key)];
        bucket.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    /// Insert a new entry. A duplicate key means two records exist for one
    /// identity — the graph is corrupt.
    pub fn insert(&mut self, key: K, value: V) {
        let idx = self.bucket_of(&key);
        let bucket = &mut self.buckets[idx];
        assert!(
            !bucket.iter().any(|(k, _)| *k == key),
            "duplicate dependency index entry"
        );
        bucket.push((key, value));
        self.len += 1;
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.bucket_of(key);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.iter().position(|(k, _)| k == key)?;
        self.len -= 1;
        Some(bucket.swap_remove(pos).1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// First entry in bucket order, if any. Used by the background cleaner
    /// to pick a victim.
    #[must_use]
    pub fn first(&self) -> Option<(K, V)> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .next()
            .map(|(k, v)| (*k, *v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .map(|(k, v)| (*k, *v))
    }

    /// Rehash every entry into a table of `new_buckets` buckets.
    pub fn resize(&mut self, new_buckets: usize) {
        assert!(
            new_buckets.is_power_of_two(),
            "index bucket count must be a power of two, got {new_buckets}"
        );
        let old = std::mem::replace(
            &mut self.buckets,
            (0..new_buckets).map(|_| Vec::new()).collect(),
        );
        let old_len = self.len;
        self.len = 0;
        for (key, value) in old.into_iter().flatten() {
            self.insert(key, value);
        }
        assert_eq!(self.len, old_len, "index resize lost or duplicated entries");
    }
}
