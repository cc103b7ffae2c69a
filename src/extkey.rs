//! Extended-key cache: per-database `rid -> (size, bytes)` lookup with
//! external chaining, so a long key's overflow bytes don't round-trip
//! through the blob store on every comparison (spec §4.8).

use std::collections::HashMap;

use tracing::trace;

use crate::blob::{self, BlobStorage};
use crate::error::Result;
use crate::types::Rid;

const MAX_AGE: u64 = 5;
const MAX_CHAIN_LENGTH: usize = 3;

struct Entry {
    bytes: Vec<u8>,
    last_access: u64,
}

/// Maps extended-key rids to their cached bytes. Chains are kept short by
/// purging on insert rather than on a background sweep.
pub struct ExtKeyCache {
    chains: HashMap<u64, Vec<(Rid, Entry)>>,
}

impl ExtKeyCache {
    pub fn new() -> Self {
        ExtKeyCache {
            chains: HashMap::new(),
        }
    }

    fn bucket(rid: Rid) -> u64 {
        rid.0
    }

    /// Returns the cached bytes for `rid`, touching its last-access
    /// stamp, or `None` on a miss.
    pub fn get(&mut self, rid: Rid, current_txn: u64) -> Option<Vec<u8>> {
        let chain = self.chains.get_mut(&Self::bucket(rid))?;
        let slot = chain.iter_mut().find(|(r, _)| *r == rid)?;
        slot.1.last_access = current_txn;
        Some(slot.1.bytes.clone())
    }

    /// Inserts or refreshes the cached bytes for `rid`. Purges stale and
    /// overlong entries in this rid's chain first.
    pub fn insert(&mut self, rid: Rid, bytes: Vec<u8>, current_txn: u64) {
        let chain = self.chains.entry(Self::bucket(rid)).or_default();
        chain.retain(|(_, e)| current_txn.saturating_sub(e.last_access) <= MAX_AGE);
        if let Some(slot) = chain.iter_mut().find(|(r, _)| *r == rid) {
            slot.1.bytes = bytes;
            slot.1.last_access = current_txn;
            return;
        }
        while chain.len() >= MAX_CHAIN_LENGTH {
            trace!(rid = rid.0, "evicting tail of extended-key chain");
            chain.pop();
        }
        chain.insert(
            0,
            (
                rid,
                Entry {
                    bytes,
                    last_access: current_txn,
                },
            ),
        );
    }

    pub fn remove(&mut self, rid: Rid) {
        if let Some(chain) = self.chains.get_mut(&Self::bucket(rid)) {
            chain.retain(|(r, _)| *r != rid);
        }
    }

    /// Fetches the extended key's bytes, consulting the cache first and
    /// falling back to the blob store on a miss.
    pub fn fetch(
        &mut self,
        storage: &mut dyn BlobStorage,
        rid: Rid,
        current_txn: u64,
    ) -> Result<Vec<u8>> {
        if let Some(cached) = self.get(rid, current_txn) {
            return Ok(cached);
        }
        let bytes = blob::read(storage, rid)?;
        self.insert(rid, bytes.clone(), current_txn);
        Ok(bytes)
    }
}

impl Default for ExtKeyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct FakeStorage {
        next: u64,
        blobs: StdHashMap<u64, Vec<u8>>,
    }

    impl BlobStorage for FakeStorage {
        fn alloc_chunk(&mut self, _size: u64) -> Result<Rid> {
            self.next += 32;
            Ok(Rid::from(self.next))
        }

        fn free_chunk(&mut self, rid: Rid, _size: u64) -> Result<()> {
            self.blobs.remove(&rid.0);
            Ok(())
        }

        fn read_raw(&mut self, rid: Rid, buf: &mut [u8]) -> Result<()> {
            let data = &self.blobs[&rid.0];
            buf.copy_from_slice(&data[..buf.len()]);
            Ok(())
        }

        fn write_raw(&mut self, rid: Rid, buf: &[u8]) -> Result<()> {
            let entry = self.blobs.entry(rid.0).or_insert_with(|| vec![0u8; buf.len()]);
            if entry.len() < buf.len() {
                entry.resize(buf.len(), 0);
            }
            entry[..buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn insert_then_get_hits_cache() {
        let mut cache = ExtKeyCache::new();
        cache.insert(Rid::from(32), b"hello".to_vec(), 1);
        assert_eq!(cache.get(Rid::from(32), 1), Some(b"hello".to_vec()));
    }

    #[test]
    fn chain_caps_at_max_length() {
        let mut cache = ExtKeyCache::new();
        // Force all four rids into the same bucket by hashing manually:
        // use rids whose bucket collides via a shared chain key instead.
        for i in 0..5u64 {
            cache.chains.entry(0).or_default().insert(
                0,
                (
                    Rid::from(i + 1),
                    Entry {
                        bytes: vec![i as u8],
                        last_access: 1,
                    },
                ),
            );
        }
        cache.insert(Rid::from(99), vec![9], 1);
        let chain = cache.chains.get(&0).unwrap();
        assert!(chain.len() <= MAX_CHAIN_LENGTH + 1);
    }

    #[test]
    fn stale_entries_are_purged_on_insert() {
        let mut cache = ExtKeyCache::new();
        cache.insert(Rid::from(32), b"old".to_vec(), 1);
        cache.insert(Rid::from(64), b"new".to_vec(), 100);
        assert_eq!(cache.get(Rid::from(32), 100), None);
        assert_eq!(cache.get(Rid::from(64), 100), Some(b"new".to_vec()));
    }

    #[test]
    fn fetch_falls_back_to_blob_storage_on_miss() {
        let mut storage = FakeStorage::default();
        let rid = blob::allocate(&mut storage, b"overflow bytes").unwrap();
        let mut cache = ExtKeyCache::new();
        let bytes = cache.fetch(&mut storage, rid, 1).unwrap();
        assert_eq!(bytes, b"overflow bytes");
        assert_eq!(cache.get(rid, 1), Some(b"overflow bytes".to_vec()));
    }
}
