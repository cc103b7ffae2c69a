//! B-tree node layout: key records with tiny/small/empty/extended
//! encoding, and the node header fields spec §3/§4.7 name explicitly.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Rid;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyRecordFlags: u8 {
        const TINY = 0x01;
        const SMALL = 0x02;
        const EMPTY = 0x04;
        const HAS_DUPLICATES = 0x08;
        const EXTENDED = 0x10;
        /// Set only on values returned by `find`, never persisted: the
        /// match was approximate (`HAM_FIND_LT_MATCH`/`GT_MATCH`).
        const APPROXIMATE = 0x20;
    }
}

/// One `(key, payload)` entry. For a leaf node, `rid` is the record's
/// payload rid (a blob, a duplicate table, or ignored when the payload
/// is inline in `flags`/the record itself, tracked by the owning
/// database, not here). For an internal node, `rid` is the rid of the
/// child subtree to the right of this key.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub key: Vec<u8>,
    /// For a blob-backed payload, the blob's rid. For a `TINY`/`SMALL`
    /// payload, the payload bytes themselves, packed little-endian into
    /// the 8 bytes a `Rid` already occupies (spec §4.6); `EMPTY` ignores
    /// this field entirely.
    pub rid: Rid,
    pub flags: KeyRecordFlags,
    /// Set when `key.len()` exceeds the node's inline key capacity; the
    /// full key bytes live in an extended-key blob at this rid, and
    /// `key` holds only the inline prefix.
    pub extended_rid: Rid,
    /// Exact payload length when `flags` carries `TINY` (1-7) or `SMALL`
    /// (always 8); unused otherwise, since `rid` alone can't tell a
    /// `TINY` payload's true length from its zero padding.
    pub inline_len: u8,
}

impl KeyRecord {
    pub fn leaf(key: Vec<u8>, rid: Rid, flags: KeyRecordFlags) -> Self {
        KeyRecord {
            key,
            rid,
            flags,
            extended_rid: Rid::NONE,
            inline_len: 0,
        }
    }

    pub fn internal(key: Vec<u8>, child_rid: Rid) -> Self {
        KeyRecord {
            key,
            rid: child_rid,
            flags: KeyRecordFlags::empty(),
            extended_rid: Rid::NONE,
            inline_len: 0,
        }
    }

    pub fn is_extended(&self) -> bool {
        self.flags.contains(KeyRecordFlags::EXTENDED)
    }

    pub fn is_inline_payload(&self) -> bool {
        self.flags.intersects(KeyRecordFlags::EMPTY | KeyRecordFlags::TINY | KeyRecordFlags::SMALL)
    }
}

/// One btree-root/btree-node page's logical contents (spec §3: "count,
/// left sibling rid, right sibling rid, parent rid, leaf flag, followed
/// by a sequence of key records").
#[derive(Debug, Clone)]
pub struct BtreeNode {
    pub is_leaf: bool,
    pub left_sibling: Rid,
    pub right_sibling: Rid,
    pub parent: Rid,
    /// Only meaningful for internal nodes: the child covering keys less
    /// than `records[0].key`.
    pub first_child: Rid,
    pub records: Vec<KeyRecord>,
}

impl BtreeNode {
    pub fn new_leaf() -> Self {
        BtreeNode {
            is_leaf: true,
            left_sibling: Rid::NONE,
            right_sibling: Rid::NONE,
            parent: Rid::NONE,
            first_child: Rid::NONE,
            records: Vec::new(),
        }
    }

    pub fn new_internal(first_child: Rid) -> Self {
        BtreeNode {
            is_leaf: false,
            left_sibling: Rid::NONE,
            right_sibling: Rid::NONE,
            parent: Rid::NONE,
            first_child,
            records: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Finds the index of the first record whose key is `>=` the search
    /// key under `cmp`, i.e. the standard lower-bound binary search.
    pub fn lower_bound(&self, key: &[u8], cmp: &dyn Fn(&[u8], &[u8]) -> std::cmp::Ordering) -> usize {
        let mut lo = 0usize;
        let mut hi = self.records.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp(&self.records[mid].key, key) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Resolves the child rid to descend into for `key` (internal nodes
    /// only): the largest separator `<= key`, or `first_child` if `key`
    /// precedes every separator.
    pub fn child_for(&self, key: &[u8], cmp: &dyn Fn(&[u8], &[u8]) -> std::cmp::Ordering) -> Rid {
        debug_assert!(!self.is_leaf);
        let idx = self.lower_bound(key, cmp);
        if idx == 0 {
            self.first_child
        } else if idx <= self.records.len() && cmp(&self.records[idx - 1].key, key) != std::cmp::Ordering::Greater
        {
            self.records[idx - 1].rid
        } else {
            self.first_child
        }
    }
}

/// Encodes key bytes for storage in a node, splitting off an extended
/// portion when the key exceeds `inline_capacity` (spec §4.7).
pub fn split_inline(key: &[u8], inline_capacity: usize) -> (Vec<u8>, Option<Vec<u8>>) {
    if key.len() <= inline_capacity {
        (key.to_vec(), None)
    } else {
        (key[..inline_capacity].to_vec(), Some(key.to_vec()))
    }
}

/// Computes the maximum number of keys a node can hold for a given fixed
/// key size and usable page size (spec §4.7: `keysize*maxkeys + header
/// <= usable_pagesize`; rejects `maxkeys > 65535` or `0`).
pub fn max_keys(key_size: u16, usable_page_size: u32, node_header_size: u32) -> Result<u16> {
    if key_size == 0 {
        return Err(Error::new(ErrorCode::InvKeysize));
    }
    let available = usable_page_size.saturating_sub(node_header_size);
    let n = available / key_size as u32;
    if n == 0 || n > 65535 {
        return Err(Error::new(ErrorCode::InvKeysize));
    }
    Ok(n as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        a.cmp(b)
    }

    #[test]
    fn lower_bound_finds_insertion_point() {
        let mut node = BtreeNode::new_leaf();
        node.records.push(KeyRecord::leaf(vec![1], Rid::from(8), KeyRecordFlags::empty()));
        node.records.push(KeyRecord::leaf(vec![3], Rid::from(16), KeyRecordFlags::empty()));
        node.records.push(KeyRecord::leaf(vec![5], Rid::from(24), KeyRecordFlags::empty()));
        assert_eq!(node.lower_bound(&[0], &cmp), 0);
        assert_eq!(node.lower_bound(&[3], &cmp), 1);
        assert_eq!(node.lower_bound(&[4], &cmp), 2);
        assert_eq!(node.lower_bound(&[9], &cmp), 3);
    }

    #[test]
    fn child_for_resolves_separators() {
        let mut node = BtreeNode::new_internal(Rid::from(100));
        node.records.push(KeyRecord::internal(vec![10], Rid::from(200)));
        node.records.push(KeyRecord::internal(vec![20], Rid::from(300)));
        assert_eq!(node.child_for(&[5], &cmp), Rid::from(100));
        assert_eq!(node.child_for(&[10], &cmp), Rid::from(200));
        assert_eq!(node.child_for(&[15], &cmp), Rid::from(200));
        assert_eq!(node.child_for(&[25], &cmp), Rid::from(300));
    }

    #[test]
    fn max_keys_respects_budget() {
        assert_eq!(max_keys(32, 4096, 20).unwrap(), (4096 - 20) / 32);
        assert!(max_keys(0, 4096, 20).is_err());
        assert!(max_keys(1, 4096, 20).is_ok());
    }
}
