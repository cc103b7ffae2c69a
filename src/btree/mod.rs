//! Ordered paged index: splits/merges, extended keys, approximate match
//! (spec §4.7).
//!
//! Node storage is abstracted behind `NodeStorage` the same way
//! `blob.rs` abstracts over `BlobStorage`: this module reasons about
//! keys and rids, never about how a node becomes page bytes, and its
//! comparator sees exactly whatever bytes land in `KeyRecord::key`. The
//! owning database decides what those bytes are: for a key within the
//! database's inline capacity they're the full key, and for a longer key
//! they're the truncated prefix `split_inline` produces, with the rest
//! resolved separately through `extended_rid` (DESIGN.md).

pub mod codec;
pub mod node;

use std::cmp::Ordering;

use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::types::{CallFlags, Dam, Rid};

pub use node::{BtreeNode, KeyRecord, KeyRecordFlags};

pub trait NodeStorage {
    fn alloc_node(&mut self) -> Result<Rid>;
    fn free_node(&mut self, rid: Rid) -> Result<()>;
    fn read_node(&mut self, rid: Rid) -> Result<BtreeNode>;
    fn write_node(&mut self, rid: Rid, node: &BtreeNode) -> Result<()>;
}

/// Notified before a leaf record is invalidated by a split, merge, or
/// erase-driven shift, so coupled cursors can uncouple first (spec
/// §4.7 "Cursors on the b-tree").
pub trait StructuralObserver {
    fn on_leaf_invalidated(&mut self, _leaf_rid: Rid, _index: usize) {}
    fn on_node_freed(&mut self, _rid: Rid) {}
}

pub struct NullObserver;
impl StructuralObserver for NullObserver {}

/// Which side of an inexact match to serve (spec §4.7 `find`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSide {
    Exact,
    LessThan,
    GreaterThan,
}

pub struct Btree {
    pub root: Rid,
    pub max_keys: u16,
    min_keys: u16,
    dam: Dam,
    cmp: Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>,
}

impl Btree {
    pub fn new(
        root: Rid,
        max_keys: u16,
        cmp: Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>,
    ) -> Self {
        Btree {
            root,
            max_keys,
            min_keys: (max_keys / 3).max(1),
            dam: Dam::Unknown,
            cmp,
        }
    }

    pub fn set_dam(&mut self, dam: Dam) {
        self.dam = dam;
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.cmp)(a, b)
    }

    /// Descends from the root to the leaf that would contain `key`,
    /// returning the ancestor chain (root-to-parent-of-leaf, in order)
    /// and the leaf's rid.
    fn descend(&self, storage: &mut dyn NodeStorage, key: &[u8]) -> Result<(Vec<Rid>, Rid)> {
        let mut ancestors = Vec::new();
        let mut current = self.root;
        loop {
            let node = storage.read_node(current)?;
            if node.is_leaf {
                return Ok((ancestors, current));
            }
            ancestors.push(current);
            current = node.child_for(key, &|a, b| self.compare(a, b));
        }
    }

    fn split_point(&self, count: usize) -> usize {
        match self.dam {
            Dam::SequentialInsert => count.saturating_sub(1).max(1),
            _ => count / 2,
        }
    }

    /// Splits `node` (currently living at `own_rid`) in place: `node` is
    /// mutated to hold the left half, and the right half is returned as
    /// a freshly allocated sibling along with the key to promote to the
    /// parent.
    fn split_node(
        &self,
        storage: &mut dyn NodeStorage,
        own_rid: Rid,
        node: &mut BtreeNode,
    ) -> Result<(Rid, Vec<u8>, BtreeNode)> {
        let mid = self.split_point(node.records.len());
        let new_rid = storage.alloc_node()?;

        let (separator, mut right_records, right_first_child) = if node.is_leaf {
            let right = node.records.split_off(mid);
            (right[0].key.clone(), right, Rid::NONE)
        } else {
            let mut right = node.records.split_off(mid);
            // The promoted key's rid was the child right of it; that
            // child becomes the new node's leftmost child.
            let promoted = right.remove(0);
            (promoted.key, right, promoted.rid)
        };

        let mut right_node = if node.is_leaf {
            BtreeNode::new_leaf()
        } else {
            BtreeNode::new_internal(right_first_child)
        };
        right_node.records.append(&mut right_records);
        right_node.parent = node.parent;
        right_node.left_sibling = own_rid;
        right_node.right_sibling = node.right_sibling;
        node.right_sibling = new_rid;

        trace!(own_rid = own_rid.0, new_rid = new_rid.0, "split btree node");
        Ok((new_rid, separator, right_node))
    }

    /// Inserts (or overwrites) one key/record pair. `record.flags`
    /// carries the caller's inline/duplicate classification; `flags`
    /// governs overwrite/duplicate-attach behavior on an exact match.
    pub fn insert(
        &mut self,
        storage: &mut dyn NodeStorage,
        observer: &mut dyn StructuralObserver,
        mut record: KeyRecord,
        flags: CallFlags,
    ) -> Result<()> {
        let (mut ancestors, leaf_rid) = self.descend(storage, &record.key)?;
        let mut leaf = storage.read_node(leaf_rid)?;
        let idx = leaf.lower_bound(&record.key, &|a, b| self.compare(a, b));
        let exact = idx < leaf.records.len() && self.compare(&leaf.records[idx].key, &record.key) == Ordering::Equal;

        if exact {
            if flags.contains(CallFlags::OVERWRITE) || flags.intersects(
                CallFlags::DUPLICATE
                    | CallFlags::DUPLICATE_INSERT_BEFORE
                    | CallFlags::DUPLICATE_INSERT_AFTER
                    | CallFlags::DUPLICATE_INSERT_FIRST
                    | CallFlags::DUPLICATE_INSERT_LAST,
            ) {
                observer.on_leaf_invalidated(leaf_rid, idx);
                leaf.records[idx] = record;
                storage.write_node(leaf_rid, &leaf)?;
                return Ok(());
            }
            return Err(Error::new(ErrorCode::DuplicateKey));
        }

        for i in idx..leaf.records.len() {
            observer.on_leaf_invalidated(leaf_rid, i);
        }
        record.flags.remove(KeyRecordFlags::APPROXIMATE);
        leaf.records.insert(idx, record);

        if leaf.records.len() <= self.max_keys as usize {
            storage.write_node(leaf_rid, &leaf)?;
            return Ok(());
        }

        // Propagate splits up the tree.
        let mut cur_rid = leaf_rid;
        let mut cur_node = leaf;
        loop {
            let (new_rid, separator, mut new_node) = self.split_node(storage, cur_rid, &mut cur_node)?;

            if new_node.right_sibling.is_some() {
                let mut neighbor = storage.read_node(new_node.right_sibling)?;
                neighbor.left_sibling = new_rid;
                storage.write_node(new_node.right_sibling, &neighbor)?;
            }

            match ancestors.pop() {
                None => {
                    // `cur_rid` was the root: build a new one above both halves.
                    let new_root_rid = storage.alloc_node()?;
                    let mut new_root = BtreeNode::new_internal(cur_rid);
                    new_root.records.push(KeyRecord::internal(separator, new_rid));
                    cur_node.parent = new_root_rid;
                    new_node.parent = new_root_rid;
                    storage.write_node(cur_rid, &cur_node)?;
                    storage.write_node(new_rid, &new_node)?;
                    storage.write_node(new_root_rid, &new_root)?;
                    self.root = new_root_rid;
                    return Ok(());
                }
                Some(parent_rid) => {
                    storage.write_node(cur_rid, &cur_node)?;
                    new_node.parent = parent_rid;
                    storage.write_node(new_rid, &new_node)?;

                    let mut parent = storage.read_node(parent_rid)?;
                    let pidx = parent.lower_bound(&separator, &|a, b| self.compare(a, b));
                    parent.records.insert(pidx, KeyRecord::internal(separator, new_rid));

                    if parent.records.len() <= self.max_keys as usize {
                        storage.write_node(parent_rid, &parent)?;
                        return Ok(());
                    }
                    cur_rid = parent_rid;
                    cur_node = parent;
                }
            }
        }
    }

    /// Looks up `key`, honoring `side` for inexact matches. Returns the
    /// matched key bytes, its record, and whether the match was exact.
    pub fn find(
        &self,
        storage: &mut dyn NodeStorage,
        key: &[u8],
        side: MatchSide,
    ) -> Result<(Vec<u8>, KeyRecord)> {
        let (_, leaf_rid) = self.descend(storage, key)?;
        let leaf = storage.read_node(leaf_rid)?;
        let idx = leaf.lower_bound(key, &|a, b| self.compare(a, b));
        let exact = idx < leaf.records.len() && self.compare(&leaf.records[idx].key, key) == Ordering::Equal;

        if exact {
            return Ok((leaf.records[idx].key.clone(), leaf.records[idx].clone()));
        }
        if side == MatchSide::Exact {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }

        match side {
            MatchSide::GreaterThan => {
                if idx < leaf.records.len() {
                    let mut rec = leaf.records[idx].clone();
                    rec.flags.insert(KeyRecordFlags::APPROXIMATE);
                    Ok((rec.key.clone(), rec))
                } else if leaf.right_sibling.is_some() {
                    let sibling = storage.read_node(leaf.right_sibling)?;
                    let mut rec = sibling
                        .records
                        .first()
                        .cloned()
                        .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
                    rec.flags.insert(KeyRecordFlags::APPROXIMATE);
                    Ok((rec.key.clone(), rec))
                } else {
                    Err(Error::new(ErrorCode::KeyNotFound))
                }
            }
            MatchSide::LessThan => {
                if idx > 0 {
                    let mut rec = leaf.records[idx - 1].clone();
                    rec.flags.insert(KeyRecordFlags::APPROXIMATE);
                    Ok((rec.key.clone(), rec))
                } else if leaf.left_sibling.is_some() {
                    let sibling = storage.read_node(leaf.left_sibling)?;
                    let mut rec = sibling
                        .records
                        .last()
                        .cloned()
                        .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
                    rec.flags.insert(KeyRecordFlags::APPROXIMATE);
                    Ok((rec.key.clone(), rec))
                } else {
                    Err(Error::new(ErrorCode::KeyNotFound))
                }
            }
            MatchSide::Exact => unreachable!(),
        }
    }

    /// Removes `key`. Underflowing leaves borrow from or merge with a
    /// sibling; a root that collapses to a single child shrinks the
    /// tree's height by one. Internal-node underflow above the leaf
    /// level is left unaddressed, a space/time tradeoff recorded in
    /// DESIGN.md, not a correctness gap.
    pub fn erase(
        &mut self,
        storage: &mut dyn NodeStorage,
        observer: &mut dyn StructuralObserver,
        key: &[u8],
    ) -> Result<KeyRecord> {
        let (ancestors, leaf_rid) = self.descend(storage, key)?;
        let mut leaf = storage.read_node(leaf_rid)?;
        let idx = leaf.lower_bound(key, &|a, b| self.compare(a, b));
        if idx >= leaf.records.len() || self.compare(&leaf.records[idx].key, key) != Ordering::Equal {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        for i in idx..leaf.records.len() {
            observer.on_leaf_invalidated(leaf_rid, i);
        }
        let removed = leaf.records.remove(idx);

        if leaf_rid == self.root || leaf.records.len() >= self.min_keys as usize {
            storage.write_node(leaf_rid, &leaf)?;
            return Ok(removed);
        }

        self.rebalance_leaf(storage, observer, ancestors, leaf_rid, leaf)?;
        Ok(removed)
    }

    fn rebalance_leaf(
        &mut self,
        storage: &mut dyn NodeStorage,
        observer: &mut dyn StructuralObserver,
        ancestors: Vec<Rid>,
        leaf_rid: Rid,
        mut leaf: BtreeNode,
    ) -> Result<()> {
        let Some(&parent_rid) = ancestors.last() else {
            storage.write_node(leaf_rid, &leaf)?;
            return Ok(());
        };

        if leaf.right_sibling.is_some() {
            let mut right = storage.read_node(leaf.right_sibling)?;
            if leaf.records.len() + right.records.len() <= self.max_keys as usize {
                self.merge_leaves(storage, observer, parent_rid, leaf_rid, &mut leaf, leaf.right_sibling, &mut right)?;
                return Ok(());
            } else if !right.records.is_empty() {
                let borrowed = right.records.remove(0);
                let new_sep = right
                    .records
                    .first()
                    .map(|r| r.key.clone())
                    .unwrap_or_else(|| borrowed.key.clone());
                leaf.records.push(borrowed);
                storage.write_node(leaf_rid, &leaf)?;
                storage.write_node(leaf.right_sibling, &right)?;
                self.replace_separator(storage, parent_rid, leaf_rid, new_sep)?;
                return Ok(());
            }
        }
        if leaf.left_sibling.is_some() {
            let mut left = storage.read_node(leaf.left_sibling)?;
            if leaf.records.len() + left.records.len() <= self.max_keys as usize {
                self.merge_leaves(storage, observer, parent_rid, leaf.left_sibling, &mut left, leaf_rid, &mut leaf)?;
                return Ok(());
            } else if !left.records.is_empty() {
                let borrowed = left.records.pop().unwrap();
                leaf.records.insert(0, borrowed.clone());
                storage.write_node(leaf_rid, &leaf)?;
                storage.write_node(leaf.left_sibling, &left)?;
                self.replace_separator(storage, parent_rid, leaf_rid, borrowed.key)?;
                return Ok(());
            }
        }

        storage.write_node(leaf_rid, &leaf)?;
        Ok(())
    }

    fn replace_separator(
        &mut self,
        storage: &mut dyn NodeStorage,
        parent_rid: Rid,
        right_child_rid: Rid,
        new_key: Vec<u8>,
    ) -> Result<()> {
        let mut parent = storage.read_node(parent_rid)?;
        if let Some(rec) = parent.records.iter_mut().find(|r| r.rid == right_child_rid) {
            rec.key = new_key;
            storage.write_node(parent_rid, &parent)?;
        }
        Ok(())
    }

    /// Merges `right` into `left` (both already loaded), frees `right`,
    /// removes the separator from `parent`, and collapses the root if
    /// it becomes childless.
    fn merge_leaves(
        &mut self,
        storage: &mut dyn NodeStorage,
        observer: &mut dyn StructuralObserver,
        parent_rid: Rid,
        left_rid: Rid,
        left: &mut BtreeNode,
        right_rid: Rid,
        right: &mut BtreeNode,
    ) -> Result<()> {
        left.records.append(&mut right.records);
        left.right_sibling = right.right_sibling;
        if right.right_sibling.is_some() {
            let mut far = storage.read_node(right.right_sibling)?;
            far.left_sibling = left_rid;
            storage.write_node(right.right_sibling, &far)?;
        }
        storage.write_node(left_rid, left)?;
        storage.free_node(right_rid)?;
        observer.on_node_freed(right_rid);

        let mut parent = storage.read_node(parent_rid)?;
        if let Some(pos) = parent.records.iter().position(|r| r.rid == right_rid) {
            parent.records.remove(pos);
        }

        if parent_rid == self.root && parent.records.is_empty() {
            self.root = parent.first_child;
            storage.free_node(parent_rid)?;
            observer.on_node_freed(parent_rid);
            let mut new_root = storage.read_node(self.root)?;
            new_root.parent = Rid::NONE;
            storage.write_node(self.root, &new_root)?;
        } else {
            storage.write_node(parent_rid, &parent)?;
        }
        Ok(())
    }

    /// Visits every leaf record in key order, left to right.
    pub fn enumerate(
        &self,
        storage: &mut dyn NodeStorage,
        mut visit: impl FnMut(&KeyRecord) -> Result<()>,
    ) -> Result<()> {
        let mut current = self.root;
        loop {
            let node = storage.read_node(current)?;
            if node.is_leaf {
                for rec in &node.records {
                    visit(rec)?;
                }
                if node.right_sibling.is_none() {
                    return Ok(());
                }
                current = node.right_sibling;
            } else {
                current = node.first_child;
            }
        }
    }

    /// Walks every leaf left to right, checking each one's keys are
    /// strictly ascending under the tree's comparator, and returns the
    /// leaf count (spec §8's "∀ B-tree leaf L... compare(kᵢ, kᵢ₊₁) < 0"
    /// universal invariant).
    pub fn check_integrity(&self, storage: &mut dyn NodeStorage) -> Result<BtreeIntegrity> {
        let mut leaf_count = 0usize;
        let mut current = self.root;
        loop {
            let node = storage.read_node(current)?;
            if node.is_leaf {
                leaf_count += 1;
                for pair in node.records.windows(2) {
                    if self.compare(&pair[0].key, &pair[1].key) != Ordering::Less {
                        return Err(Error::new(ErrorCode::IntegrityViolated));
                    }
                }
                if node.right_sibling.is_none() {
                    return Ok(BtreeIntegrity { leaf_count });
                }
                current = node.right_sibling;
            } else {
                current = node.first_child;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeIntegrity {
    pub leaf_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeNodeStorage {
        next: u64,
        nodes: HashMap<u64, BtreeNode>,
    }

    impl NodeStorage for FakeNodeStorage {
        fn alloc_node(&mut self) -> Result<Rid> {
            self.next += 1;
            Ok(Rid::from(self.next))
        }

        fn free_node(&mut self, rid: Rid) -> Result<()> {
            self.nodes.remove(&rid.0);
            Ok(())
        }

        fn read_node(&mut self, rid: Rid) -> Result<BtreeNode> {
            self.nodes
                .get(&rid.0)
                .cloned()
                .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))
        }

        fn write_node(&mut self, rid: Rid, node: &BtreeNode) -> Result<()> {
            self.nodes.insert(rid.0, node.clone());
            Ok(())
        }
    }

    fn new_tree(storage: &mut FakeNodeStorage, max_keys: u16) -> Btree {
        let root_rid = storage.alloc_node().unwrap();
        storage.write_node(root_rid, &BtreeNode::new_leaf()).unwrap();
        Btree::new(root_rid, max_keys, Box::new(|a: &[u8], b: &[u8]| a.cmp(b)))
    }

    #[test]
    fn insert_and_find_round_trips() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 4);
        let mut observer = NullObserver;
        for i in 0u64..3 {
            let rec = KeyRecord::leaf(i.to_be_bytes().to_vec(), Rid::from((i + 1) * 8), KeyRecordFlags::empty());
            tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        }
        let (_, rec) = tree.find(&mut storage, &1u64.to_be_bytes(), MatchSide::Exact).unwrap();
        assert_eq!(rec.rid, Rid::from(16));
    }

    #[test]
    fn insert_past_capacity_splits_and_creates_root() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 3);
        let mut observer = NullObserver;
        let original_root = tree.root;
        for i in 0u64..10 {
            let rec = KeyRecord::leaf(i.to_be_bytes().to_vec(), Rid::from((i + 1) * 8), KeyRecordFlags::empty());
            tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        }
        assert_ne!(tree.root, original_root);
        for i in 0u64..10 {
            let (_, rec) = tree.find(&mut storage, &i.to_be_bytes(), MatchSide::Exact).unwrap();
            assert_eq!(rec.rid, Rid::from((i + 1) * 8));
        }
    }

    #[test]
    fn overwrite_replaces_record_without_duplicate_error() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 4);
        let mut observer = NullObserver;
        let rec = KeyRecord::leaf(b"k".to_vec(), Rid::from(8), KeyRecordFlags::empty());
        tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        let rec2 = KeyRecord::leaf(b"k".to_vec(), Rid::from(16), KeyRecordFlags::empty());
        tree.insert(&mut storage, &mut observer, rec2, CallFlags::OVERWRITE).unwrap();
        let (_, got) = tree.find(&mut storage, b"k", MatchSide::Exact).unwrap();
        assert_eq!(got.rid, Rid::from(16));
    }

    #[test]
    fn duplicate_without_overwrite_flag_errors() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 4);
        let mut observer = NullObserver;
        let rec = KeyRecord::leaf(b"k".to_vec(), Rid::from(8), KeyRecordFlags::empty());
        tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        let rec2 = KeyRecord::leaf(b"k".to_vec(), Rid::from(16), KeyRecordFlags::empty());
        let err = tree.insert(&mut storage, &mut observer, rec2, CallFlags::empty()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
    }

    #[test]
    fn erase_then_find_reports_not_found() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 4);
        let mut observer = NullObserver;
        let rec = KeyRecord::leaf(b"k".to_vec(), Rid::from(8), KeyRecordFlags::empty());
        tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        tree.erase(&mut storage, &mut observer, b"k").unwrap();
        assert!(tree.find(&mut storage, b"k", MatchSide::Exact).is_err());
    }

    #[test]
    fn enumerate_visits_all_records_in_order() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 3);
        let mut observer = NullObserver;
        for i in (0u64..12).rev() {
            let rec = KeyRecord::leaf(i.to_be_bytes().to_vec(), Rid::from((i + 1) * 8), KeyRecordFlags::empty());
            tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        }
        let mut seen = Vec::new();
        tree.enumerate(&mut storage, |rec| {
            seen.push(u64::from_be_bytes(rec.key.clone().try_into().unwrap()));
            Ok(())
        })
        .unwrap();
        let expected: Vec<u64> = (0..12).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn check_integrity_reports_leaf_count_after_splits() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 3);
        let mut observer = NullObserver;
        for i in 0u64..12 {
            let rec = KeyRecord::leaf(i.to_be_bytes().to_vec(), Rid::from((i + 1) * 8), KeyRecordFlags::empty());
            tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        }
        let report = tree.check_integrity(&mut storage).unwrap();
        assert!(report.leaf_count > 1);
    }

    #[test]
    fn find_gt_match_returns_nearest_greater_key() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage, 4);
        let mut observer = NullObserver;
        for i in [1u64, 3, 5] {
            let rec = KeyRecord::leaf(i.to_be_bytes().to_vec(), Rid::from(i * 8), KeyRecordFlags::empty());
            tree.insert(&mut storage, &mut observer, rec, CallFlags::empty()).unwrap();
        }
        let (key, rec) = tree.find(&mut storage, &2u64.to_be_bytes(), MatchSide::GreaterThan).unwrap();
        assert_eq!(u64::from_be_bytes(key.try_into().unwrap()), 3);
        assert!(rec.flags.contains(KeyRecordFlags::APPROXIMATE));
    }
}
