//! B-tree cursor: `nil` / `coupled(leaf, index)` / `uncoupled(key)`
//! (spec §4.9).

use tracing::trace;

use crate::blob::{self, BlobStorage, DuplicateTable};
use crate::btree::{Btree, KeyRecord, KeyRecordFlags, MatchSide, NodeStorage, StructuralObserver};
use crate::error::{Error, ErrorCode, Result};
use crate::types::{CallFlags, MoveFlags, Rid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    Nil,
    Coupled { leaf: Rid, index: usize },
    /// Positioned logically at `key` but not bound to a specific leaf
    /// slot; re-resolved via `find` on the next access (spec §4.9).
    Uncoupled { key: Vec<u8> },
}

/// A cursor into one database's B-tree. Registers with its owning
/// transaction's refcount on construction/close, per spec §4.9.
pub struct Cursor {
    pub txn_id: u64,
    state: CursorState,
}

impl Cursor {
    pub fn new(txn: &mut crate::txn::Txn) -> Self {
        txn.attach_cursor();
        Cursor {
            txn_id: txn.id,
            state: CursorState::Nil,
        }
    }

    pub fn close(mut self, txn: &mut crate::txn::Txn) {
        txn.detach_cursor();
        self.state = CursorState::Nil;
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.state, CursorState::Nil)
    }

    fn resolve(&self, storage: &mut dyn NodeStorage, tree: &Btree) -> Result<(Rid, usize)> {
        match &self.state {
            CursorState::Coupled { leaf, index } => Ok((*leaf, *index)),
            CursorState::Uncoupled { key } => {
                let (found_key, _) = tree.find(storage, key, MatchSide::Exact)?;
                self.locate_leaf(storage, tree, &found_key)
            }
            CursorState::Nil => Err(Error::new(ErrorCode::KeyNotFound)),
        }
    }

    fn locate_leaf(&self, storage: &mut dyn NodeStorage, tree: &Btree, key: &[u8]) -> Result<(Rid, usize)> {
        let mut current = tree.root;
        loop {
            let node = storage.read_node(current)?;
            if node.is_leaf {
                let idx = node.lower_bound(key, &|a, b| a.cmp(b));
                return Ok((current, idx));
            }
            current = node.child_for(key, &|a, b| a.cmp(b));
        }
    }

    /// Moves per `flags` (`FIRST`/`LAST`/`NEXT`/`PREVIOUS`, optionally
    /// `SKIP_DUPLICATES`). `SKIP_DUPLICATES` is a no-op here: this layer
    /// has one record per key slot; duplicate stepping within a slot is
    /// the owning database's concern once it decodes the slot's
    /// duplicate table.
    pub fn move_cursor(&mut self, storage: &mut dyn NodeStorage, tree: &Btree, flags: MoveFlags) -> Result<KeyRecord> {
        if flags.contains(MoveFlags::FIRST) {
            return self.to_first(storage, tree);
        }
        if flags.contains(MoveFlags::LAST) {
            return self.to_last(storage, tree);
        }
        if flags.contains(MoveFlags::NEXT) {
            return self.step(storage, tree, true);
        }
        if flags.contains(MoveFlags::PREVIOUS) {
            return self.step(storage, tree, false);
        }
        Err(Error::new(ErrorCode::InvParameter))
    }

    fn to_first(&mut self, storage: &mut dyn NodeStorage, tree: &Btree) -> Result<KeyRecord> {
        let mut current = tree.root;
        loop {
            let node = storage.read_node(current)?;
            if node.is_leaf {
                let rec = node.records.first().cloned().ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
                self.state = CursorState::Coupled { leaf: current, index: 0 };
                return Ok(rec);
            }
            current = node.first_child;
        }
    }

    fn to_last(&mut self, storage: &mut dyn NodeStorage, tree: &Btree) -> Result<KeyRecord> {
        let mut current = tree.root;
        loop {
            let node = storage.read_node(current)?;
            if node.is_leaf {
                let idx = node.records.len().checked_sub(1).ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
                self.state = CursorState::Coupled { leaf: current, index: idx };
                return Ok(node.records[idx].clone());
            }
            current = node.records.last().map(|r| r.rid).unwrap_or(node.first_child);
        }
    }

    fn step(&mut self, storage: &mut dyn NodeStorage, tree: &Btree, forward: bool) -> Result<KeyRecord> {
        let (leaf_rid, index) = self.resolve(storage, tree)?;
        let node = storage.read_node(leaf_rid)?;
        if forward {
            if index + 1 < node.records.len() {
                self.state = CursorState::Coupled { leaf: leaf_rid, index: index + 1 };
                return Ok(node.records[index + 1].clone());
            }
            if node.right_sibling.is_some() {
                let sibling = storage.read_node(node.right_sibling)?;
                let rec = sibling.records.first().cloned().ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
                self.state = CursorState::Coupled { leaf: node.right_sibling, index: 0 };
                return Ok(rec);
            }
        } else if index > 0 {
            self.state = CursorState::Coupled { leaf: leaf_rid, index: index - 1 };
            return Ok(node.records[index - 1].clone());
        } else if node.left_sibling.is_some() {
            let sibling = storage.read_node(node.left_sibling)?;
            let idx = sibling.records.len().checked_sub(1).ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
            self.state = CursorState::Coupled { leaf: node.left_sibling, index: idx };
            return Ok(sibling.records[idx].clone());
        }
        self.state = CursorState::Nil;
        Err(Error::new(ErrorCode::KeyNotFound))
    }

    /// Positions via the B-tree find path, honoring `FIND_LT_MATCH`/
    /// `FIND_GT_MATCH`/`FIND_EXACT_MATCH`.
    pub fn find(&mut self, storage: &mut dyn NodeStorage, tree: &Btree, key: &[u8], flags: CallFlags) -> Result<KeyRecord> {
        let side = if flags.contains(CallFlags::FIND_LT_MATCH) {
            MatchSide::LessThan
        } else if flags.contains(CallFlags::FIND_GT_MATCH) {
            MatchSide::GreaterThan
        } else {
            MatchSide::Exact
        };
        let (found_key, rec) = tree.find(storage, key, side)?;
        let (leaf, index) = self.locate_leaf(storage, tree, &found_key)?;
        self.state = CursorState::Coupled { leaf, index };
        Ok(rec)
    }

    /// Inserts via the tree, then recouples to the inserted key (a split
    /// may have moved it to a new leaf).
    pub fn insert(
        &mut self,
        storage: &mut dyn NodeStorage,
        observer: &mut dyn StructuralObserver,
        tree: &mut Btree,
        record: KeyRecord,
        flags: CallFlags,
    ) -> Result<()> {
        let key = record.key.clone();
        tree.insert(storage, observer, record, flags)?;
        let (leaf, index) = self.locate_leaf(storage, tree, &key)?;
        self.state = CursorState::Coupled { leaf, index };
        Ok(())
    }

    /// Updates only the record rid at the current position; the key is
    /// unchanged.
    pub fn overwrite(&mut self, storage: &mut dyn NodeStorage, tree: &Btree, new_rid: Rid) -> Result<()> {
        let (leaf_rid, index) = self.resolve(storage, tree)?;
        let mut node = storage.read_node(leaf_rid)?;
        let rec = node.records.get_mut(index).ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
        rec.rid = new_rid;
        storage.write_node(leaf_rid, &node)?;
        self.state = CursorState::Coupled { leaf: leaf_rid, index };
        Ok(())
    }

    /// Removes the current entry and advances to the next valid
    /// position, or invalidates the cursor if none remains.
    pub fn erase(
        &mut self,
        storage: &mut dyn NodeStorage,
        observer: &mut dyn StructuralObserver,
        tree: &mut Btree,
    ) -> Result<KeyRecord> {
        let (leaf_rid, index) = self.resolve(storage, tree)?;
        let node = storage.read_node(leaf_rid)?;
        let key = node.records.get(index).ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?.key.clone();
        let removed = tree.erase(storage, observer, &key)?;
        trace!(key_len = key.len(), "cursor erase");

        match tree.find(storage, &key, MatchSide::GreaterThan) {
            Ok((found_key, _)) => {
                let (leaf, index) = self.locate_leaf(storage, tree, &found_key)?;
                self.state = CursorState::Coupled { leaf, index };
            }
            Err(_) => self.state = CursorState::Nil,
        }
        Ok(removed)
    }

    /// Number of records at the current key's slot: 1 for a plain
    /// record, or the duplicate table's length when `HAS_DUPLICATES` is
    /// set.
    pub fn get_duplicate_count(
        &self,
        node_storage: &mut dyn NodeStorage,
        blob_storage: &mut dyn BlobStorage,
        tree: &Btree,
    ) -> Result<usize> {
        let (leaf_rid, index) = self.resolve(node_storage, tree)?;
        let node = node_storage.read_node(leaf_rid)?;
        let rec = node.records.get(index).ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
        if !rec.flags.contains(KeyRecordFlags::HAS_DUPLICATES) {
            return Ok(1);
        }
        let bytes = blob::read(blob_storage, rec.rid)?;
        let table = DuplicateTable::decode(&bytes)?;
        Ok(table.len())
    }

    pub fn try_clone(&self) -> Cursor {
        Cursor {
            txn_id: self.txn_id,
            state: self.state.clone(),
        }
    }
}

/// Uncouples a cursor whose coupled position falls at or after the
/// invalidated index on the same leaf, per spec §4.9.
impl StructuralObserver for Cursor {
    fn on_leaf_invalidated(&mut self, leaf_rid: Rid, index: usize) {
        if let CursorState::Coupled { leaf, index: my_index } = &self.state {
            if *leaf == leaf_rid && *my_index >= index {
                self.state = CursorState::Nil;
            }
        }
    }

    fn on_node_freed(&mut self, rid: Rid) {
        if let CursorState::Coupled { leaf, .. } = &self.state {
            if *leaf == rid {
                self.state = CursorState::Nil;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::BtreeNode;
    use crate::log::Log;
    use std::collections::HashMap;
    use tempfile::tempdir;

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
            self.nodes.get(&rid.0).cloned().ok_or_else(|| Error::new(ErrorCode::KeyNotFound))
        }
        fn write_node(&mut self, rid: Rid, node: &BtreeNode) -> Result<()> {
            self.nodes.insert(rid.0, node.clone());
            Ok(())
        }
    }

    fn new_tree(storage: &mut FakeNodeStorage) -> Btree {
        let root = storage.alloc_node().unwrap();
        storage.write_node(root, &BtreeNode::new_leaf()).unwrap();
        Btree::new(root, 4, Box::new(|a: &[u8], b: &[u8]| a.cmp(b)))
    }

    fn new_txn() -> (tempfile::TempDir, Log, crate::txn::Txn) {
        let dir = tempdir().unwrap();
        let mut log = Log::create(dir.path(), 1 << 20).unwrap();
        let txn = crate::txn::Txn::begin(&mut log, 1).unwrap();
        (dir, log, txn)
    }

    #[test]
    fn move_first_and_next_walk_in_order() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage);
        let (_dir, _log, mut txn) = new_txn();
        let mut cursor = Cursor::new(&mut txn);
        let mut noop = crate::btree::NullObserver;
        for i in 0u64..3 {
            let rec = KeyRecord::leaf(i.to_be_bytes().to_vec(), Rid::from((i + 1) * 8), KeyRecordFlags::empty());
            tree.insert(&mut storage, &mut noop, rec, CallFlags::empty()).unwrap();
        }
        let first = cursor.move_cursor(&mut storage, &tree, MoveFlags::FIRST).unwrap();
        assert_eq!(first.rid, Rid::from(8));
        let next = cursor.move_cursor(&mut storage, &tree, MoveFlags::NEXT).unwrap();
        assert_eq!(next.rid, Rid::from(16));
    }

    #[test]
    fn insert_via_cursor_couples_to_new_key() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage);
        let (_dir, _log, mut txn) = new_txn();
        let mut cursor = Cursor::new(&mut txn);
        let mut noop = crate::btree::NullObserver;
        let rec = KeyRecord::leaf(b"k".to_vec(), Rid::from(8), KeyRecordFlags::empty());
        cursor.insert(&mut storage, &mut noop, &mut tree, rec, CallFlags::empty()).unwrap();
        assert!(matches!(cursor.state(), CursorState::Coupled { .. }));
    }

    #[test]
    fn erase_invalidates_cursor_when_no_records_remain() {
        let mut storage = FakeNodeStorage::default();
        let mut tree = new_tree(&mut storage);
        let (_dir, _log, mut txn) = new_txn();
        let mut cursor = Cursor::new(&mut txn);
        let mut noop = crate::btree::NullObserver;
        let rec = KeyRecord::leaf(b"k".to_vec(), Rid::from(8), KeyRecordFlags::empty());
        tree.insert(&mut storage, &mut noop, rec, CallFlags::empty()).unwrap();
        cursor.find(&mut storage, &tree, b"k", CallFlags::empty()).unwrap();
        cursor.erase(&mut storage, &mut noop, &mut tree).unwrap();
        assert!(cursor.is_nil());
    }
}
