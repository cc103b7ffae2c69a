//! A single named B-tree index within an environment (spec §4.10).
//!
//! `Database` is deliberately a plain data holder (the B-tree, the
//! extended-key cache, the record filters, and running statistics) and
//! never reaches for a `Device`/`Freelist`/`Cache` directly. Operations
//! that need storage take `&mut dyn NodeStorage`/`&mut dyn BlobStorage`
//! from their caller (`Environment`), the same decoupling `blob.rs` and
//! `log.rs` already use.

use tracing::debug;

use crate::blob::{self, BlobStorage, DuplicateTable, DupEntry, DupPosition, InlineKind};
use crate::btree::{Btree, KeyRecord, KeyRecordFlags, MatchSide, NodeStorage, StructuralObserver};
use crate::config::DbConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::extkey::ExtKeyCache;
use crate::filter::{apply_after_read, apply_before_write, FilterInfo, RecordFilter};
use crate::types::{CallFlags, DbFlags, Rid};

fn inline_flag(kind: InlineKind) -> KeyRecordFlags {
    match kind {
        InlineKind::Empty => KeyRecordFlags::EMPTY,
        InlineKind::Tiny => KeyRecordFlags::TINY,
        InlineKind::Small => KeyRecordFlags::SMALL,
    }
}

fn inline_len_for(kind: InlineKind, len: usize) -> u8 {
    match kind {
        InlineKind::Empty => 0,
        InlineKind::Tiny | InlineKind::Small => len as u8,
    }
}

/// Reads a leaf record's payload regardless of whether it's inline
/// (`EMPTY`/`TINY`/`SMALL`) or blob-backed.
fn read_payload(storage: &mut dyn BlobStorage, rec: &KeyRecord) -> Result<Vec<u8>> {
    if rec.flags.contains(KeyRecordFlags::EMPTY) {
        Ok(Vec::new())
    } else if rec.flags.intersects(KeyRecordFlags::TINY | KeyRecordFlags::SMALL) {
        Ok(blob::unpack_inline(rec.rid, rec.inline_len))
    } else {
        blob::read(storage, rec.rid)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    pub inserts: u64,
    pub finds: u64,
    pub erases: u64,
}

pub struct Database {
    pub config: DbConfig,
    pub btree: Btree,
    pub extkey: ExtKeyCache,
    pub record_filters: Vec<Box<dyn RecordFilter>>,
    pub stats: DbStats,
    next_recno: u64,
}

impl Database {
    pub fn new(config: DbConfig, btree: Btree) -> Self {
        Database {
            config,
            btree,
            extkey: ExtKeyCache::new(),
            record_filters: Vec::new(),
            stats: DbStats::default(),
            next_recno: 1,
        }
    }

    fn inline_capacity(&self) -> usize {
        self.config.key_size as usize
    }

    /// Resolves the full key bytes for an inline-or-extended `KeyRecord`.
    pub fn full_key(
        &mut self,
        blob_storage: &mut dyn BlobStorage,
        rec: &KeyRecord,
        txn_id: u64,
    ) -> Result<Vec<u8>> {
        if rec.is_extended() {
            self.extkey.fetch(blob_storage, rec.extended_rid, txn_id)
        } else {
            Ok(rec.key.clone())
        }
    }

    /// Navigates to `key`'s leaf record by its inline prefix (the only
    /// thing the B-tree's comparator ever sees), then for an extended key
    /// resolves the full bytes through the extkey cache and rejects a
    /// collision where a different full key shares the same truncated
    /// prefix.
    fn find_exact<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        txn_id: u64,
        key: &[u8],
    ) -> Result<KeyRecord> {
        let (inline_key, _) = crate::btree::node::split_inline(key, self.inline_capacity());
        let (_, rec) = self.btree.find(storage, &inline_key, MatchSide::Exact)?;
        if rec.is_extended() {
            let full = self.full_key(storage, &rec, txn_id)?;
            if full != key {
                return Err(Error::new(ErrorCode::KeyNotFound));
            }
        }
        Ok(rec)
    }

    /// Inserts `key`/`payload`. Assigns an ascending record number key
    /// when `RECORD_NUMBER` is set and `key` is empty (spec §6).
    ///
    /// Takes a single generic `storage` rather than separate
    /// `&mut dyn NodeStorage`/`&mut dyn BlobStorage` trait objects: both
    /// views borrow the same underlying device, so they're produced as
    /// sequential reborrows of one value instead of two trait objects
    /// alive at once (which the underlying `Environment` storage can't
    /// support without aliasing its `Device`).
    pub fn insert<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        observer: &mut dyn StructuralObserver,
        txn_id: u64,
        key: &[u8],
        payload: &[u8],
        flags: CallFlags,
    ) -> Result<()> {
        let owned_key;
        let key = if self.config.flags.contains(DbFlags::RECORD_NUMBER) && key.is_empty() {
            let recno = self.next_recno;
            self.next_recno += 1;
            owned_key = recno.to_be_bytes().to_vec();
            &owned_key
        } else {
            if self.config.flags.contains(DbFlags::DISABLE_VAR_KEYLEN) && key.len() > self.inline_capacity() {
                return Err(Error::new(ErrorCode::InvKeysize));
            }
            key
        };

        let mut record = payload.to_vec();
        let info = FilterInfo { txn_id, cursor_id: None };
        apply_before_write(&self.record_filters, &mut record, &info)?;

        let inline_kind = blob::classify_inline(record.len() as u64);
        let (record_rid, inline_len) = match inline_kind {
            Some(kind) => (blob::pack_inline(&record), inline_len_for(kind, record.len())),
            None => (blob::allocate(storage, &record)?, 0),
        };
        let (inline_key, extended) = crate::btree::node::split_inline(key, self.inline_capacity());
        let mut rec_flags = inline_kind.map(inline_flag).unwrap_or_else(KeyRecordFlags::empty);
        let extended_rid = if let Some(full) = extended {
            rec_flags.insert(KeyRecordFlags::EXTENDED);
            blob::allocate(storage, &full)?
        } else {
            Rid::NONE
        };

        let key_rec = KeyRecord {
            key: inline_key,
            rid: record_rid,
            flags: rec_flags,
            extended_rid,
            inline_len,
        };

        match self.btree.insert(storage, observer, key_rec, flags) {
            Ok(()) => {
                self.stats.inserts += 1;
                debug!(db_key_size = self.config.key_size, "database insert");
                Ok(())
            }
            Err(e) => {
                if inline_kind.is_none() {
                    blob::free(storage, record_rid).ok();
                }
                Err(e)
            }
        }
    }

    /// Looks up `key`, returning the decoded record payload.
    pub fn find<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        txn_id: u64,
        key: &[u8],
        flags: CallFlags,
    ) -> Result<Vec<u8>> {
        let rec = if flags.contains(CallFlags::FIND_LT_MATCH) {
            let (inline_key, _) = crate::btree::node::split_inline(key, self.inline_capacity());
            self.btree.find(storage, &inline_key, MatchSide::LessThan)?.1
        } else if flags.contains(CallFlags::FIND_GT_MATCH) {
            let (inline_key, _) = crate::btree::node::split_inline(key, self.inline_capacity());
            self.btree.find(storage, &inline_key, MatchSide::GreaterThan)?.1
        } else {
            self.find_exact(storage, txn_id, key)?
        };
        self.stats.finds += 1;
        let mut payload = read_payload(storage, &rec)?;
        let info = FilterInfo { txn_id, cursor_id: None };
        apply_after_read(&self.record_filters, &mut payload, &info)?;
        Ok(payload)
    }

    /// Removes `key` and frees its record blob (and extended-key blob,
    /// if any).
    pub fn erase<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        observer: &mut dyn StructuralObserver,
        key: &[u8],
    ) -> Result<()> {
        self.find_exact(storage, 0, key)?;
        let (inline_key, _) = crate::btree::node::split_inline(key, self.inline_capacity());
        let rec = self.btree.erase(storage, observer, &inline_key)?;
        if rec.flags.contains(KeyRecordFlags::HAS_DUPLICATES) {
            blob::erase_duplicate_table(storage, rec.rid, true)?;
        } else if !rec.is_inline_payload() {
            blob::free(storage, rec.rid)?;
        }
        if rec.is_extended() {
            self.extkey.remove(rec.extended_rid);
        }
        self.stats.erases += 1;
        Ok(())
    }

    /// Attaches `value` as an additional record under `key`, building or
    /// growing the key's duplicate table as needed (spec §4.6/§6
    /// `ENABLE_DUPLICATES`).
    pub fn insert_duplicate<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        observer: &mut dyn StructuralObserver,
        key: &[u8],
        payload: &[u8],
        position: DupPosition,
    ) -> Result<()> {
        if !self.config.flags.contains(DbFlags::ENABLE_DUPLICATES) {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        let rec = self.find_exact(storage, 0, key)?;
        let record_rid = blob::allocate(storage, payload)?;
        let new_entry = DupEntry::rid(record_rid);

        let (mut table, table_rid) = if rec.flags.contains(KeyRecordFlags::HAS_DUPLICATES) {
            let bytes = blob::read(storage, rec.rid)?;
            (DuplicateTable::decode(&bytes)?, Some(rec.rid))
        } else {
            let first_entry = if rec.is_inline_payload() {
                DupEntry::inline(&read_payload(storage, &rec)?)
            } else {
                DupEntry::rid(rec.rid)
            };
            let mut t = DuplicateTable::new();
            t.insert(first_entry, DupPosition::First)?;
            (t, None)
        };
        table.insert(new_entry, position)?;
        let encoded = table.encode();

        let new_table_rid = match table_rid {
            Some(old_rid) => blob::overwrite(storage, old_rid, &encoded)?,
            None => blob::allocate(storage, &encoded)?,
        };

        let mut updated = rec.clone();
        updated.rid = new_table_rid;
        updated.inline_len = 0;
        updated.flags.remove(KeyRecordFlags::EMPTY | KeyRecordFlags::TINY | KeyRecordFlags::SMALL);
        updated.flags.insert(KeyRecordFlags::HAS_DUPLICATES);
        self.btree.insert(storage, observer, updated, CallFlags::OVERWRITE)?;
        Ok(())
    }

    /// Attaches `payload` keeping the key's duplicates ordered by payload
    /// bytes, per `SORT_DUPLICATES` falling back to the primary key
    /// comparator when no duplicate comparator is configured (spec §9
    /// Open Question decision).
    pub fn insert_duplicate_sorted<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        observer: &mut dyn StructuralObserver,
        key: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        if !self.config.flags.contains(DbFlags::ENABLE_DUPLICATES) {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        let rec = self.find_exact(storage, 0, key)?;
        let position = if rec.flags.contains(KeyRecordFlags::HAS_DUPLICATES) {
            let bytes = blob::read(storage, rec.rid)?;
            let table = DuplicateTable::decode(&bytes)?;
            let mut insert_at = table.len();
            for (i, entry) in table.entries.iter().enumerate() {
                let existing = match entry.as_rid() {
                    Some(rid) => blob::read(storage, rid)?,
                    None => entry.data.to_vec(),
                };
                if payload < existing.as_slice() {
                    insert_at = i;
                    break;
                }
            }
            DupPosition::At(insert_at)
        } else {
            let existing = read_payload(storage, &rec)?;
            if payload < existing.as_slice() {
                DupPosition::First
            } else {
                DupPosition::Last
            }
        };
        self.insert_duplicate(storage, observer, key, payload, position)
    }

    /// Updates `[partial_offset, partial_offset + partial_data.len())` of
    /// the record at `key`, leaving the rest of the payload and the key
    /// itself untouched (spec §6 `PARTIAL`).
    pub fn overwrite_partial<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        observer: &mut dyn StructuralObserver,
        key: &[u8],
        partial_offset: u64,
        partial_data: &[u8],
        full_new_size: u64,
    ) -> Result<()> {
        let rec = self.find_exact(storage, 0, key)?;
        if rec.flags.contains(KeyRecordFlags::HAS_DUPLICATES) {
            return Err(Error::new(ErrorCode::InvParameter));
        }
        let old = read_payload(storage, &rec)?;
        let buf = blob::build_partial_buffer(&old, partial_offset, partial_data, full_new_size);

        let mut updated = rec.clone();
        match blob::classify_inline(buf.len() as u64) {
            Some(kind) => {
                if !rec.is_inline_payload() {
                    blob::free(storage, rec.rid)?;
                }
                updated.rid = blob::pack_inline(&buf);
                updated.inline_len = inline_len_for(kind, buf.len());
                updated.flags.remove(KeyRecordFlags::EMPTY | KeyRecordFlags::TINY | KeyRecordFlags::SMALL);
                updated.flags.insert(inline_flag(kind));
            }
            None if rec.is_inline_payload() => {
                updated.rid = blob::allocate(storage, &buf)?;
                updated.inline_len = 0;
                updated.flags.remove(KeyRecordFlags::EMPTY | KeyRecordFlags::TINY | KeyRecordFlags::SMALL);
            }
            None => {
                updated.rid = blob::overwrite(storage, rec.rid, &buf)?;
            }
        }
        self.btree.insert(storage, observer, updated, CallFlags::OVERWRITE)?;
        self.stats.inserts += 1;
        Ok(())
    }

    /// Returns every record payload stored under `key`, in duplicate-table
    /// order (one element for a plain record).
    pub fn list_duplicates<S: NodeStorage + BlobStorage>(
        &mut self,
        storage: &mut S,
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let rec = self.find_exact(storage, 0, key)?;
        if !rec.flags.contains(KeyRecordFlags::HAS_DUPLICATES) {
            return Ok(vec![read_payload(storage, &rec)?]);
        }
        let bytes = blob::read(storage, rec.rid)?;
        let table = DuplicateTable::decode(&bytes)?;
        let mut out = Vec::with_capacity(table.len());
        for entry in &table.entries {
            let payload = match entry.as_rid() {
                Some(rid) => blob::read(storage, rid)?,
                None => entry.data.to_vec(),
            };
            out.push(payload);
        }
        Ok(out)
    }
}
