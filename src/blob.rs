//! Variable-length record storage: blob allocation, overwrite-in-place,
//! partial overwrite, duplicate tables, and tiny/small/empty inline
//! payload encoding (spec §4.6).
//!
//! There's no single teacher file this maps onto (the engine it's grounded
//! in stores records directly in SQLite cell payloads), so this module is
//! grounded in `original_source/src/blob.c` for the allocation/overwrite
//! decision tree, expressed with the arena+freelist idiom established in
//! `page.rs`/`freelist.rs` rather than the C source's raw pointer
//! arithmetic.

use tracing::trace;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Rid;

pub const BLOB_HEADER_SIZE: u64 = 25;
/// `sizeof(rid) + sizeof(blob header) + 1`: the smallest leftover worth
/// returning to the freelist instead of leaving inside the allocation.
pub const SMALLEST_CHUNK_SIZE: u64 = 8 + BLOB_HEADER_SIZE + 1;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlobFlags: u8 {
        const COMPRESSED = 0x01;
    }
}

#[derive(Debug, Clone, Copy)]
struct BlobHeader {
    self_rid: Rid,
    alloc_size: u64,
    payload_size: u64,
    flags: BlobFlags,
}

impl BlobHeader {
    fn encode(&self) -> [u8; BLOB_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOB_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.self_rid.0.to_le_bytes());
        buf[8..16].copy_from_slice(&self.alloc_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[24] = self.flags.bits();
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if (buf.len() as u64) < BLOB_HEADER_SIZE {
            return Err(Error::new(ErrorCode::IntegrityViolated));
        }
        Ok(BlobHeader {
            self_rid: Rid::from(u64::from_le_bytes(buf[0..8].try_into().unwrap())),
            alloc_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            payload_size: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            flags: BlobFlags::from_bits_truncate(buf[24]),
        })
    }
}

/// What a database's underlying storage must provide for blob operations,
/// kept separate from `device::Device` because blob allocation reasons
/// about chunks (via the freelist), not raw byte ranges.
pub trait BlobStorage {
    fn alloc_chunk(&mut self, size: u64) -> Result<Rid>;
    fn free_chunk(&mut self, rid: Rid, size: u64) -> Result<()>;
    fn read_raw(&mut self, rid: Rid, buf: &mut [u8]) -> Result<()>;
    fn write_raw(&mut self, rid: Rid, buf: &[u8]) -> Result<()>;
}

/// Tiny (1-7 bytes), small (exactly 8 bytes, `sizeof(rid)`), or empty (0
/// bytes) payloads never get a blob; they're carried inline in the
/// caller's key-record pointer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineKind {
    Empty,
    Tiny,
    Small,
}

pub fn classify_inline(size: u64) -> Option<InlineKind> {
    match size {
        0 => Some(InlineKind::Empty),
        1..=7 => Some(InlineKind::Tiny),
        8 => Some(InlineKind::Small),
        _ => None,
    }
}

/// Packs a `TINY`/`SMALL` payload (`len() <= 8`) into a `Rid`'s 8 bytes,
/// zero-padded. The caller tracks the true length separately
/// (`KeyRecord::inline_len`); zero padding alone can't distinguish a
/// `TINY` payload from a longer one with trailing zero bytes.
pub fn pack_inline(payload: &[u8]) -> Rid {
    let mut buf = [0u8; 8];
    buf[..payload.len()].copy_from_slice(payload);
    Rid::from(u64::from_le_bytes(buf))
}

/// Inverse of `pack_inline`, given the true payload length.
pub fn unpack_inline(rid: Rid, len: u8) -> Vec<u8> {
    rid.0.to_le_bytes()[..len as usize].to_vec()
}

/// Allocates a new blob holding `payload`, returning its rid. Leftover
/// space inside the chunk-aligned allocation is returned to the freelist
/// when it's large enough to be worth tracking.
pub fn allocate(storage: &mut dyn BlobStorage, payload: &[u8]) -> Result<Rid> {
    let needed = BLOB_HEADER_SIZE + payload.len() as u64;
    let rid = storage.alloc_chunk(needed)?;
    let allocated = crate::types::Rid::chunk_align(needed);

    let header = BlobHeader {
        self_rid: rid,
        alloc_size: allocated,
        payload_size: payload.len() as u64,
        flags: BlobFlags::empty(),
    };
    let mut buf = Vec::with_capacity(allocated as usize);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.resize(allocated as usize, 0);
    storage.write_raw(rid, &buf)?;

    let leftover = allocated - needed;
    if leftover >= SMALLEST_CHUNK_SIZE {
        storage.free_chunk(Rid::from(rid.0 + needed), leftover)?;
    }
    trace!(rid = rid.0, size = payload.len(), "allocated blob");
    Ok(rid)
}

fn read_header(storage: &mut dyn BlobStorage, rid: Rid) -> Result<BlobHeader> {
    let mut hdr_buf = [0u8; BLOB_HEADER_SIZE as usize];
    storage.read_raw(rid, &mut hdr_buf)?;
    BlobHeader::decode(&hdr_buf)
}

/// Reads a blob's full payload.
pub fn read(storage: &mut dyn BlobStorage, rid: Rid) -> Result<Vec<u8>> {
    let header = read_header(storage, rid)?;
    let mut buf = vec![0u8; header.payload_size as usize];
    if !buf.is_empty() {
        storage.read_raw(Rid::from(rid.0 + BLOB_HEADER_SIZE), &mut buf)?;
    }
    Ok(buf)
}

/// Reads `[offset, offset+size)` of a blob's payload, clamping `size`
/// down when the window runs past the end of the record (spec §9 Open
/// Question: partial reads are clamped rather than erroring).
pub fn read_partial(
    storage: &mut dyn BlobStorage,
    rid: Rid,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>> {
    let header = read_header(storage, rid)?;
    if offset >= header.payload_size {
        return Ok(Vec::new());
    }
    let clamped = size.min(header.payload_size - offset);
    let mut buf = vec![0u8; clamped as usize];
    if !buf.is_empty() {
        storage.read_raw(Rid::from(rid.0 + BLOB_HEADER_SIZE + offset), &mut buf)?;
    }
    Ok(buf)
}

/// Frees a single blob's storage outright.
pub fn free(storage: &mut dyn BlobStorage, rid: Rid) -> Result<()> {
    let header = read_header(storage, rid)?;
    storage.free_chunk(rid, header.alloc_size)
}

/// Full-record overwrite: in place if the new payload still fits the
/// existing allocation, otherwise a fresh blob (old one freed).
pub fn overwrite(storage: &mut dyn BlobStorage, rid: Rid, new_payload: &[u8]) -> Result<Rid> {
    let header = read_header(storage, rid)?;
    let needed = BLOB_HEADER_SIZE + new_payload.len() as u64;
    if needed <= header.alloc_size {
        let new_header = BlobHeader {
            self_rid: rid,
            alloc_size: header.alloc_size,
            payload_size: new_payload.len() as u64,
            flags: header.flags,
        };
        let mut buf = Vec::with_capacity(needed as usize);
        buf.extend_from_slice(&new_header.encode());
        buf.extend_from_slice(new_payload);
        storage.write_raw(rid, &buf)?;

        let leftover = header.alloc_size - needed;
        if leftover >= SMALLEST_CHUNK_SIZE {
            storage.free_chunk(Rid::from(rid.0 + needed), leftover)?;
        }
        trace!(rid = rid.0, "overwrote blob in place");
        Ok(rid)
    } else {
        let new_rid = allocate(storage, new_payload)?;
        free(storage, rid)?;
        trace!(old = rid.0, new = new_rid.0, "reallocated blob on overwrite");
        Ok(new_rid)
    }
}

/// `HAM_PARTIAL` overwrite: updates `[partial_offset, partial_offset +
/// partial_data.len())` of a record whose full size becomes
/// `full_new_size`. Bytes outside the updated window are copied from the
/// old record where it still covers them, zero-filled otherwise.
pub fn overwrite_partial(
    storage: &mut dyn BlobStorage,
    rid: Rid,
    partial_offset: u64,
    partial_data: &[u8],
    full_new_size: u64,
) -> Result<Rid> {
    let old = read(storage, rid)?;
    let buf = build_partial_buffer(&old, partial_offset, partial_data, full_new_size);
    overwrite(storage, rid, &buf)
}

/// Builds the full `full_new_size`-byte record `overwrite_partial`
/// writes: `old` copied in where it still covers the window, then
/// `partial_data` applied at `partial_offset`, zero-filled elsewhere.
/// Exposed so callers whose existing payload isn't blob-backed (an
/// inline `TINY`/`SMALL`/`EMPTY` record) can build the same buffer
/// without a blob round trip.
pub fn build_partial_buffer(old: &[u8], partial_offset: u64, partial_data: &[u8], full_new_size: u64) -> Vec<u8> {
    let mut buf = vec![0u8; full_new_size as usize];
    let copy_len = (old.len() as u64).min(full_new_size) as usize;
    buf[..copy_len].copy_from_slice(&old[..copy_len]);

    let start = partial_offset as usize;
    let end = (start + partial_data.len()).min(buf.len());
    if start < buf.len() {
        let n = end - start;
        buf[start..end].copy_from_slice(&partial_data[..n]);
    }
    buf
}

/// One entry in a duplicate table: flags plus either an inline payload
/// or a record rid, depending on `DupEntryFlags::INLINE`.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DupEntryFlags: u8 {
        const INLINE = 0x01;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DupEntry {
    pub flags: DupEntryFlags,
    pub data: [u8; 8],
}

impl DupEntry {
    const ENCODED_SIZE: usize = 9;

    pub fn inline(bytes: &[u8]) -> Self {
        let mut data = [0u8; 8];
        data[..bytes.len()].copy_from_slice(bytes);
        DupEntry {
            flags: DupEntryFlags::INLINE,
            data,
        }
    }

    pub fn rid(rid: Rid) -> Self {
        DupEntry {
            flags: DupEntryFlags::empty(),
            data: rid.0.to_le_bytes(),
        }
    }

    pub fn as_rid(&self) -> Option<Rid> {
        if self.flags.contains(DupEntryFlags::INLINE) {
            None
        } else {
            Some(Rid::from(u64::from_le_bytes(self.data)))
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.flags.bits());
        out.extend_from_slice(&self.data);
    }

    fn decode(buf: &[u8]) -> Self {
        let mut data = [0u8; 8];
        data.copy_from_slice(&buf[1..9]);
        DupEntry {
            flags: DupEntryFlags::from_bits_truncate(buf[0]),
            data,
        }
    }
}

/// Where a new duplicate entry is inserted (spec §4.6).
#[derive(Debug, Clone, Copy)]
pub enum DupPosition {
    First,
    Last,
    Before(usize),
    After(usize),
    At(usize),
}

/// A duplicate table is a specialization of a blob whose payload is
/// `(capacity: u32, count: u32, entries[capacity])`.
pub struct DuplicateTable {
    pub entries: Vec<DupEntry>,
    pub capacity: usize,
}

impl DuplicateTable {
    pub fn new() -> Self {
        DuplicateTable {
            entries: Vec::new(),
            capacity: 0,
        }
    }

    fn grow_target(capacity: usize) -> usize {
        if capacity < 64 {
            capacity + 8
        } else {
            capacity + capacity / 3 + 1
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.capacity * DupEntry::ENCODED_SIZE);
        buf.extend_from_slice(&(self.capacity as u32).to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for e in &self.entries {
            e.encode(&mut buf);
        }
        let target = 8 + self.capacity * DupEntry::ENCODED_SIZE;
        buf.resize(target, 0);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::new(ErrorCode::IntegrityViolated));
        }
        let capacity = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let start = 8 + i * DupEntry::ENCODED_SIZE;
            let end = start + DupEntry::ENCODED_SIZE;
            let slice = buf
                .get(start..end)
                .ok_or_else(|| Error::new(ErrorCode::IntegrityViolated))?;
            entries.push(DupEntry::decode(slice));
        }
        Ok(DuplicateTable { entries, capacity })
    }

    pub fn insert(&mut self, entry: DupEntry, pos: DupPosition) -> Result<()> {
        if self.entries.len() >= self.capacity {
            self.capacity = Self::grow_target(self.capacity);
        }
        let idx = match pos {
            DupPosition::First => 0,
            DupPosition::Last => self.entries.len(),
            DupPosition::Before(i) => i,
            DupPosition::After(i) => i + 1,
            DupPosition::At(i) => i,
        };
        let idx = idx.min(self.entries.len());
        self.entries.insert(idx, entry);
        Ok(())
    }

    /// Removes a single entry. Returns whether the table is now empty.
    pub fn erase(&mut self, index: usize) -> Result<bool> {
        if index >= self.entries.len() {
            return Err(Error::new(ErrorCode::KeyNotFound));
        }
        self.entries.remove(index);
        Ok(self.entries.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DuplicateTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Frees a duplicate table blob and, when `free_records` is set, every
/// record blob referenced by a non-inline entry (`HAM_FREE_ALL_DUPES`).
pub fn erase_duplicate_table(
    storage: &mut dyn BlobStorage,
    rid: Rid,
    free_records: bool,
) -> Result<()> {
    if free_records {
        let bytes = read(storage, rid)?;
        let table = DuplicateTable::decode(&bytes)?;
        for entry in &table.entries {
            if let Some(record_rid) = entry.as_rid() {
                free(storage, record_rid)?;
            }
        }
    }
    free(storage, rid)
}
