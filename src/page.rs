//! In-memory page descriptor (spec §4.2).
//!
//! Modeled per the design note in spec §9: a single page arena (`PageArena`)
//! owning `Page` records behind a stable `PageId` index, rather than the
//! C original's reference cycles. The "up to five lists" a page can belong
//! to become: an intrusive doubly-linked LRU list (`cache_prev`/`cache_next`,
//! owned by `Cache`, true O(1) unlink) for the cache's total list, plus
//! O(1) `HashSet<PageId>` membership for the hash bucket (folded into the
//! cache's `HashMap<Rid, PageId>`), the changeset, the per-database list,
//! and the per-transaction list, each a plain set rather than a fifth
//! intrusive chain, since nothing needs ordering within those four.

use bitflags::bitflags;

use crate::types::Rid;

/// Default page size: matches common OS page granularity.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Minimum page size (spec §3: "otherwise >= 256 bytes, power-of-two"); the
/// engine additionally requires >= 512 so the header page always fits.
pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Size of the persistent per-page header (self-rid, flags, type tag).
pub const PAGE_HEADER_SIZE: usize = 13;

/// Stable arena index identifying a `Page`, independent of list membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub usize);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Page content differs from the on-device image.
        const DIRTY = 0x01;
        /// Blob pages store payload from byte 0; no persistent header.
        const NO_HEADER = 0x02;
        /// Payload buffer is a heap allocation, not an mmap view.
        const MALLOCED = 0x04;
    }
}

/// Page type tag, stored in the persistent per-page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Header = 0,
    BtreeRoot = 1,
    BtreeNode = 2,
    Blob = 3,
    Freelist = 4,
    DupeTable = 5,
    Unknown = 6,
}

impl PageType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => PageType::Header,
            1 => PageType::BtreeRoot,
            2 => PageType::BtreeNode,
            3 => PageType::Blob,
            4 => PageType::Freelist,
            5 => PageType::DupeTable,
            _ => PageType::Unknown,
        }
    }
}

/// In-memory descriptor for one disk page.
pub struct Page {
    pub id: PageId,
    pub rid: Rid,
    pub data: Vec<u8>,
    pub flags: PageFlags,
    pub page_type: PageType,
    /// Pin counter; non-zero prevents eviction.
    pub refcount: u32,
    /// Coupled cursors referencing this page, by opaque cursor id.
    pub cursors: Vec<u64>,
    /// LRU list links, owned by `Cache`.
    pub cache_prev: Option<PageId>,
    pub cache_next: Option<PageId>,
    /// Eviction bookkeeping (spec §4.2).
    pub cache_counter: u64,
    pub cache_hit_frequency: u32,
}

impl Page {
    pub fn new(id: PageId, rid: Rid, page_size: u32, page_type: PageType) -> Self {
        Page {
            id,
            rid,
            data: vec![0u8; page_size as usize],
            flags: PageFlags::MALLOCED,
            page_type,
            refcount: 0,
            cursors: Vec::new(),
            cache_prev: None,
            cache_next: None,
            cache_counter: 0,
            cache_hit_frequency: 0,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    pub fn mark_dirty(&mut self) {
        self.flags.insert(PageFlags::DIRTY);
    }

    pub fn mark_clean(&mut self) {
        self.flags.remove(PageFlags::DIRTY);
    }

    pub fn pin(&mut self) {
        self.refcount += 1;
    }

    pub fn unpin(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
    }

    pub fn is_pinned(&self) -> bool {
        self.refcount > 0
    }

    pub fn attach_cursor(&mut self, cursor_id: u64) {
        if !self.cursors.contains(&cursor_id) {
            self.cursors.push(cursor_id);
        }
    }

    pub fn detach_cursor(&mut self, cursor_id: u64) {
        self.cursors.retain(|&c| c != cursor_id);
    }

    pub fn has_cursors(&self) -> bool {
        !self.cursors.is_empty()
    }

    /// Serializes the persistent per-page header into `data[0..PAGE_HEADER_SIZE]`.
    /// No-op for pages tagged `NO_HEADER` (blob pages store payload from byte 0).
    pub fn write_header(&mut self) {
        if self.flags.contains(PageFlags::NO_HEADER) {
            return;
        }
        let _ = crate::codec::write_u64(&mut self.data, 0, self.rid.0);
        self.data[8] = self.flags.bits() & !(PageFlags::MALLOCED.bits());
        self.data[9] = self.page_type as u8;
    }

    pub fn read_header(&mut self) -> crate::error::Result<()> {
        if self.flags.contains(PageFlags::NO_HEADER) {
            return Ok(());
        }
        let rid = crate::codec::read_u64(&self.data, 0)?;
        self.page_type = PageType::from_u8(self.data[9]);
        let _ = rid;
        Ok(())
    }
}

/// Arena owning all `Page` records for an environment. Pages are never
/// removed from the middle of the `Vec`; freed slots are recycled via
/// `free_slots` so `PageId`s handed out earlier never dangle while still
/// referenced (e.g. by a cursor that hasn't uncoupled yet).
pub struct PageArena {
    pages: Vec<Option<Page>>,
    free_slots: Vec<usize>,
}

impl PageArena {
    pub fn new() -> Self {
        PageArena {
            pages: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn insert(&mut self, rid: Rid, page_size: u32, page_type: PageType) -> PageId {
        let id = if let Some(slot) = self.free_slots.pop() {
            PageId(slot)
        } else {
            let slot = self.pages.len();
            self.pages.push(None);
            PageId(slot)
        };
        self.pages[id.0] = Some(Page::new(id, rid, page_size, page_type));
        id
    }

    pub fn get(&self, id: PageId) -> Option<&Page> {
        self.pages.get(id.0).and_then(|p| p.as_ref())
    }

    pub fn get_mut(&mut self, id: PageId) -> Option<&mut Page> {
        self.pages.get_mut(id.0).and_then(|p| p.as_mut())
    }

    pub fn remove(&mut self, id: PageId) -> Option<Page> {
        let removed = self.pages.get_mut(id.0).and_then(|p| p.take());
        if removed.is_some() {
            self.free_slots.push(id.0);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PageArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_prevents_logical_eviction_state() {
        let mut p = Page::new(PageId(0), Rid::from(32), 4096, PageType::BtreeNode);
        assert!(!p.is_pinned());
        p.pin();
        assert!(p.is_pinned());
        p.unpin();
        assert!(!p.is_pinned());
    }

    #[test]
    fn cursor_attach_is_idempotent() {
        let mut p = Page::new(PageId(0), Rid::from(32), 4096, PageType::BtreeNode);
        p.attach_cursor(1);
        p.attach_cursor(1);
        assert_eq!(p.cursors.len(), 1);
        p.detach_cursor(1);
        assert!(!p.has_cursors());
    }

    #[test]
    fn arena_recycles_freed_slots() {
        let mut arena = PageArena::new();
        let id1 = arena.insert(Rid::from(32), 4096, PageType::BtreeNode);
        arena.remove(id1);
        let id2 = arena.insert(Rid::from(64), 4096, PageType::BtreeNode);
        assert_eq!(id1, id2);
        assert_eq!(arena.len(), 1);
    }
}
