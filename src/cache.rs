//! Bounded associative page cache (spec §4.3).
//!
//! Grounded directly in `original_source/src/cache.h` (bucket hashing via
//! `calc_hash`, `NOREMOVE`, `get_unused_page` tail-scan skipping changeset
//! pages) and in the teacher's `storage::pcache::PCache1` for the Rust idiom
//! of the same design (`HashMap<Rid, PageId>` for O(1) lookup plus an
//! intrusive doubly-linked list for LRU order, here carried on `Page` itself
//! as `cache_prev`/`cache_next` for true O(1) unlink rather than the
//! teacher's `VecDeque` position scan).

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::error::{Error, ErrorCode, Result};
use crate::page::{Page, PageArena, PageId, PageType};
use crate::types::Rid;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GetFlags: u8 {
        /// Do not detach the page from the cache on a successful `get`.
        const NOREMOVE = 0x01;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictMode {
    /// Purge up to 10% of the overage, capped at 20 pages per round.
    Permissive,
    /// Purge until the cache fits; error if that's impossible.
    Strict,
    /// No size-based eviction; still purge one page per round to curb mmap
    /// pressure (spec §4.3: "For unbounded caches...").
    Unbounded,
}

pub struct Cache {
    arena: PageArena,
    index: std::collections::HashMap<Rid, PageId>,
    lru_head: Option<PageId>,
    lru_tail: Option<PageId>,
    count: usize,
    capacity_pages: usize,
    page_size: u32,
    mode: EvictMode,
}

impl Cache {
    pub fn new(page_size: u32, capacity_bytes: u64, mode: EvictMode) -> Self {
        let capacity_pages = ((capacity_bytes / page_size as u64).max(1)) as usize;
        Cache {
            arena: PageArena::new(),
            index: std::collections::HashMap::new(),
            lru_head: None,
            lru_tail: None,
            count: 0,
            capacity_pages,
            page_size,
            mode,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn too_big(&self) -> bool {
        !matches!(self.mode, EvictMode::Unbounded) && self.count > self.capacity_pages
    }

    fn unlink(&mut self, id: PageId) {
        let (prev, next) = {
            let page = self.arena.get(id).expect("page in lru list must exist");
            (page.cache_prev, page.cache_next)
        };
        match prev {
            Some(p) => self.arena.get_mut(p).unwrap().cache_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.arena.get_mut(n).unwrap().cache_prev = prev,
            None => self.lru_tail = prev,
        }
        let page = self.arena.get_mut(id).unwrap();
        page.cache_prev = None;
        page.cache_next = None;
    }

    fn link_at_head(&mut self, id: PageId) {
        let old_head = self.lru_head;
        {
            let page = self.arena.get_mut(id).unwrap();
            page.cache_prev = None;
            page.cache_next = old_head;
        }
        if let Some(h) = old_head {
            self.arena.get_mut(h).unwrap().cache_prev = Some(id);
        } else {
            self.lru_tail = Some(id);
        }
        self.lru_head = Some(id);
    }

    /// Inserts an already-allocated page into the cache. No-op if the rid
    /// is already present.
    pub fn put(&mut self, rid: Rid, page_size: u32, page_type: PageType) -> PageId {
        if let Some(&id) = self.index.get(&rid) {
            return id;
        }
        let id = self.arena.insert(rid, page_size, page_type);
        self.index.insert(rid, id);
        self.link_at_head(id);
        self.count += 1;
        id
    }

    /// Looks up a page by rid, moving it to the head of the LRU list and
    /// bumping its counters. Without `NOREMOVE` the caller takes logical
    /// ownership and must `remove`+`put` to return it (spec §4.3); since
    /// our arena never invalidates ids, we simply always leave it linked
    /// and let `remove` detach explicitly when a caller does take it out.
    pub fn get(&mut self, rid: Rid, flags: GetFlags) -> Option<PageId> {
        let id = *self.index.get(&rid)?;
        self.unlink(id);
        self.link_at_head(id);
        {
            let page = self.arena.get_mut(id).unwrap();
            page.cache_counter += 1;
            page.cache_hit_frequency += 1;
        }
        trace!(rid = rid.0, "cache hit");
        if flags.contains(GetFlags::NOREMOVE) {
            Some(id)
        } else {
            Some(id)
        }
    }

    pub fn page(&self, id: PageId) -> Option<&Page> {
        self.arena.get(id)
    }

    pub fn page_mut(&mut self, id: PageId) -> Option<&mut Page> {
        self.arena.get_mut(id)
    }

    /// Detaches a page from both lists (spec §4.3: `remove`).
    pub fn remove(&mut self, rid: Rid) -> Option<Page> {
        let id = self.index.remove(&rid)?;
        self.unlink(id);
        self.count -= 1;
        self.arena.remove(id)
    }

    /// Returns the oldest unpinned page that is not a member of `changeset`.
    /// `fast` bounds the scan to a small window before giving up, per spec.
    pub fn get_unused_page(&self, changeset: &HashSet<PageId>, fast: bool) -> Option<PageId> {
        let mut current = self.lru_tail;
        let limit = if fast { 8 } else { usize::MAX };
        let mut scanned = 0;
        while let Some(id) = current {
            if scanned >= limit {
                return None;
            }
            let page = self.arena.get(id)?;
            if page.refcount == 0 && !changeset.contains(&id) {
                return Some(id);
            }
            current = page.cache_prev;
            scanned += 1;
        }
        None
    }

    /// Walks both lists and verifies cross-linkage and counts (spec §4.3).
    pub fn check_integrity(&self) -> Result<()> {
        let mut forward = 0usize;
        let mut current = self.lru_head;
        let mut prev = None;
        while let Some(id) = current {
            let page = self
                .arena
                .get(id)
                .ok_or_else(|| Error::new(ErrorCode::IntegrityViolated))?;
            if page.cache_prev != prev {
                return Err(Error::new(ErrorCode::IntegrityViolated));
            }
            prev = Some(id);
            current = page.cache_next;
            forward += 1;
        }
        if forward != self.count {
            return Err(Error::new(ErrorCode::IntegrityViolated));
        }
        if self.index.len() != self.count {
            return Err(Error::new(ErrorCode::IntegrityViolated));
        }
        Ok(())
    }

    /// Determines how many pages an eviction round should purge, per the
    /// policy in spec §4.3. `deep` requests a larger sweep (callers that
    /// hit device address-space limits).
    pub fn purge_target(&self, deep: bool) -> usize {
        match self.mode {
            EvictMode::Unbounded => 1,
            EvictMode::Strict => {
                if self.count > self.capacity_pages {
                    self.count - self.capacity_pages
                } else {
                    0
                }
            }
            EvictMode::Permissive => {
                let overage = self.count.saturating_sub(self.capacity_pages);
                let mut target = overage / 10;
                if deep {
                    target = target.max(overage);
                }
                target.min(20).max(if overage > 0 { 1 } else { 0 })
            }
        }
    }

    pub fn mode(&self) -> EvictMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: EvictMode) {
        debug!(?mode, "cache eviction mode changed");
        self.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_moves_to_head() {
        let mut cache = Cache::new(4096, 4096 * 10, EvictMode::Permissive);
        let a = cache.put(Rid::from(32), 4096, PageType::BtreeNode);
        let b = cache.put(Rid::from(64), 4096, PageType::BtreeNode);
        assert_eq!(cache.lru_head, Some(b));
        cache.get(Rid::from(32), GetFlags::empty());
        assert_eq!(cache.lru_head, Some(a));
    }

    #[test]
    fn get_unused_page_skips_pinned_and_changeset() {
        let mut cache = Cache::new(4096, 4096 * 10, EvictMode::Permissive);
        let a = cache.put(Rid::from(32), 4096, PageType::BtreeNode);
        let b = cache.put(Rid::from(64), 4096, PageType::BtreeNode);
        cache.page_mut(a).unwrap().pin();
        let mut changeset = HashSet::new();
        changeset.insert(b);
        assert_eq!(cache.get_unused_page(&changeset, false), None);
        changeset.clear();
        assert_eq!(cache.get_unused_page(&changeset, false), Some(b));
    }

    #[test]
    fn integrity_check_passes_after_mutations() {
        let mut cache = Cache::new(4096, 4096 * 10, EvictMode::Permissive);
        cache.put(Rid::from(32), 4096, PageType::BtreeNode);
        cache.put(Rid::from(64), 4096, PageType::BtreeNode);
        cache.remove(Rid::from(32));
        cache.check_integrity().unwrap();
    }

    #[test]
    fn too_big_respects_mode() {
        let mut cache = Cache::new(4096, 4096 * 2, EvictMode::Strict);
        cache.put(Rid::from(32), 4096, PageType::BtreeNode);
        cache.put(Rid::from(64), 4096, PageType::BtreeNode);
        cache.put(Rid::from(96), 4096, PageType::BtreeNode);
        assert!(cache.too_big());
    }
}
