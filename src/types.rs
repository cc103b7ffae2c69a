//! Core identifiers and small value types shared across the engine.

use bitflags::bitflags;

/// Smallest allocatable unit, in bytes. All persistent allocations are
/// multiples of this; tunable at compile time per the spec's glossary entry.
pub const CHUNK_SIZE: u64 = 32;

/// A 64-bit byte offset into the backing store; the primary key of every
/// persistent object. `Rid::NONE` (0) never denotes a valid object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Rid(pub u64);

impl Rid {
    pub const NONE: Rid = Rid(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn is_some(&self) -> bool {
        self.0 != 0
    }

    /// Rounds up to the next multiple of `CHUNK_SIZE`.
    pub fn chunk_align(offset: u64) -> u64 {
        (offset + CHUNK_SIZE - 1) / CHUNK_SIZE * CHUNK_SIZE
    }

    pub fn is_chunk_aligned(&self) -> bool {
        self.0 % CHUNK_SIZE == 0
    }
}

impl From<u64> for Rid {
    fn from(v: u64) -> Self {
        Rid(v)
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rid({})", self.0)
    }
}

/// Data-access-mode hint used by the freelist to bias allocation scans
/// (see GLOSSARY: DAM).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dam {
    #[default]
    Unknown,
    SequentialInsert,
    RandomWrite,
}

bitflags! {
    /// Per-call and per-database behavior flags from the external interface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        const IN_MEMORY_DB         = 0x0000_0001;
        const ENABLE_RECOVERY      = 0x0000_0002;
        const AUTO_RECOVERY        = 0x0000_0004;
        const ENABLE_TRANSACTIONS  = 0x0000_0008;
        const READ_ONLY            = 0x0000_0010;
        const CACHE_STRICT         = 0x0000_0020;
        const CACHE_UNLIMITED      = 0x0000_0040;
        const DISABLE_MMAP         = 0x0000_0080;
        const DISABLE_VAR_KEYLEN   = 0x0000_0100;
        const ENABLE_DUPLICATES    = 0x0000_0200;
        const SORT_DUPLICATES      = 0x0000_0400;
        const RECORD_NUMBER        = 0x0000_0800;
        const DONT_CLEAR_LOG       = 0x0000_1000;
        const AUTO_CLEANUP         = 0x0000_2000;
    }

    /// Per-call flags passed to individual operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CallFlags: u32 {
        const OVERWRITE        = 0x0001;
        const DUPLICATE        = 0x0002;
        const DUPLICATE_INSERT_BEFORE = 0x0004;
        const DUPLICATE_INSERT_AFTER  = 0x0008;
        const DUPLICATE_INSERT_FIRST  = 0x0010;
        const DUPLICATE_INSERT_LAST   = 0x0020;
        const PARTIAL          = 0x0040;
        const DIRECT_ACCESS     = 0x0080;
        const SKIP_DUPLICATES  = 0x0100;
        const FREE_ALL_DUPES   = 0x0200;
        const FIND_LT_MATCH    = 0x0400;
        const FIND_GT_MATCH    = 0x0800;
        const FIND_EXACT_MATCH = 0x1000;
    }

    /// Directions for `Cursor::move_cursor`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MoveFlags: u32 {
        const FIRST    = 0x01;
        const LAST     = 0x02;
        const NEXT     = 0x04;
        const PREVIOUS = 0x08;
        const SKIP_DUPLICATES = 0x10;
    }
}
