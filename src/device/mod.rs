//! Device abstraction: block I/O over a logical byte range starting at 0.
//!
//! Mirrors the teacher's `os::vfs::{Vfs, VfsFile}` split, but narrowed to
//! what the storage engine core actually needs (spec §4.1): no locking
//! subsystem, since the engine is single-threaded cooperative per spec §5.

pub mod file;
pub mod memory;

#[cfg(feature = "flash-device")]
pub mod flash;

use crate::error::Result;
use crate::page::Page;
use crate::types::Rid;

bitflags::bitflags! {
    /// Flags passed to `Device::create`/`open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        const READ_ONLY    = 0x01;
        const DISABLE_MMAP = 0x02;
        const IN_MEMORY    = 0x04;
    }
}

/// A Device provides block I/O over a logical byte range starting at offset 0.
///
/// Concrete devices: `file::FileDevice` (POSIX/Win32 file, optionally
/// memory-mapped), `memory::MemoryDevice` (heap-backed, for `IN_MEMORY_DB`),
/// and, behind the `flash-device` feature, `flash::FlashDevice` (a shared
/// in-memory filesystem keyed by filename).
pub trait Device: Send {
    fn create(&mut self, path: &str, flags: DeviceFlags, mode: u32) -> Result<()>;
    fn open(&mut self, path: &str, flags: DeviceFlags) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn truncate(&mut self, size: u64) -> Result<()>;
    fn is_open(&self) -> bool;
    fn pagesize(&self) -> u32;
    fn set_pagesize(&mut self, pagesize: u32);
    fn filesize(&self) -> Result<u64>;

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Allocates `size` bytes at the end of the device, returning the rid of
    /// the new region. `size` need not be page-sized (used by the blob
    /// store and freelist for non-page allocations via the device directly).
    fn alloc(&mut self, size: u64) -> Result<Rid>;

    /// Allocates a full page at the end of the device and loads it into
    /// `page` (spec §4.1: `alloc_page`).
    fn alloc_page(&mut self, page: &mut Page) -> Result<()>;

    /// Reads `page`'s content from the device, memory-mapping when aligned
    /// and permitted.
    fn read_page(&mut self, page: &mut Page) -> Result<()>;

    /// Writes `page`'s current content to the device at its rid.
    fn write_page(&mut self, page: &Page) -> Result<()>;

    /// Returns a page's storage to the device's free space notion, if the
    /// device tracks one directly (most devices leave this to the freelist
    /// and no-op here).
    fn free_page(&mut self, _page: &Page) -> Result<()> {
        Ok(())
    }

    fn set_flags(&mut self, flags: DeviceFlags);
    fn flags(&self) -> DeviceFlags;
}
