//! In-memory device for `IN_MEMORY_DB`: backed by a growable heap buffer.
//!
//! Per spec §4.1, `alloc_page` "returns a pointer-as-rid"; here it returns
//! the next free aligned offset into the growable buffer instead of an
//! actual pointer, keeping the model free of raw pointers (DESIGN.md Open
//! Question decision). Seek-style random access beyond the buffer's current
//! length is an error, matching "seek operations return not implemented"
//! for anything this device cannot represent.

use crate::device::{Device, DeviceFlags};
use crate::error::{Error, ErrorCode, Result};
use crate::page::Page;
use crate::types::Rid;

pub struct MemoryDevice {
    buf: Vec<u8>,
    flags: DeviceFlags,
    pagesize: u32,
    open: bool,
}

impl MemoryDevice {
    pub fn new() -> Self {
        MemoryDevice {
            buf: Vec::new(),
            flags: DeviceFlags::IN_MEMORY,
            pagesize: crate::page::DEFAULT_PAGE_SIZE,
            open: false,
        }
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for MemoryDevice {
    fn create(&mut self, _path: &str, flags: DeviceFlags, _mode: u32) -> Result<()> {
        self.buf.clear();
        self.flags = flags | DeviceFlags::IN_MEMORY;
        self.open = true;
        Ok(())
    }

    fn open(&mut self, _path: &str, flags: DeviceFlags) -> Result<()> {
        self.flags = flags | DeviceFlags::IN_MEMORY;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.buf.resize(size as usize, 0);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn pagesize(&self) -> u32 {
        self.pagesize
    }

    fn set_pagesize(&mut self, pagesize: u32) {
        self.pagesize = pagesize;
    }

    fn filesize(&self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        let src = self
            .buf
            .get(start..end)
            .ok_or_else(|| Error::new(ErrorCode::IoError))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn alloc(&mut self, size: u64) -> Result<Rid> {
        let rid = Rid::from(self.buf.len() as u64);
        self.buf.resize(self.buf.len() + size as usize, 0);
        Ok(rid)
    }

    fn alloc_page(&mut self, page: &mut Page) -> Result<()> {
        let rid = self.alloc(page.data.len() as u64)?;
        page.rid = rid;
        Ok(())
    }

    fn read_page(&mut self, page: &mut Page) -> Result<()> {
        let len = page.data.len();
        let mut tmp = vec![0u8; len];
        self.read(page.rid.0, &mut tmp)?;
        page.data = tmp;
        Ok(())
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        self.write(page.rid.0, &page.data)
    }

    fn set_flags(&mut self, flags: DeviceFlags) {
        self.flags = flags | DeviceFlags::IN_MEMORY;
    }

    fn flags(&self) -> DeviceFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageId, PageType};

    #[test]
    fn grows_on_write_past_end() {
        let mut dev = MemoryDevice::new();
        dev.open("mem", DeviceFlags::empty()).unwrap();
        dev.write(100, b"hi").unwrap();
        assert_eq!(dev.filesize().unwrap(), 102);
    }

    #[test]
    fn alloc_page_offsets_do_not_overlap() {
        let mut dev = MemoryDevice::new();
        dev.open("mem", DeviceFlags::empty()).unwrap();
        let mut p1 = Page::new(PageId(0), Rid::NONE, 256, PageType::BtreeNode);
        let mut p2 = Page::new(PageId(1), Rid::NONE, 256, PageType::BtreeNode);
        dev.alloc_page(&mut p1).unwrap();
        dev.alloc_page(&mut p2).unwrap();
        assert_ne!(p1.rid, p2.rid);
        assert_eq!(p2.rid.0 - p1.rid.0, 256);
    }
}
