//! File-backed device: POSIX/Win32 file, optionally memory-mapped.
//!
//! Grounded in the teacher's `os::unix::UnixFile`/`os::windows` split, but
//! narrowed to the read/write/mmap contract spec §4.1 actually needs: no
//! OS locking subsystem, since the engine serializes itself (spec §5).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use memmap2::{Mmap, MmapMut};
use tracing::{debug, warn};

use crate::device::{Device, DeviceFlags};
use crate::error::{Error, ErrorCode, Result};
use crate::page::Page;
use crate::types::Rid;

enum Mapping {
    None,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

pub struct FileDevice {
    path: Option<String>,
    file: Option<File>,
    flags: DeviceFlags,
    pagesize: u32,
    mapping: Mapping,
}

impl FileDevice {
    pub fn new() -> Self {
        FileDevice {
            path: None,
            file: None,
            flags: DeviceFlags::empty(),
            pagesize: crate::page::DEFAULT_PAGE_SIZE,
            mapping: Mapping::None,
        }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::new(ErrorCode::NotInitialized))
    }

    /// Attempts to (re-)establish a memory mapping of the whole file. On
    /// failure, durably disables mmap for the remainder of this device's
    /// lifetime and falls back to pread/pwrite, mirroring spec §4.1's
    /// "first read attempts mmap... durably switches to disable mmap".
    fn try_mmap(&mut self) {
        if self.flags.contains(DeviceFlags::DISABLE_MMAP) {
            return;
        }
        let Some(file) = self.file.as_ref() else {
            return;
        };
        let read_only = self.flags.contains(DeviceFlags::READ_ONLY);
        let result = if read_only {
            unsafe { Mmap::map(file) }.map(Mapping::ReadOnly)
        } else {
            unsafe { MmapMut::map_mut(file) }.map(Mapping::ReadWrite)
        };
        match result {
            Ok(mapping) => self.mapping = mapping,
            Err(err) => {
                warn!(error = %err, "mmap failed, disabling mmap for this device");
                self.flags.insert(DeviceFlags::DISABLE_MMAP);
                self.mapping = Mapping::None;
            }
        }
    }

    fn remap_if_needed(&mut self) {
        if !matches!(self.mapping, Mapping::None) && !self.flags.contains(DeviceFlags::DISABLE_MMAP)
        {
            self.try_mmap();
        }
    }
}

impl Default for FileDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for FileDevice {
    fn create(&mut self, path: &str, flags: DeviceFlags, _mode: u32) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(!flags.contains(DeviceFlags::READ_ONLY))
            .create(true)
            .truncate(true)
            .open(path)?;
        self.path = Some(path.to_string());
        self.file = Some(file);
        self.flags = flags;
        debug!(path, "created file device");
        Ok(())
    }

    fn open(&mut self, path: &str, flags: DeviceFlags) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(!flags.contains(DeviceFlags::READ_ONLY))
            .open(path)?;
        self.path = Some(path.to_string());
        self.file = Some(file);
        self.flags = flags;
        if !flags.contains(DeviceFlags::DISABLE_MMAP) {
            self.try_mmap();
        }
        debug!(path, "opened file device");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.mapping = Mapping::None;
        self.file = None;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Mapping::ReadWrite(m) = &self.mapping {
            m.flush()?;
        }
        if let Some(file) = self.file.as_ref() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.mapping = Mapping::None;
        self.file_mut()?.set_len(size)?;
        self.remap_if_needed();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn pagesize(&self) -> u32 {
        self.pagesize
    }

    fn set_pagesize(&mut self, pagesize: u32) {
        self.pagesize = pagesize;
    }

    fn filesize(&self) -> Result<u64> {
        Ok(self
            .file
            .as_ref()
            .ok_or_else(|| Error::new(ErrorCode::NotInitialized))?
            .metadata()?
            .len())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if let Mapping::ReadOnly(m) = &self.mapping {
            let start = offset as usize;
            if let Some(src) = m.get(start..start + buf.len()) {
                buf.copy_from_slice(src);
                return Ok(());
            }
        }
        if let Mapping::ReadWrite(m) = &self.mapping {
            let start = offset as usize;
            if let Some(src) = m.get(start..start + buf.len()) {
                buf.copy_from_slice(src);
                return Ok(());
            }
        }
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.flags.contains(DeviceFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::DbReadOnly));
        }
        if let Mapping::ReadWrite(m) = &mut self.mapping {
            let start = offset as usize;
            if let Some(dst) = m.get_mut(start..start + buf.len()) {
                dst.copy_from_slice(buf);
                return Ok(());
            }
        }
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn alloc(&mut self, size: u64) -> Result<Rid> {
        let rid = Rid::from(self.filesize()?);
        self.truncate(rid.0 + size)?;
        Ok(rid)
    }

    fn alloc_page(&mut self, page: &mut Page) -> Result<()> {
        let rid = self.alloc(page.data.len() as u64)?;
        page.rid = rid;
        Ok(())
    }

    fn read_page(&mut self, page: &mut Page) -> Result<()> {
        let len = page.data.len();
        let mut buf = vec![0u8; len];
        self.read(page.rid.0, &mut buf)?;
        page.data = buf;
        Ok(())
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        self.write(page.rid.0, &page.data)
    }

    fn set_flags(&mut self, flags: DeviceFlags) {
        self.flags = flags;
        if flags.contains(DeviceFlags::DISABLE_MMAP) {
            self.mapping = Mapping::None;
        }
    }

    fn flags(&self) -> DeviceFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;

    #[test]
    fn create_write_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.hdb");
        let path = path.to_str().unwrap();

        let mut dev = FileDevice::new();
        dev.create(path, DeviceFlags::empty(), 0o644).unwrap();
        dev.truncate(4096).unwrap();
        dev.write(0, b"hello world").unwrap();

        let mut buf = [0u8; 11];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn alloc_page_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.hdb");
        let path = path.to_str().unwrap();

        let mut dev = FileDevice::new();
        dev.create(path, DeviceFlags::empty(), 0o644).unwrap();

        let mut page = Page::new(crate::page::PageId(0), Rid::NONE, 512, PageType::BtreeNode);
        dev.alloc_page(&mut page).unwrap();
        assert_eq!(page.rid, Rid::from(0));
        assert_eq!(dev.filesize().unwrap(), 512);

        let mut page2 = Page::new(crate::page::PageId(1), Rid::NONE, 512, PageType::BtreeNode);
        dev.alloc_page(&mut page2).unwrap();
        assert_eq!(page2.rid, Rid::from(512));
    }

    #[test]
    fn read_only_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.hdb");
        let path = path.to_str().unwrap();

        let mut dev = FileDevice::new();
        dev.create(path, DeviceFlags::empty(), 0o644).unwrap();
        dev.truncate(512).unwrap();
        dev.close().unwrap();

        let mut dev = FileDevice::new();
        dev.open(path, DeviceFlags::READ_ONLY).unwrap();
        assert!(dev.write(0, b"x").is_err());
    }
}
