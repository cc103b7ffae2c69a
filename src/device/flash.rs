//! Flash-memory device: a shared in-memory filesystem keyed by filename,
//! refcounted across handles opening the same name.
//!
//! Spec §9 calls out the source's process-global refcounted table as an
//! anti-pattern to avoid; here the registry is an explicit
//! `Arc<Mutex<FlashRegistry>>` the caller constructs and passes into every
//! `FlashDevice::open`/`create`, never a process-lifetime static.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::device::{Device, DeviceFlags};
use crate::error::{Error, ErrorCode, Result};
use crate::page::Page;
use crate::types::Rid;

struct Entry {
    data: Vec<u8>,
    refcount: u32,
}

/// Explicit, caller-owned registry of named in-memory files.
#[derive(Default)]
pub struct FlashRegistry {
    files: HashMap<String, Entry>,
}

impl FlashRegistry {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }
}

pub struct FlashDevice {
    registry: Arc<Mutex<FlashRegistry>>,
    name: Option<String>,
    flags: DeviceFlags,
    pagesize: u32,
}

impl FlashDevice {
    pub fn new(registry: Arc<Mutex<FlashRegistry>>) -> Self {
        FlashDevice {
            registry,
            name: None,
            flags: DeviceFlags::IN_MEMORY,
            pagesize: crate::page::DEFAULT_PAGE_SIZE,
        }
    }

    fn name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| Error::new(ErrorCode::NotInitialized))
    }
}

impl Device for FlashDevice {
    fn create(&mut self, path: &str, flags: DeviceFlags, _mode: u32) -> Result<()> {
        let mut reg = self.registry.lock().unwrap();
        let entry = reg.files.entry(path.to_string()).or_insert_with(|| Entry {
            data: Vec::new(),
            refcount: 0,
        });
        entry.data.clear();
        entry.refcount += 1;
        self.name = Some(path.to_string());
        self.flags = flags | DeviceFlags::IN_MEMORY;
        Ok(())
    }

    fn open(&mut self, path: &str, flags: DeviceFlags) -> Result<()> {
        let mut reg = self.registry.lock().unwrap();
        let entry = reg
            .files
            .get_mut(path)
            .ok_or_else(|| Error::new(ErrorCode::FileNotFound))?;
        entry.refcount += 1;
        self.name = Some(path.to_string());
        self.flags = flags | DeviceFlags::IN_MEMORY;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(name) = self.name.take() {
            let mut reg = self.registry.lock().unwrap();
            let mut remove = false;
            if let Some(entry) = reg.files.get_mut(&name) {
                entry.refcount = entry.refcount.saturating_sub(1);
                remove = entry.refcount == 0;
            }
            if remove {
                reg.files.remove(&name);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let name = self.name()?.to_string();
        let mut reg = self.registry.lock().unwrap();
        let entry = reg
            .files
            .get_mut(&name)
            .ok_or_else(|| Error::new(ErrorCode::FileNotFound))?;
        entry.data.resize(size as usize, 0);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.name.is_some()
    }

    fn pagesize(&self) -> u32 {
        self.pagesize
    }

    fn set_pagesize(&mut self, pagesize: u32) {
        self.pagesize = pagesize;
    }

    fn filesize(&self) -> Result<u64> {
        let name = self.name()?.to_string();
        let reg = self.registry.lock().unwrap();
        Ok(reg
            .files
            .get(&name)
            .ok_or_else(|| Error::new(ErrorCode::FileNotFound))?
            .data
            .len() as u64)
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let name = self.name()?.to_string();
        let reg = self.registry.lock().unwrap();
        let entry = reg
            .files
            .get(&name)
            .ok_or_else(|| Error::new(ErrorCode::FileNotFound))?;
        let start = offset as usize;
        let src = entry
            .data
            .get(start..start + buf.len())
            .ok_or_else(|| Error::new(ErrorCode::IoError))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let name = self.name()?.to_string();
        let mut reg = self.registry.lock().unwrap();
        let entry = reg
            .files
            .get_mut(&name)
            .ok_or_else(|| Error::new(ErrorCode::FileNotFound))?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > entry.data.len() {
            entry.data.resize(end, 0);
        }
        entry.data[start..end].copy_from_slice(buf);
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

    #[test]
    fn two_handles_share_data_and_refcount() {
        let registry = FlashRegistry::new();
        let mut a = FlashDevice::new(registry.clone());
        a.create("shared", DeviceFlags::empty(), 0).unwrap();
        a.write(0, b"hello").unwrap();

        let mut b = FlashDevice::new(registry.clone());
        b.open("shared", DeviceFlags::empty()).unwrap();
        let mut buf = [0u8; 5];
        b.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        a.close().unwrap();
        // b still holds a reference; data must survive.
        let mut buf2 = [0u8; 5];
        b.read(0, &mut buf2).unwrap();
        assert_eq!(&buf2, b"hello");

        b.close().unwrap();
        assert!(registry.lock().unwrap().files.is_empty());
    }
}
