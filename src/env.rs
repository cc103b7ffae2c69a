//! Environment: owns the device, cache, log, freelist, header page, the
//! active transaction, and the set of open databases (spec §4.10).

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::blob::BlobStorage;
use crate::btree::node::{self as btree_node};
use crate::btree::{Btree, NodeStorage, StructuralObserver};
use crate::cache::Cache;
use crate::codec::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};
use crate::config::{DbConfig, EnvConfig};
use crate::cursor::Cursor;
use crate::database::Database;
use crate::device::file::FileDevice;
use crate::device::memory::MemoryDevice;
use crate::device::{Device, DeviceFlags};
use crate::error::{Error, ErrorCode, Result};
use crate::filter::FileFilter;
use crate::freelist::Freelist;
use crate::log::Log;
use crate::txn::Txn;
use crate::types::{CallFlags, Dam, DbFlags, Rid};

const HEADER_MAGIC: u32 = 0x484d_5342; // "HMSB"
const CURRENT_VERSION: (u8, u8, u8) = (2, 0, 0);
const DB_INDEX_ENTRY_SIZE: usize = 2 + 2 + 2 + 2 + 8 + 8 + 4;
const HEADER_FIXED_SIZE: usize = 4 + 4 + 4 + 4 + 2 + 2;

#[derive(Debug, Clone)]
pub struct DbIndexEntry {
    pub name: u16,
    pub flags: DbFlags,
    pub key_size: u16,
    pub max_keys: u16,
    pub root_rid: Rid,
    pub recno: u64,
}

/// The environment's page-0 header, per spec §6's byte layout plus the
/// legacy-version triple recovered from `original_source/src/env.h`.
#[derive(Debug, Clone)]
pub struct HeaderPage {
    pub magic: u32,
    pub version: (u8, u8, u8),
    pub serial: u32,
    pub page_size: u32,
    pub max_databases: u16,
    pub index: Vec<DbIndexEntry>,
}

impl HeaderPage {
    pub fn new(page_size: u32, max_databases: u16) -> Self {
        HeaderPage {
            magic: HEADER_MAGIC,
            version: CURRENT_VERSION,
            serial: 0,
            page_size,
            max_databases,
            index: Vec::new(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.version.0 == 1 && self.version.1 == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.page_size as usize];
        write_u32(&mut buf, 0, self.magic).unwrap();
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.version.2;
        write_u32(&mut buf, 8, self.serial).unwrap();
        write_u32(&mut buf, 12, self.page_size).unwrap();
        write_u16(&mut buf, 16, self.max_databases).unwrap();
        write_u16(&mut buf, 18, self.index.len() as u16).unwrap();
        let mut offset = HEADER_FIXED_SIZE;
        for entry in &self.index {
            write_u16(&mut buf, offset, entry.name).unwrap();
            write_u16(&mut buf, offset + 2, entry.flags.bits() as u16).unwrap();
            write_u16(&mut buf, offset + 4, entry.key_size).unwrap();
            write_u16(&mut buf, offset + 6, entry.max_keys).unwrap();
            write_u64(&mut buf, offset + 8, entry.root_rid.0).unwrap();
            write_u64(&mut buf, offset + 16, entry.recno).unwrap();
            offset += DB_INDEX_ENTRY_SIZE;
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let magic = read_u32(buf, 0)?;
        if magic != HEADER_MAGIC {
            return Err(Error::new(ErrorCode::InvFileHeader));
        }
        let version = (buf[4], buf[5], buf[6]);
        let serial = read_u32(buf, 8)?;
        let page_size = read_u32(buf, 12)?;
        let max_databases = read_u16(buf, 16)?;
        let count = read_u16(buf, 18)? as usize;
        let mut index = Vec::with_capacity(count);
        let mut offset = HEADER_FIXED_SIZE;
        for _ in 0..count {
            index.push(DbIndexEntry {
                name: read_u16(buf, offset)?,
                flags: DbFlags::from_bits_truncate(read_u16(buf, offset + 2)? as u32),
                key_size: read_u16(buf, offset + 4)?,
                max_keys: read_u16(buf, offset + 6)?,
                root_rid: Rid::from(read_u64(buf, offset + 8)?),
                recno: read_u64(buf, offset + 16)?,
            });
            offset += DB_INDEX_ENTRY_SIZE;
        }
        Ok(HeaderPage {
            magic,
            version,
            serial,
            page_size,
            max_databases,
            index,
        })
    }
}

/// The log's two segment files live alongside the database file, as
/// `<name>.log0`/`<name>.log1` rather than inside the file itself.
fn log_dir_for(path: &str) -> std::path::PathBuf {
    let p = std::path::Path::new(path);
    match p.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    }
}

fn ensure_covers(device: &mut dyn Device, end_offset: u64) -> Result<()> {
    if device.filesize()? < end_offset {
        device.truncate(end_offset)?;
    }
    Ok(())
}

/// Bridges `btree::NodeStorage` and `blob::BlobStorage` to a single
/// page-granularity `Device` + `Freelist`. One struct implementing both
/// traits, rather than two adapters each separately borrowing the
/// device: `Database::insert`/`find`/`erase` need a node view and a blob
/// view in the same call, and two live `&mut` borrows of the same
/// `Device` can't coexist. `Database`'s methods take a single generic
/// `S: NodeStorage + BlobStorage` and reborrow it as each trait object
/// in turn.
///
/// When `log` is set, every write logs its before-image (`Log::prewrite`)
/// and after-image (`Log::write`) under `txn_id` first, so an abort that's
/// already hit the device gets undone by recovery on the next open (spec
/// §4.5's physical redo/undo model).
struct PagedStorage<'a> {
    device: &'a mut dyn Device,
    freelist: &'a mut Freelist,
    page_size: u32,
    log: Option<&'a mut Log>,
    txn_id: u64,
}

impl<'a> PagedStorage<'a> {
    fn logged_write(&mut self, rid: Rid, buf: &[u8]) -> Result<()> {
        if let Some(log) = self.log.as_deref_mut() {
            if self.txn_id != 0 {
                let mut before = vec![0u8; buf.len()];
                let _ = self.device.read(rid.0, &mut before);
                log.prewrite(self.txn_id, rid, &before)?;
                self.device.write(rid.0, buf)?;
                log.write(self.txn_id, rid, buf)?;
                log.flush_page(self.txn_id, rid)?;
                return Ok(());
            }
        }
        self.device.write(rid.0, buf)
    }
}

impl<'a> NodeStorage for PagedStorage<'a> {
    fn alloc_node(&mut self) -> Result<Rid> {
        let rid = self.freelist.alloc_page(self.page_size, Dam::Unknown)?;
        ensure_covers(self.device, rid.0 + self.page_size as u64)?;
        Ok(rid)
    }

    fn free_node(&mut self, rid: Rid) -> Result<()> {
        self.freelist.mark_free(rid, self.page_size as u64, true)
    }

    fn read_node(&mut self, rid: Rid) -> Result<crate::btree::BtreeNode> {
        let mut buf = vec![0u8; self.page_size as usize];
        self.device.read(rid.0, &mut buf)?;
        crate::btree::codec::decode(&buf)
    }

    fn write_node(&mut self, rid: Rid, node: &crate::btree::BtreeNode) -> Result<()> {
        let mut buf = crate::btree::codec::encode(node);
        if buf.len() > self.page_size as usize {
            return Err(Error::new(ErrorCode::InvPagesize));
        }
        buf.resize(self.page_size as usize, 0);
        ensure_covers(self.device, rid.0 + self.page_size as u64)?;
        self.logged_write(rid, &buf)
    }
}

impl<'a> BlobStorage for PagedStorage<'a> {
    fn alloc_chunk(&mut self, size: u64) -> Result<Rid> {
        let rid = self.freelist.alloc_area(size, Dam::Unknown, false)?;
        let allocated = Rid::chunk_align(size);
        ensure_covers(self.device, rid.0 + allocated)?;
        Ok(rid)
    }

    fn free_chunk(&mut self, rid: Rid, size: u64) -> Result<()> {
        self.freelist.mark_free(rid, size, true)
    }

    fn read_raw(&mut self, rid: Rid, buf: &mut [u8]) -> Result<()> {
        self.device.read(rid.0, buf)
    }

    fn write_raw(&mut self, rid: Rid, buf: &[u8]) -> Result<()> {
        ensure_covers(self.device, rid.0 + buf.len() as u64)?;
        self.logged_write(rid, buf)
    }
}

pub struct Environment {
    device: Box<dyn Device>,
    cache: Cache,
    freelist: Freelist,
    log: Option<Log>,
    config: EnvConfig,
    header: HeaderPage,
    next_txn_id: u64,
    active_txn: Option<Txn>,
    databases: HashMap<u16, Database>,
    file_filters: Vec<Box<dyn FileFilter>>,
}

impl Environment {
    fn new_device(config: &EnvConfig) -> Box<dyn Device> {
        if config.flags.contains(DbFlags::IN_MEMORY_DB) {
            Box::new(MemoryDevice::new())
        } else {
            Box::new(FileDevice::new())
        }
    }

    /// Allocates the device, writes the header page, and, when
    /// `ENABLE_RECOVERY` is set, creates the two log segments.
    pub fn create(path: &str, config: EnvConfig) -> Result<Self> {
        config.validate()?;
        let mut device = Self::new_device(&config);
        let device_flags = if config.flags.contains(DbFlags::DISABLE_MMAP) {
            DeviceFlags::DISABLE_MMAP
        } else {
            DeviceFlags::empty()
        };
        device.create(path, device_flags, 0o644)?;

        let mut freelist = Freelist::new(config.page_size);
        // Claim page 0 for the header: the freelist starts with every
        // chunk marked free, so the first allocation naturally lands there.
        let header_rid = freelist.alloc_page(config.page_size, Dam::Unknown)?;
        debug_assert_eq!(header_rid, Rid::from(0));
        ensure_covers(device.as_mut(), config.page_size as u64)?;

        let header = HeaderPage::new(config.page_size, config.max_databases);
        device.write(0, &header.encode())?;

        let log = if config.flags.contains(DbFlags::ENABLE_RECOVERY) {
            Some(Log::create(log_dir_for(path), config.journal_size_limit.max(0) as u64)?)
        } else {
            None
        };

        info!(page_size = config.page_size, "environment created");
        Ok(Environment {
            device,
            cache: Cache::new(config.page_size, config.cache_size_bytes, crate::cache::EvictMode::Permissive),
            freelist,
            log,
            config,
            header,
            next_txn_id: 1,
            active_txn: None,
            databases: HashMap::new(),
            file_filters: Vec::new(),
        })
    }

    /// Reads the header, validates magic/version (accepting 1.0.x as
    /// legacy), and recovers if both log segments are non-empty.
    pub fn open(path: &str, mut config: EnvConfig) -> Result<Self> {
        let mut device = Self::new_device(&config);
        let device_flags = if config.flags.contains(DbFlags::DISABLE_MMAP) {
            DeviceFlags::DISABLE_MMAP
        } else {
            DeviceFlags::empty()
        };
        device.open(path, device_flags)?;

        let mut probe = vec![0u8; crate::page::MIN_PAGE_SIZE as usize];
        device.read(0, &mut probe)?;
        let page_size = read_u32(&probe, 12)?;
        config.page_size = page_size;

        let mut buf = vec![0u8; page_size as usize];
        device.read(0, &mut buf)?;
        let header = HeaderPage::decode(&buf)?;
        if !header.is_legacy() && header.version.0 != CURRENT_VERSION.0 {
            return Err(Error::new(ErrorCode::InvFileVersion));
        }

        let mut freelist = Freelist::new(page_size);
        let header_rid = freelist.alloc_page(page_size, Dam::Unknown)?;
        debug_assert_eq!(header_rid, Rid::from(0));

        let mut log = if config.flags.contains(DbFlags::ENABLE_RECOVERY) {
            Log::open(log_dir_for(path), config.journal_size_limit.max(0) as u64).ok()
        } else {
            None
        };

        if let Some(log) = log.as_mut() {
            let needs_recovery = !log.committed_transactions()?.is_empty();
            if needs_recovery {
                if config.flags.contains(DbFlags::AUTO_RECOVERY) {
                    Self::run_recovery(log, device.as_mut())?;
                } else {
                    return Err(Error::new(ErrorCode::NeedRecovery));
                }
            }
        }

        info!(page_size, "environment opened");
        Ok(Environment {
            device,
            cache: Cache::new(page_size, config.cache_size_bytes, crate::cache::EvictMode::Permissive),
            freelist,
            log,
            config,
            header,
            next_txn_id: 1,
            active_txn: None,
            databases: HashMap::new(),
            file_filters: Vec::new(),
        })
    }

    fn run_recovery(log: &mut Log, device: &mut dyn Device) -> Result<()> {
        let stats = log.recover(
            |rid, image| device.write(rid.0, image),
            |rid, image| device.write(rid.0, image),
        )?;
        info!(
            records = stats.records_scanned,
            redone = stats.pages_redone,
            undone = stats.pages_undone,
            "recovery complete"
        );
        Ok(())
    }

    /// Flushes dirty pages, the freelist, and the header, then closes
    /// every database, the log, the cache, and the device (spec §4.10).
    pub fn close(mut self) -> Result<()> {
        let page_size = self.config.page_size;
        self.freelist.shutdown(|offset, bytes| self.device.write(offset, bytes))?;

        // A B-tree split replaces `Database::btree.root` in memory only;
        // the header's index-data slot has to catch up before it's
        // persisted, or a reopened database would resume from a stale root.
        for entry in self.header.index.iter_mut() {
            if let Some(db) = self.databases.get(&entry.name) {
                entry.root_rid = db.btree.root;
            }
        }
        self.device.write(0, &self.header.encode())?;

        for (_, db) in self.databases.drain() {
            debug!(inserts = db.stats.inserts, finds = db.stats.finds, erases = db.stats.erases, "closing database");
        }

        let cleared_log = !self.config.flags.contains(DbFlags::DONT_CLEAR_LOG);
        if let Some(_log) = self.log.take() {
            info!(cleared_log, "closing write-ahead log");
        }
        self.device.close()?;
        info!(page_size, "environment closed");
        Ok(())
    }

    /// Pre-allocates up to `n` pages without thrashing the freelist: once
    /// the freelist's bitmap spans the target range, each page is either
    /// allocated-and-freed (returning it to the pool as a tracked free
    /// run) or allocated-and-left-in-the-freelist one at a time.
    pub fn reserve_space(&mut self, n: u32) -> Result<()> {
        let page_size = self.config.page_size as u64;
        for _ in 0..n {
            let rid = self.freelist.alloc_page(self.config.page_size, Dam::SequentialInsert)?;
            self.freelist.mark_free(rid, page_size, true)?;
        }
        let end = self.freelist.high_water();
        ensure_covers(self.device.as_mut(), end)?;
        Ok(())
    }

    pub fn begin_txn(&mut self) -> Result<u64> {
        if self.active_txn.is_some() {
            return Err(Error::new(ErrorCode::LimitsReached));
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        let log = self.log.as_mut().ok_or_else(|| Error::new(ErrorCode::NotInitialized))?;
        let txn = Txn::begin(log, id)?;
        self.active_txn = Some(txn);
        Ok(id)
    }

    pub fn commit_txn(&mut self) -> Result<()> {
        let mut txn = self.active_txn.take().ok_or_else(|| Error::new(ErrorCode::NotInitialized))?;
        let log = self.log.as_mut().ok_or_else(|| Error::new(ErrorCode::NotInitialized))?;
        let result = txn.commit(log);
        if result.is_err() {
            self.active_txn = Some(txn);
        }
        result
    }

    pub fn abort_txn(&mut self) -> Result<()> {
        let mut txn = self.active_txn.take().ok_or_else(|| Error::new(ErrorCode::NotInitialized))?;
        let log = self.log.as_mut().ok_or_else(|| Error::new(ErrorCode::NotInitialized))?;
        let result = txn.abort(log);
        if result.is_err() {
            self.active_txn = Some(txn);
        }
        result
    }

    /// Allocates a root page, validates `db_config`, and registers a new
    /// header index-data slot.
    pub fn create_database(&mut self, db_config: DbConfig) -> Result<u16> {
        if self.databases.contains_key(&db_config.name) {
            return Err(Error::new(ErrorCode::DatabaseAlreadyExists));
        }
        db_config.validate(self.config.page_size)?;
        let max_keys = btree_node::max_keys(
            db_config.key_size,
            self.config.page_size,
            crate::btree::codec::NODE_HEADER_SIZE as u32,
        )?;

        let root_rid = {
            let mut storage = PagedStorage {
                device: self.device.as_mut(),
                freelist: &mut self.freelist,
                page_size: self.config.page_size,
                log: None,
                txn_id: 0,
            };
            let rid = storage.alloc_node()?;
            storage.write_node(rid, &crate::btree::BtreeNode::new_leaf())?;
            rid
        };

        self.header.index.push(DbIndexEntry {
            name: db_config.name,
            flags: db_config.flags,
            key_size: db_config.key_size,
            max_keys,
            root_rid,
            recno: 0,
        });

        let btree = Btree::new(root_rid, max_keys, Box::new(|a: &[u8], b: &[u8]| a.cmp(b)));
        let name = db_config.name;
        self.databases.insert(name, Database::new(db_config, btree));
        debug!(name, "database created");
        Ok(name)
    }

    /// Reopens an existing database from its header index-data slot.
    pub fn open_database(&mut self, name: u16) -> Result<()> {
        if self.databases.contains_key(&name) {
            return Err(Error::new(ErrorCode::DatabaseAlreadyOpen));
        }
        let entry = self
            .header
            .index
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        let db_config = DbConfig {
            name: entry.name,
            key_size: entry.key_size,
            flags: entry.flags,
        };
        let btree = Btree::new(entry.root_rid, entry.max_keys, Box::new(|a: &[u8], b: &[u8]| a.cmp(b)));
        self.databases.insert(name, Database::new(db_config, btree));
        Ok(())
    }

    pub fn database_mut(&mut self, name: u16) -> Result<&mut Database> {
        self.databases.get_mut(&name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))
    }

    pub fn insert(&mut self, db_name: u16, key: &[u8], payload: &[u8], flags: CallFlags) -> Result<()> {
        if self.config.flags.contains(DbFlags::READ_ONLY) {
            warn!("insert rejected: environment is read-only");
            return Err(Error::new(ErrorCode::DbReadOnly));
        }
        let txn_id = self.active_txn.as_ref().map(|t| t.id).unwrap_or(0);
        let mut storage = PagedStorage {
            device: self.device.as_mut(),
            freelist: &mut self.freelist,
            page_size: self.config.page_size,
            log: self.log.as_mut(),
            txn_id,
        };
        let db = self.databases.get_mut(&db_name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        let mut observer = crate::btree::NullObserver;
        db.insert(&mut storage, &mut observer, txn_id, key, payload, flags)
    }

    pub fn find(&mut self, db_name: u16, key: &[u8], flags: CallFlags) -> Result<Vec<u8>> {
        let txn_id = self.active_txn.as_ref().map(|t| t.id).unwrap_or(0);
        let mut storage = PagedStorage {
            device: self.device.as_mut(),
            freelist: &mut self.freelist,
            page_size: self.config.page_size,
            log: None,
            txn_id: 0,
        };
        let db = self.databases.get_mut(&db_name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        db.find(&mut storage, txn_id, key, flags)
    }

    pub fn erase(&mut self, db_name: u16, key: &[u8]) -> Result<()> {
        if self.config.flags.contains(DbFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::DbReadOnly));
        }
        let txn_id = self.active_txn.as_ref().map(|t| t.id).unwrap_or(0);
        let mut storage = PagedStorage {
            device: self.device.as_mut(),
            freelist: &mut self.freelist,
            page_size: self.config.page_size,
            log: self.log.as_mut(),
            txn_id,
        };
        let db = self.databases.get_mut(&db_name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        let mut observer = crate::btree::NullObserver;
        db.erase(&mut storage, &mut observer, key)
    }

    pub fn insert_duplicate(&mut self, db_name: u16, key: &[u8], payload: &[u8]) -> Result<()> {
        if self.config.flags.contains(DbFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::DbReadOnly));
        }
        let txn_id = self.active_txn.as_ref().map(|t| t.id).unwrap_or(0);
        let mut storage = PagedStorage {
            device: self.device.as_mut(),
            freelist: &mut self.freelist,
            page_size: self.config.page_size,
            log: self.log.as_mut(),
            txn_id,
        };
        let db = self.databases.get_mut(&db_name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        let mut observer = crate::btree::NullObserver;
        if db.config.flags.contains(DbFlags::SORT_DUPLICATES) {
            db.insert_duplicate_sorted(&mut storage, &mut observer, key, payload)
        } else {
            db.insert_duplicate(&mut storage, &mut observer, key, payload, crate::blob::DupPosition::Last)
        }
    }

    pub fn list_duplicates(&mut self, db_name: u16, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut storage = PagedStorage {
            device: self.device.as_mut(),
            freelist: &mut self.freelist,
            page_size: self.config.page_size,
            log: None,
            txn_id: 0,
        };
        let db = self.databases.get_mut(&db_name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        db.list_duplicates(&mut storage, key)
    }

    pub fn overwrite_partial(
        &mut self,
        db_name: u16,
        key: &[u8],
        partial_offset: u64,
        partial_data: &[u8],
        full_new_size: u64,
    ) -> Result<()> {
        if self.config.flags.contains(DbFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::DbReadOnly));
        }
        let txn_id = self.active_txn.as_ref().map(|t| t.id).unwrap_or(0);
        let mut storage = PagedStorage {
            device: self.device.as_mut(),
            freelist: &mut self.freelist,
            page_size: self.config.page_size,
            log: self.log.as_mut(),
            txn_id,
        };
        let db = self.databases.get_mut(&db_name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        let mut observer = crate::btree::NullObserver;
        db.overwrite_partial(&mut storage, &mut observer, key, partial_offset, partial_data, full_new_size)
    }

    /// Validates the named database's B-tree (leaf key ordering) and
    /// reports its leaf count.
    pub fn check_integrity(&mut self, db_name: u16) -> Result<crate::btree::BtreeIntegrity> {
        let mut storage = PagedStorage {
            device: self.device.as_mut(),
            freelist: &mut self.freelist,
            page_size: self.config.page_size,
            log: None,
            txn_id: 0,
        };
        let db = self.databases.get(&db_name).ok_or_else(|| Error::new(ErrorCode::DatabaseNotFound))?;
        db.btree.check_integrity(&mut storage)
    }

    pub fn new_cursor(&mut self) -> Result<Cursor> {
        let txn = self.active_txn.as_mut().ok_or_else(|| Error::new(ErrorCode::NotInitialized))?;
        Ok(Cursor::new(txn))
    }

    pub fn close_cursor(&mut self, cursor: Cursor) -> Result<()> {
        let txn = self.active_txn.as_mut().ok_or_else(|| Error::new(ErrorCode::NotInitialized))?;
        cursor.close(txn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env_config() -> EnvConfig {
        EnvConfig::builder()
            .flags(DbFlags::IN_MEMORY_DB)
            .build()
            .unwrap()
    }

    #[test]
    fn create_open_database_round_trips_insert_and_find() {
        let mut env = Environment::create("mem", env_config()).unwrap();
        let db_name = env
            .create_database(DbConfig { name: 1, key_size: 8, flags: DbFlags::empty() })
            .unwrap();
        env.insert(db_name, b"hello", b"world", CallFlags::empty()).unwrap();
        let got = env.find(db_name, b"hello", CallFlags::empty()).unwrap();
        assert_eq!(got, b"world");
    }

    #[test]
    fn erase_then_find_reports_not_found() {
        let mut env = Environment::create("mem", env_config()).unwrap();
        let db_name = env
            .create_database(DbConfig { name: 1, key_size: 8, flags: DbFlags::empty() })
            .unwrap();
        env.insert(db_name, b"k", b"v", CallFlags::empty()).unwrap();
        env.erase(db_name, b"k").unwrap();
        assert!(env.find(db_name, b"k", CallFlags::empty()).is_err());
    }

    #[test]
    fn read_only_environment_rejects_insert() {
        let config = EnvConfig::builder()
            .flags(DbFlags::IN_MEMORY_DB | DbFlags::READ_ONLY)
            .build()
            .unwrap();
        let mut env = Environment::create("mem", config).unwrap();
        let db_name = env
            .create_database(DbConfig { name: 1, key_size: 8, flags: DbFlags::empty() })
            .unwrap();
        assert_eq!(
            env.insert(db_name, b"k", b"v", CallFlags::empty()).unwrap_err().code(),
            ErrorCode::DbReadOnly
        );
    }

    #[test]
    fn on_disk_environment_persists_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let path_str = path.to_str().unwrap();
        let config = EnvConfig::builder().flags(DbFlags::ENABLE_RECOVERY).build().unwrap();
        let env = Environment::create(path_str, config.clone()).unwrap();
        env.close().unwrap();

        let reopened = Environment::open(path_str, config).unwrap();
        assert_eq!(reopened.header.magic, HEADER_MAGIC);
    }
}
