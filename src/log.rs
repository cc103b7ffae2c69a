//! Write-ahead log: two rotated segment files with physical page-image
//! redo/undo (spec §4.5).
//!
//! Grounded in the teacher's `storage::wal::Wal` for the shape of the thing:
//! a versioned magic header, a running two-accumulator checksum folded over
//! each record, and a recovery loop that scans forward until it hits a
//! record that doesn't check out. The framing itself is hamsterdb's, not
//! SQLite's: fixed-size segments rotate in pairs (`.log0`/`.log1`) instead
//! of a single append-only file, and each record carries its own
//! (lsn, txn_id, type, flags, offset, payload) instead of a bare page frame.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::types::Rid;

pub const LOG_MAGIC: u32 = 0x484c_4f47; // b"HLOG" read as LE u32
pub const LOG_VERSION: u32 = 1;
pub const SEGMENT_HEADER_SIZE: usize = 16;
pub const RECORD_HEADER_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    TxnBegin = 1,
    TxnCommit = 2,
    TxnAbort = 3,
    Checkpoint = 4,
    /// Before-image of a page about to be modified.
    Prewrite = 5,
    /// After-image of a page modification.
    Write = 6,
    FlushPage = 7,
}

impl RecordType {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => RecordType::TxnBegin,
            2 => RecordType::TxnCommit,
            3 => RecordType::TxnAbort,
            4 => RecordType::Checkpoint,
            5 => RecordType::Prewrite,
            6 => RecordType::Write,
            7 => RecordType::FlushPage,
            _ => return Err(Error::new(ErrorCode::LogInvFileHeader)),
        })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        const NONE = 0;
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub lsn: u64,
    pub txn_id: u64,
    pub rtype: RecordType,
    pub flags: RecordFlags,
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl Record {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_HEADER_SIZE + self.payload.len()];
        buf[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        buf[8..16].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[16] = self.rtype as u8;
        buf[17] = self.flags.bits();
        // buf[18..20] reserved, left zero
        buf[20..28].copy_from_slice(&self.offset.to_le_bytes());
        buf[28..32].copy_from_slice(&(self.payload.len() as u32).to_le_bytes());
        let checksum = record_checksum(&buf[0..32], &self.payload);
        buf[32..36].copy_from_slice(&checksum.to_le_bytes());
        // buf[36..40] reserved, left zero
        buf[RECORD_HEADER_SIZE..].copy_from_slice(&self.payload);
        pad_to_8(&mut buf);
        buf
    }

    fn decode_header(buf: &[u8]) -> Result<(u64, u64, RecordType, RecordFlags, u64, u32, u32)> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(Error::new(ErrorCode::LogInvFileHeader));
        }
        let lsn = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let txn_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let rtype = RecordType::from_u8(buf[16])?;
        let flags = RecordFlags::from_bits_truncate(buf[17]);
        let offset = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let data_size = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        let checksum = u32::from_le_bytes(buf[32..36].try_into().unwrap());
        Ok((lsn, txn_id, rtype, flags, offset, data_size, checksum))
    }
}

fn padded_len(n: usize) -> usize {
    (n + 7) & !7
}

fn pad_to_8(buf: &mut Vec<u8>) {
    let target = padded_len(buf.len());
    buf.resize(target, 0);
}

/// Two-accumulator running checksum, the same shape as the teacher's WAL
/// checksum but folded into a single word since records aren't read back
/// by a second, independently-endianed process.
fn record_checksum(header_without_checksum: &[u8], payload: &[u8]) -> u32 {
    let mut s1: u32 = 0;
    let mut s2: u32 = 0;
    let mut fold = |data: &[u8]| {
        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            let w = u32::from_le_bytes(chunk.try_into().unwrap());
            s1 = s1.wrapping_add(w).wrapping_add(s2);
            s2 = s2.wrapping_add(w).wrapping_add(s1);
        }
        let rem = chunks.remainder();
        if !rem.is_empty() {
            let mut tail = [0u8; 4];
            tail[..rem.len()].copy_from_slice(rem);
            let w = u32::from_le_bytes(tail);
            s1 = s1.wrapping_add(w).wrapping_add(s2);
            s2 = s2.wrapping_add(w).wrapping_add(s1);
        }
    };
    fold(header_without_checksum);
    fold(payload);
    s1 ^ s2
}

struct Segment {
    path: PathBuf,
    file: File,
    generation: u32,
    len: u64,
}

impl Segment {
    fn create(path: &Path, generation: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut hdr = vec![0u8; SEGMENT_HEADER_SIZE];
        hdr[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        hdr[4..8].copy_from_slice(&LOG_VERSION.to_le_bytes());
        hdr[8..12].copy_from_slice(&generation.to_le_bytes());
        file.write_all(&hdr)?;
        Ok(Segment {
            path: path.to_path_buf(),
            file,
            generation,
            len: SEGMENT_HEADER_SIZE as u64,
        })
    }

    fn open(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut hdr = [0u8; SEGMENT_HEADER_SIZE];
        if file.read(&mut hdr)? < SEGMENT_HEADER_SIZE {
            return Ok(None);
        }
        let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        if magic != LOG_MAGIC {
            return Err(Error::new(ErrorCode::LogInvFileHeader));
        }
        let generation = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
        let len = file.metadata()?.len();
        Ok(Some(Segment {
            path: path.to_path_buf(),
            file,
            generation,
            len,
        }))
    }

    /// Scans every well-formed record, stopping silently at the first
    /// truncated or checksum-mismatched record (an in-progress append
    /// torn by a crash, not a corruption to report).
    fn scan(&mut self) -> Result<Vec<Record>> {
        self.file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE as u64))?;
        let mut out = Vec::new();
        let mut hdr_buf = [0u8; RECORD_HEADER_SIZE];
        loop {
            let n = self.file.read(&mut hdr_buf)?;
            if n < RECORD_HEADER_SIZE {
                break;
            }
            let (lsn, txn_id, rtype, flags, offset, data_size, checksum) =
                match Record::decode_header(&hdr_buf) {
                    Ok(v) => v,
                    Err(_) => break,
                };
            let mut payload = vec![0u8; data_size as usize];
            if self.file.read_exact(&mut payload).is_err() {
                break;
            }
            let expect = record_checksum(&hdr_buf[0..32], &payload);
            if expect != checksum {
                warn!(lsn, "log record checksum mismatch, stopping scan");
                break;
            }
            let padded = padded_len(RECORD_HEADER_SIZE + payload.len());
            let skip = padded - RECORD_HEADER_SIZE - payload.len();
            if skip > 0 {
                self.file.seek(SeekFrom::Current(skip as i64))?;
            }
            out.push(Record {
                lsn,
                txn_id,
                rtype,
                flags,
                offset,
                payload,
            });
        }
        Ok(out)
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        let bytes = record.encode();
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(&bytes)?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Truncates the segment back to a bare header, keeping its
    /// generation. Used after recovery has applied every record a
    /// segment holds, so the next append doesn't share space with
    /// records already replayed.
    fn truncate_to_header(&mut self) -> Result<()> {
        self.file.set_len(SEGMENT_HEADER_SIZE as u64)?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut hdr = vec![0u8; SEGMENT_HEADER_SIZE];
        hdr[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        hdr[4..8].copy_from_slice(&LOG_VERSION.to_le_bytes());
        hdr[8..12].copy_from_slice(&self.generation.to_le_bytes());
        self.file.write_all(&hdr)?;
        self.file.sync_all()?;
        self.len = SEGMENT_HEADER_SIZE as u64;
        Ok(())
    }
}

/// Outcome of a recovery pass, for callers that want to report it.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub pages_redone: usize,
    pub pages_undone: usize,
}

pub struct Log {
    dir: PathBuf,
    size_limit: u64,
    active: usize,
    segments: [Option<Segment>; 2],
    next_lsn: u64,
}

impl Log {
    fn segment_path(dir: &Path, idx: usize) -> PathBuf {
        dir.join(format!("log{idx}.log"))
    }

    /// Creates a fresh log (both segments start empty, segment 0 active).
    pub fn create(dir: impl AsRef<Path>, size_limit: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let seg0 = Segment::create(&Self::segment_path(&dir, 0), 0)?;
        debug!(dir = %dir.display(), "created log segment 0");
        Ok(Log {
            dir,
            size_limit,
            active: 0,
            segments: [Some(seg0), None],
            next_lsn: 1,
        })
    }

    /// Opens an existing log, if any segment files are present.
    pub fn open(dir: impl AsRef<Path>, size_limit: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let seg0 = Segment::open(&Self::segment_path(&dir, 0))?;
        let seg1 = Segment::open(&Self::segment_path(&dir, 1))?;
        let active = match (&seg0, &seg1) {
            (Some(a), Some(b)) if b.generation > a.generation => 1,
            _ => 0,
        };
        Ok(Log {
            dir,
            size_limit,
            active,
            segments: [seg0, seg1],
            next_lsn: 1,
        })
    }

    fn active_segment(&mut self) -> Result<&mut Segment> {
        self.segments[self.active]
            .as_mut()
            .ok_or_else(|| Error::new(ErrorCode::NotInitialized))
    }

    fn rotate(&mut self) -> Result<()> {
        let next = 1 - self.active;
        let generation = self
            .segments
            .iter()
            .flatten()
            .map(|s| s.generation)
            .max()
            .unwrap_or(0)
            + 1;
        let seg = Segment::create(&Self::segment_path(&self.dir, next), generation)?;
        self.segments[next] = Some(seg);
        self.active = next;
        debug!(next, generation, "rotated log segment");
        Ok(())
    }

    fn append_record(
        &mut self,
        txn_id: u64,
        rtype: RecordType,
        rid: Rid,
        payload: &[u8],
    ) -> Result<u64> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        let record = Record {
            lsn,
            txn_id,
            rtype,
            flags: RecordFlags::empty(),
            offset: rid.0,
            payload: payload.to_vec(),
        };
        let encoded_len = RECORD_HEADER_SIZE as u64 + padded_len(payload.len()) as u64;
        {
            let seg = self.active_segment()?;
            if seg.len + encoded_len > self.size_limit && seg.len > SEGMENT_HEADER_SIZE as u64 {
                self.rotate()?;
            }
        }
        let seg = self.active_segment()?;
        seg.append(&record)?;
        trace!(lsn, txn_id, ?rtype, "appended log record");
        Ok(lsn)
    }

    pub fn begin_txn(&mut self, txn_id: u64) -> Result<u64> {
        self.append_record(txn_id, RecordType::TxnBegin, Rid::NONE, &[])
    }

    pub fn commit_txn(&mut self, txn_id: u64) -> Result<u64> {
        let lsn = self.append_record(txn_id, RecordType::TxnCommit, Rid::NONE, &[])?;
        self.active_segment()?.sync()?;
        Ok(lsn)
    }

    pub fn abort_txn(&mut self, txn_id: u64) -> Result<u64> {
        self.append_record(txn_id, RecordType::TxnAbort, Rid::NONE, &[])
    }

    pub fn checkpoint(&mut self) -> Result<u64> {
        let lsn = self.append_record(0, RecordType::Checkpoint, Rid::NONE, &[])?;
        self.active_segment()?.sync()?;
        Ok(lsn)
    }

    /// Logs a page's before-image. Must precede the in-memory mutation
    /// that produces it (spec §4.4/§4.5: freelist and page mutations are
    /// always preceded by a before-image append).
    pub fn prewrite(&mut self, txn_id: u64, rid: Rid, before_image: &[u8]) -> Result<u64> {
        self.append_record(txn_id, RecordType::Prewrite, rid, before_image)
    }

    /// Logs a page's after-image.
    pub fn write(&mut self, txn_id: u64, rid: Rid, after_image: &[u8]) -> Result<u64> {
        self.append_record(txn_id, RecordType::Write, rid, after_image)
    }

    /// Records that a page was durably flushed to the device. Per the
    /// design decision in DESIGN.md, a `FlushPage` record is never
    /// written ahead of the `TxnCommit` record for the same transaction.
    pub fn flush_page(&mut self, txn_id: u64, rid: Rid) -> Result<u64> {
        self.append_record(txn_id, RecordType::FlushPage, rid, &[])
    }

    /// Replays both segments in generation order, applying `redo` for
    /// every `Write`/`FlushPage` record belonging to a committed
    /// transaction and `undo` for every `Prewrite` record belonging to a
    /// transaction that never committed, then truncates both segments
    /// back to empty headers and resets the LSN counter to 1 (spec §4.5
    /// recovery algorithm, step 5): once applied, a replayed record must
    /// never be replayed again, and the next append must not reuse an
    /// LSN already present in either segment.
    pub fn recover(
        &mut self,
        mut redo: impl FnMut(Rid, &[u8]) -> Result<()>,
        mut undo: impl FnMut(Rid, &[u8]) -> Result<()>,
    ) -> Result<RecoveryStats> {
        let mut ordered: Vec<usize> = (0..2).filter(|i| self.segments[*i].is_some()).collect();
        ordered.sort_by_key(|i| self.segments[*i].as_ref().unwrap().generation);

        let mut records = Vec::new();
        for idx in ordered {
            let seg = self.segments[idx].as_mut().unwrap();
            records.extend(seg.scan()?);
        }
        records.sort_by_key(|r| r.lsn);

        let mut committed: HashSet<u64> = HashSet::new();
        let mut aborted: HashSet<u64> = HashSet::new();
        for r in &records {
            match r.rtype {
                RecordType::TxnCommit => {
                    committed.insert(r.txn_id);
                }
                RecordType::TxnAbort => {
                    aborted.insert(r.txn_id);
                }
                _ => {}
            }
        }

        let mut stats = RecoveryStats {
            records_scanned: records.len(),
            ..Default::default()
        };

        for r in &records {
            match r.rtype {
                RecordType::Write | RecordType::FlushPage if committed.contains(&r.txn_id) => {
                    if !r.payload.is_empty() {
                        redo(Rid::from(r.offset), &r.payload)?;
                        stats.pages_redone += 1;
                    }
                }
                RecordType::Prewrite if !committed.contains(&r.txn_id) => {
                    undo(Rid::from(r.offset), &r.payload)?;
                    stats.pages_undone += 1;
                }
                _ => {}
            }
        }

        for seg in self.segments.iter_mut().flatten() {
            seg.truncate_to_header()?;
        }
        self.active = 0;
        self.next_lsn = 1;

        debug!(
            scanned = stats.records_scanned,
            redone = stats.pages_redone,
            undone = stats.pages_undone,
            "log recovery complete"
        );
        Ok(stats)
    }

    /// Re-derives committed/uncommitted sets without applying any page
    /// mutation; useful for diagnostics and the end-to-end test suite.
    pub fn committed_transactions(&mut self) -> Result<HashMap<u64, bool>> {
        let mut ordered: Vec<usize> = (0..2).filter(|i| self.segments[*i].is_some()).collect();
        ordered.sort_by_key(|i| self.segments[*i].as_ref().unwrap().generation);
        let mut outcomes = HashMap::new();
        for idx in ordered {
            let seg = self.segments[idx].as_mut().unwrap();
            for r in seg.scan()? {
                match r.rtype {
                    RecordType::TxnCommit => {
                        outcomes.insert(r.txn_id, true);
                    }
                    RecordType::TxnAbort => {
                        outcomes.insert(r.txn_id, false);
                    }
                    _ => {}
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_txn_is_redone_and_aborted_is_undone() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::create(dir.path(), 1 << 20).unwrap();

        log.begin_txn(1).unwrap();
        log.prewrite(1, Rid::from(128), b"before-a").unwrap();
        log.write(1, Rid::from(128), b"after-a!").unwrap();
        log.commit_txn(1).unwrap();

        log.begin_txn(2).unwrap();
        log.prewrite(2, Rid::from(256), b"before-b").unwrap();
        log.write(2, Rid::from(256), b"after-b!").unwrap();
        log.abort_txn(2).unwrap();

        let mut redone = Vec::new();
        let mut undone = Vec::new();
        let stats = log
            .recover(
                |rid, data| {
                    redone.push((rid, data.to_vec()));
                    Ok(())
                },
                |rid, data| {
                    undone.push((rid, data.to_vec()));
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(stats.pages_redone, 1);
        assert_eq!(stats.pages_undone, 1);
        assert_eq!(redone[0], (Rid::from(128), b"after-a!".to_vec()));
        assert_eq!(undone[0], (Rid::from(256), b"before-b".to_vec()));
    }

    #[test]
    fn recover_truncates_segments_and_resets_lsn() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::create(dir.path(), 1 << 20).unwrap();
        log.begin_txn(1).unwrap();
        log.prewrite(1, Rid::from(128), b"before-a").unwrap();
        log.write(1, Rid::from(128), b"after-a!").unwrap();
        log.commit_txn(1).unwrap();
        assert!(log.next_lsn > 1);

        log.recover(|_, _| Ok(()), |_, _| Ok(())).unwrap();

        assert_eq!(log.next_lsn, 1);
        assert_eq!(log.active, 0);
        for seg in log.segments.iter().flatten() {
            assert_eq!(seg.len, SEGMENT_HEADER_SIZE as u64);
        }

        let lsn = log.begin_txn(2).unwrap();
        assert_eq!(lsn, 1);
    }

    #[test]
    fn rotation_switches_segment_and_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::create(dir.path(), SEGMENT_HEADER_SIZE as u64 + 80).unwrap();
        log.begin_txn(1).unwrap();
        log.write(1, Rid::from(0), &[1u8; 64]).unwrap();
        assert_eq!(log.active, 0);
        log.write(1, Rid::from(64), &[2u8; 64]).unwrap();
        assert_eq!(log.active, 1);
    }

    #[test]
    fn reopened_log_recovers_committed_transaction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = Log::create(dir.path(), 1 << 20).unwrap();
            log.begin_txn(7).unwrap();
            log.write(7, Rid::from(512), b"hello!!!").unwrap();
            log.commit_txn(7).unwrap();
        }
        let mut log = Log::open(dir.path(), 1 << 20).unwrap();
        let outcomes = log.committed_transactions().unwrap();
        assert_eq!(outcomes.get(&7), Some(&true));
    }
}
