//! Record and file filter chains (spec §6): writes traverse forward,
//! reads traverse reverse. The concrete filter algorithms (AES, Zlib)
//! are out of scope; only the chain contract lives here.

use crate::error::Result;

/// Context passed to a record filter alongside the record bytes.
#[derive(Debug, Clone, Copy)]
pub struct FilterInfo {
    pub txn_id: u64,
    pub cursor_id: Option<u64>,
}

/// Per-database filter applied to record payloads.
pub trait RecordFilter: Send + Sync {
    fn before_write(&self, data: &mut Vec<u8>, info: &FilterInfo) -> Result<()>;
    fn after_read(&self, data: &mut Vec<u8>, info: &FilterInfo) -> Result<()>;
    fn close(&self) {}
}

/// Per-environment filter applied to whole pages before they're written
/// to, or after they're read from, the device.
pub trait FileFilter: Send + Sync {
    fn before_write(&self, page: &mut Vec<u8>) -> Result<()>;
    fn after_read(&self, page: &mut Vec<u8>) -> Result<()>;
    fn init(&self, creating: bool) -> Result<()> {
        let _ = creating;
        Ok(())
    }
    fn close(&self) {}
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Bytes this filter prepends/appends/reserves per page, so the
    /// caller can account for total per-page overhead.
    fn header_size(&self) -> usize {
        0
    }
    fn footer_size(&self) -> usize {
        0
    }
    fn trailing_surplus(&self) -> usize {
        0
    }
    fn leading_surplus(&self) -> usize {
        0
    }
}

/// Runs `data` through `filters` forward (spec §6: "writes traverse
/// forward").
pub fn apply_before_write(filters: &[Box<dyn RecordFilter>], data: &mut Vec<u8>, info: &FilterInfo) -> Result<()> {
    for f in filters {
        f.before_write(data, info)?;
    }
    Ok(())
}

/// Runs `data` through `filters` in reverse (spec §6: "reads traverse
/// reverse").
pub fn apply_after_read(filters: &[Box<dyn RecordFilter>], data: &mut Vec<u8>, info: &FilterInfo) -> Result<()> {
    for f in filters.iter().rev() {
        f.after_read(data, info)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct TagFilter(u8);
    impl RecordFilter for TagFilter {
        fn before_write(&self, data: &mut Vec<u8>, _info: &FilterInfo) -> Result<()> {
            data.push(self.0);
            Ok(())
        }
        fn after_read(&self, data: &mut Vec<u8>, _info: &FilterInfo) -> Result<()> {
            assert_eq!(data.pop(), Some(self.0));
            Ok(())
        }
    }

    #[test]
    fn write_order_forward_read_order_reverse() {
        let filters: Vec<Box<dyn RecordFilter>> = vec![Box::new(TagFilter(1)), Box::new(TagFilter(2))];
        let info = FilterInfo { txn_id: 0, cursor_id: None };
        let mut data = vec![0u8];
        apply_before_write(&filters, &mut data, &info).unwrap();
        assert_eq!(data, vec![0, 1, 2]);
        apply_after_read(&filters, &mut data, &info).unwrap();
        assert_eq!(data, vec![0]);
    }

    #[test]
    fn file_filter_defaults_are_inert() {
        struct Noop;
        impl FileFilter for Noop {
            fn before_write(&self, _page: &mut Vec<u8>) -> Result<()> {
                Ok(())
            }
            fn after_read(&self, _page: &mut Vec<u8>) -> Result<()> {
                Ok(())
            }
        }
        let f = Noop;
        assert_eq!(f.header_size(), 0);
        let counter = AtomicU8::new(0);
        f.init(true).unwrap();
        counter.fetch_add(1, Ordering::Relaxed);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
