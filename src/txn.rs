//! Transactions: one active per environment, logged at begin/commit/abort
//! (spec §4.11).

use tracing::{debug, warn};

use crate::error::{Error, ErrorCode, Result};
use crate::log::Log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A single transaction. The environment hands out at most one `Txn` at a
/// time (spec §4.11: "Only one transaction is active at a time per
/// environment"); enforcing that is the caller's (`env::Environment`) job.
pub struct Txn {
    pub id: u64,
    state: TxnState,
    cursor_refs: u32,
}

impl Txn {
    /// Begins a new transaction and logs `TXN_BEGIN`.
    pub fn begin(log: &mut Log, id: u64) -> Result<Self> {
        log.begin_txn(id)?;
        debug!(txn_id = id, "transaction begin");
        Ok(Txn {
            id,
            state: TxnState::Active,
            cursor_refs: 0,
        })
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn cursor_count(&self) -> u32 {
        self.cursor_refs
    }

    pub fn attach_cursor(&mut self) {
        self.cursor_refs += 1;
    }

    pub fn detach_cursor(&mut self) {
        self.cursor_refs = self.cursor_refs.saturating_sub(1);
    }

    /// Logs `TXN_COMMIT`. Refuses while cursors remain attached.
    pub fn commit(&mut self, log: &mut Log) -> Result<()> {
        if self.cursor_refs > 0 {
            warn!(txn_id = self.id, cursors = self.cursor_refs, "commit blocked by open cursors");
            return Err(Error::new(ErrorCode::CursorStillOpen));
        }
        log.commit_txn(self.id)?;
        self.state = TxnState::Committed;
        debug!(txn_id = self.id, "transaction commit");
        Ok(())
    }

    /// Logs `TXN_ABORT`. The caller is responsible for discarding the
    /// in-memory changeset and re-fetching affected pages fresh; recovery
    /// rolls the on-disk state back via the `PREWRITE` images already
    /// logged for this transaction.
    pub fn abort(&mut self, log: &mut Log) -> Result<()> {
        if self.cursor_refs > 0 {
            warn!(txn_id = self.id, cursors = self.cursor_refs, "abort blocked by open cursors");
            return Err(Error::new(ErrorCode::CursorStillOpen));
        }
        log.abort_txn(self.id)?;
        self.state = TxnState::Aborted;
        debug!(txn_id = self.id, "transaction abort");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn commit_requires_no_open_cursors() {
        let dir = tempdir().unwrap();
        let mut log = Log::create(dir.path(), 1 << 20).unwrap();
        let mut txn = Txn::begin(&mut log, 1).unwrap();
        txn.attach_cursor();
        assert_eq!(txn.commit(&mut log).unwrap_err().code(), ErrorCode::CursorStillOpen);
        txn.detach_cursor();
        txn.commit(&mut log).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    fn abort_transitions_state() {
        let dir = tempdir().unwrap();
        let mut log = Log::create(dir.path(), 1 << 20).unwrap();
        let mut txn = Txn::begin(&mut log, 7).unwrap();
        txn.abort(&mut log).unwrap();
        assert_eq!(txn.state(), TxnState::Aborted);
    }
}
