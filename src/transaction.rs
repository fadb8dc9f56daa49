use log::trace;
use std::mem;
use std::sync::Arc;

use crate::constants::TransactionFlags;
use crate::cursor::Cursor;
use crate::env::{ReaderGuard, Shared, WriterGuard};
use crate::error::{Error, Result};
use crate::journal::Journal;
use crate::snapshot::{pages_needed, region_offset, valid_record_sizes, Snapshot};

/// Lock held for the lifetime of a transaction
#[derive(Debug)]
#[allow(dead_code)] // guards are only held for their Drop
enum Slot {
    Reader(ReaderGuard),
    Writer(WriterGuard),
}

/// Database transaction.
///
/// Read transactions see the snapshot committed when they began. Write
/// transactions hold the environment's writer lock and work on a private
/// copy of the committed data, checked against the map size the transaction
/// was opened with. A transaction that is dropped without `commit` is aborted.
#[derive(Debug)]
pub struct Transaction {
    shared: Arc<Shared>,
    /// Transaction flags
    flags: TransactionFlags,
    /// Map size this transaction was opened against
    map_size: usize,
    /// Flush on commit
    sync: bool,
    /// Transaction ID
    txn_id: u64,
    data: Arc<Snapshot>,
    /// Region of the snapshot this transaction started from, which a commit
    /// must not overwrite
    base: (usize, usize),
    journal: Journal,
    slot: Option<Slot>,
}

impl Transaction {
    pub(crate) fn new_read(shared: Arc<Shared>, map_size: usize, reader: ReaderGuard) -> Self {
        let data = shared.committed();
        Transaction {
            txn_id: data.txnid,
            shared,
            flags: TransactionFlags::RDONLY,
            map_size,
            sync: false,
            base: (data.offset, data.used),
            data,
            journal: Journal::new(),
            slot: Some(Slot::Reader(reader)),
        }
    }

    pub(crate) fn new_write(
        shared: Arc<Shared>,
        map_size: usize,
        writer: WriterGuard,
        sync: bool,
    ) -> Self {
        let data = shared.committed();
        Transaction {
            txn_id: shared.last_txnid() + 1,
            shared,
            flags: TransactionFlags::empty(),
            map_size,
            sync,
            base: (data.offset, data.used),
            data,
            journal: Journal::new(),
            slot: Some(Slot::Writer(writer)),
        }
    }

    /// Get transaction ID
    pub fn id(&self) -> u64 {
        self.txn_id
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TransactionFlags::RDONLY)
    }

    /// Map size this transaction was opened against
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>> {
        self.check_usable()?;
        Ok(self.data.entries.get(key).map(Vec::as_slice))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        self.check_usable()?;
        Ok(self.data.entries.contains_key(key))
    }

    /// Number of records visible to this transaction
    pub fn len(&self) -> Result<usize> {
        self.check_usable()?;
        Ok(self.data.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Put a key/value pair, replacing any existing value.
    ///
    /// Fails with [`Error::MapFull`] when the result would not fit in the map
    /// size; the transaction is then unusable and must be aborted.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable()?;
        if !valid_record_sizes(key.len(), value.len()) {
            return Err(Error::BadValSize);
        }

        let used = self.data.used_after_put(key, value);
        let end = region_offset(self.base.0, self.base.1, used) + used;
        if pages_needed(end, self.shared.page_size()) * self.shared.page_size() > self.map_size {
            self.flags.insert(TransactionFlags::ERROR);
            trace!("txn {} hit map size {}", self.txn_id, self.map_size);
            return Err(Error::MapFull);
        }

        Arc::make_mut(&mut self.data).insert(key, value);
        self.flags.insert(TransactionFlags::DIRTY);
        Ok(())
    }

    /// Put a key/value pair, failing with [`Error::KeyExist`] if the key is present
    pub fn put_new(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.contains(key)? {
            return Err(Error::KeyExist);
        }
        self.put(key, value)
    }

    /// Delete a key. Returns whether it was present.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        self.check_writable()?;
        if !self.data.entries.contains_key(key) {
            return Ok(false);
        }
        Arc::make_mut(&mut self.data).remove(key);
        self.flags.insert(TransactionFlags::DIRTY);
        Ok(true)
    }

    /// Cursor over every record, in key order
    pub fn cursor(&self) -> Result<Cursor> {
        self.range(None, None)
    }

    /// Cursor over keys in `[start, end)`; `None` leaves that side open
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<Cursor> {
        self.check_usable()?;
        // Only readers are invalidated by a remap; the writer commits under the I/O lock
        let watch = self.is_readonly().then_some(self.map_size);
        Ok(Cursor::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.data),
            watch,
            start,
            end,
        ))
    }

    /// Pending mutation records to be flushed at scope exit
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> Result<&mut Journal> {
        self.check_writable()?;
        Ok(&mut self.journal)
    }

    pub(crate) fn take_journal(&mut self) -> Journal {
        mem::take(&mut self.journal)
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<()> {
        if self.flags.contains(TransactionFlags::FINISHED) {
            return Err(Error::BadTxn);
        }
        if self.flags.contains(TransactionFlags::ERROR) {
            return Err(Error::BadTxn);
        }

        if !self.is_readonly() && self.flags.contains(TransactionFlags::DIRTY) {
            let data = mem::take(&mut self.data);
            let snapshot = Arc::try_unwrap(data).unwrap_or_else(|shared| (*shared).clone());
            let txn_id = self.shared.commit(snapshot, self.sync)?;
            trace!("committed txn {}", txn_id);
        }

        self.finish();
        Ok(())
    }

    /// Abort the transaction, discarding its changes
    pub fn abort(mut self) -> Result<()> {
        if self.flags.contains(TransactionFlags::FINISHED) {
            return Err(Error::BadTxn);
        }
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        self.flags.insert(TransactionFlags::FINISHED);
        self.journal.clear();
        // Releases the reader slot or the writer lock
        self.slot = None;
    }

    fn check_usable(&self) -> Result<()> {
        if self
            .flags
            .intersects(TransactionFlags::FINISHED | TransactionFlags::ERROR)
        {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_usable()?;
        if self.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.flags.contains(TransactionFlags::FINISHED) {
            trace!("aborting txn {} on drop", self.txn_id);
            self.finish();
        }
    }
}
