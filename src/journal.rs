use std::slice;
use std::vec;

use crate::error::Result;
use crate::transaction::Transaction;

/// A pending mutation recorded in a write transaction's journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered buffer of pending writes, flushed as a unit when the owning scope
/// exits cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Journal::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.entries.push(JournalEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.entries.push(JournalEntry::Delete { key: key.to_vec() });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, JournalEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl IntoIterator for Journal {
    type Item = JournalEntry;
    type IntoIter = vec::IntoIter<JournalEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Journal {
    type Item = &'a JournalEntry;
    type IntoIter = slice::Iter<'a, JournalEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Collaborator that takes over a transaction whose journal is non-empty.
///
/// Implementations own the transaction: they either commit it or return an
/// error, in which case dropping it aborts.
pub trait JournalFlush: Send + Sync {
    fn flush(&self, journal: Journal, txn: Transaction) -> Result<()>;
}

/// Default flush: replay the journal into the transaction, then commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyJournal;

impl JournalFlush for ApplyJournal {
    fn flush(&self, journal: Journal, mut txn: Transaction) -> Result<()> {
        for entry in journal {
            match entry {
                JournalEntry::Put { key, value } => txn.put(&key, &value)?,
                JournalEntry::Delete { key } => {
                    txn.del(&key)?;
                }
            }
        }
        txn.commit()
    }
}
