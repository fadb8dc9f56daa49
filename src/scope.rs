use log::debug;
use std::sync::Arc;

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::journal::{ApplyJournal, JournalFlush};
use crate::transaction::Transaction;

/// Acquire/release wrapper around one transaction.
///
/// `finish` commits on `Ok` (or hands a non-empty journal to the flush
/// collaborator) and aborts on `Err`, returning the original error. A scope
/// dropped without `finish` aborts its transaction.
pub struct TxnScope {
    txn: Option<Transaction>,
    flusher: Arc<dyn JournalFlush>,
}

impl TxnScope {
    /// Open a transaction on `env`.
    ///
    /// If the environment was resized by another handle, adopt the new size
    /// and try again. There is no retry limit: the condition clears as soon as
    /// this handle has refreshed its view.
    pub fn begin(env: &Environment, write: bool) -> Result<Self> {
        let txn = loop {
            match env.begin(write) {
                Ok(txn) => break txn,
                Err(Error::MapResized) => {
                    debug!(
                        "{}: map resized by another handle, refreshing",
                        env.path().display()
                    );
                    env.set_mapsize(0)?;
                }
                Err(err) => return Err(err),
            }
        };

        Ok(TxnScope {
            txn: Some(txn),
            flusher: Arc::new(ApplyJournal),
        })
    }

    /// Use `flusher` for a non-empty journal at clean exit
    pub fn with_flusher(mut self, flusher: Arc<dyn JournalFlush>) -> Self {
        self.flusher = flusher;
        self
    }

    pub fn txn(&mut self) -> Result<&mut Transaction> {
        self.txn.as_mut().ok_or(Error::BadTxn)
    }

    /// Release the transaction according to `outcome`.
    ///
    /// If aborting fails, the abort error replaces `outcome`'s error.
    pub fn finish<T>(mut self, outcome: Result<T>) -> Result<T> {
        let mut txn = self.txn.take().ok_or(Error::BadTxn)?;

        match outcome {
            Ok(value) => {
                if txn.journal().is_empty() {
                    txn.commit()?;
                } else {
                    let journal = txn.take_journal();
                    debug!("flushing journal of {} entries", journal.len());
                    self.flusher.flush(journal, txn)?;
                }
                Ok(value)
            }
            Err(err) => {
                txn.abort()?;
                Err(err)
            }
        }
    }

    /// Run `op` inside the scope and release it.
    pub fn run<T, F>(mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let outcome = match self.txn() {
            Ok(txn) => op(txn),
            Err(err) => Err(err),
        };
        self.finish(outcome)
    }
}

impl Drop for TxnScope {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            debug!("scope dropped without finish, aborting txn {}", txn.id());
            // Abort only fails for finished transactions, which a scope never holds
            let _ = txn.abort();
        }
    }
}

/// Scope specialization with `write = false`
pub struct ReadScope;

impl ReadScope {
    pub fn begin(env: &Environment) -> Result<TxnScope> {
        TxnScope::begin(env, false)
    }
}

/// Scope specialization with `write = true`
pub struct WriteScope;

impl WriteScope {
    pub fn begin(env: &Environment) -> Result<TxnScope> {
        TxnScope::begin(env, true)
    }

    pub fn with_flusher(env: &Environment, flusher: Arc<dyn JournalFlush>) -> Result<TxnScope> {
        Ok(TxnScope::begin(env, true)?.with_flusher(flusher))
    }
}
