//! Retry wrappers around transactional operations.
//!
//! Each wrapper takes an operation and a [`TxnContext`]. With
//! `TxnContext::Existing` the operation runs inside the caller's transaction
//! and every error, recoverable or not, goes straight back to the caller: only
//! the outermost scope may grow the map. With `TxnContext::None` the wrapper
//! owns the transaction and retries the whole operation on the conditions it
//! knows how to recover from:
//!
//! - writes retry on [`Error::MapFull`] after growing the map,
//! - reads retry on [`Error::MapResized`] after refreshing the map size view.
//!
//! A retried operation runs again from scratch, so it must not have side
//! effects outside its transaction.

use log::{debug, warn};
use std::sync::Arc;

use crate::database::Database;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::scope::WriteScope;
use crate::transaction::Transaction;

/// Whether an operation runs in a transaction the caller already holds
#[derive(Debug, Default)]
pub enum TxnContext<'a> {
    /// The wrapper opens (and retries) its own transaction
    #[default]
    None,
    /// Run inside the caller's transaction; no retries
    Existing(&'a mut Transaction),
}

impl<'a> From<&'a mut Transaction> for TxnContext<'a> {
    fn from(txn: &'a mut Transaction) -> Self {
        TxnContext::Existing(txn)
    }
}

/// Wrap a write operation so that arena-full grows the map and retries
pub fn wrap_resizable_write<F, T>(op: F) -> ResizableWrite<F>
where
    F: FnMut(&mut Transaction) -> Result<T>,
{
    ResizableWrite { op }
}

/// Wrap a read operation that returns a single value
pub fn wrap_read_value<F, T>(op: F) -> ReadValue<F>
where
    F: FnMut(&Transaction) -> Result<T>,
{
    ReadValue { op }
}

/// Wrap a read operation that returns a lazy sequence
pub fn wrap_read_sequence<F, I>(op: F) -> ReadSequence<F>
where
    F: FnMut(&Transaction) -> Result<I>,
    I: IntoIterator,
{
    ReadSequence { op }
}

/// Write operation with grow-and-retry on arena-full
pub struct ResizableWrite<F> {
    op: F,
}

impl<F> ResizableWrite<F> {
    pub fn call<T>(&mut self, db: &Database, ctx: TxnContext<'_>) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        if let TxnContext::Existing(txn) = ctx {
            return (self.op)(txn);
        }

        let mut resizes = 0u32;
        loop {
            let env = db.env();
            let outcome = WriteScope::with_flusher(&env, db.flusher())
                .and_then(|scope| scope.run(&mut self.op));

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_map_full() {
                warn!(
                    "database {}: write failed after {} resizes (map_size={}): {}",
                    db.name(),
                    resizes,
                    env.map_size(),
                    err
                );
                return Err(err);
            }

            let config = db.config();
            if !config.auto_resize {
                warn!(
                    "database {}: map full at {} bytes and auto_resize is off",
                    config.name,
                    env.map_size()
                );
                return Err(err);
            }
            if config.max_resizes.is_some_and(|max| resizes >= max) {
                warn!(
                    "database {}: map full at {} bytes after {} resizes, giving up",
                    config.name,
                    env.map_size(),
                    resizes
                );
                return Err(Error::TxnRetryExhausted(Box::new(err)));
            }

            let old = env.map_size();
            match db.grow_map() {
                Ok(new) => {
                    resizes += 1;
                    debug!(
                        "database {}: retrying write after resize {} ({} -> {})",
                        config.name, resizes, old, new
                    );
                }
                Err(grow_err) => {
                    warn!(
                        "database {}: growing map from {} bytes failed after {} resizes: {}",
                        config.name, old, resizes, grow_err
                    );
                    return Err(grow_err);
                }
            }
        }
    }
}

/// Single-value read with restart on resized-by-other
pub struct ReadValue<F> {
    op: F,
}

impl<F> ReadValue<F> {
    pub fn call<T>(&mut self, db: &Database, ctx: TxnContext<'_>) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        if let TxnContext::Existing(txn) = ctx {
            return (self.op)(&*txn);
        }

        loop {
            let env = db.env();
            let outcome = env.begin_ro_txn().and_then(|txn| {
                let value = (self.op)(&txn)?;
                txn.commit()?;
                Ok(value)
            });

            match outcome {
                Err(Error::MapResized) => refresh(&env)?,
                outcome => return outcome,
            }
        }
    }
}

/// Sequence read with restart on resized-by-other
pub struct ReadSequence<F> {
    op: F,
}

impl<F> ReadSequence<F> {
    /// Start the sequence.
    ///
    /// If the map is resized while the sequence is being consumed, the
    /// operation is run again in a fresh transaction and the sequence starts
    /// over from its first element: items already yielded are yielded again.
    pub fn iter<'a, I>(&'a mut self, db: &'a Database, ctx: TxnContext<'_>) -> SequenceIter<'a, F, I>
    where
        F: FnMut(&Transaction) -> Result<I>,
        I: IntoIterator,
    {
        let state = match ctx {
            TxnContext::Existing(txn) => match (self.op)(&*txn) {
                Ok(items) => SeqState::Delegated(items.into_iter()),
                Err(err) => SeqState::Failed(err),
            },
            TxnContext::None => SeqState::Start,
        };

        SequenceIter {
            db,
            op: &mut self.op,
            state,
            restarts: 0,
        }
    }
}

enum SeqState<It> {
    Start,
    Open {
        env: Arc<Environment>,
        txn: Transaction,
        items: It,
    },
    Delegated(It),
    Failed(Error),
    Done,
}

/// Iterator returned by [`ReadSequence::iter`].
///
/// Keeps its read transaction open until the sequence is exhausted, an error
/// is yielded, or the iterator is dropped.
pub struct SequenceIter<'a, F, I: IntoIterator> {
    db: &'a Database,
    op: &'a mut F,
    state: SeqState<I::IntoIter>,
    restarts: u32,
}

impl<'a, F, I> SequenceIter<'a, F, I>
where
    F: FnMut(&Transaction) -> Result<I>,
    I: IntoIterator,
{
    /// Times the sequence was restarted after a resize
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn open(&mut self, env: &Environment) -> Result<(Transaction, I::IntoIter)> {
        let txn = env.begin_ro_txn()?;
        let items = (self.op)(&txn)?.into_iter();
        Ok((txn, items))
    }
}

impl<'a, F, I, T> Iterator for SequenceIter<'a, F, I>
where
    F: FnMut(&Transaction) -> Result<I>,
    I: IntoIterator<Item = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        loop {
            match std::mem::replace(&mut self.state, SeqState::Done) {
                SeqState::Done => return None,
                SeqState::Failed(err) => return Some(Err(err)),
                SeqState::Delegated(mut items) => {
                    let item = items.next();
                    if item.is_some() {
                        self.state = SeqState::Delegated(items);
                    }
                    return item;
                }
                SeqState::Start => {
                    let env = self.db.env();
                    match self.open(&env) {
                        Ok((txn, items)) => self.state = SeqState::Open { env, txn, items },
                        Err(Error::MapResized) => {
                            if let Err(err) = refresh(&env) {
                                return Some(Err(err));
                            }
                            self.state = SeqState::Start;
                        }
                        Err(err) => return Some(Err(err)),
                    }
                }
                SeqState::Open { env, txn, mut items } => match items.next() {
                    Some(Ok(item)) => {
                        self.state = SeqState::Open { env, txn, items };
                        return Some(Ok(item));
                    }
                    Some(Err(Error::MapResized)) => {
                        drop(items);
                        drop(txn);
                        if let Err(err) = refresh(&env) {
                            return Some(Err(err));
                        }
                        self.restarts += 1;
                        debug!("sequence restarted after resize ({} so far)", self.restarts);
                        self.state = SeqState::Start;
                    }
                    Some(Err(err)) => return Some(Err(err)),
                    None => {
                        drop(items);
                        return txn.commit().err().map(Err);
                    }
                },
            }
        }
    }
}

/// Adopt the map size another handle has grown to
fn refresh(env: &Environment) -> Result<()> {
    debug!(
        "{}: map resized by another handle, refreshing",
        env.path().display()
    );
    env.set_mapsize(0)
}
