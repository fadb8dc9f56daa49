//! Embedded memory-mapped key-value store with a transaction retry layer.
//!
//! The environment has a fixed map size. Write operations run through
//! [`wrap_resizable_write`] grow the map and start over when they run out of
//! space; read operations run through [`wrap_read_value`] or
//! [`wrap_read_sequence`] start over when another handle has grown the map
//! underneath them.
//!
//! ```no_run
//! use lumokv::{Database, DatabaseConfig, TxnContext, wrap_resizable_write};
//!
//! # fn main() -> lumokv::Result<()> {
//! let db = Database::open("/tmp/orders", DatabaseConfig::new("orders"))?;
//! let mut insert = wrap_resizable_write(|txn| txn.put(b"order-1", b"pending"));
//! insert.call(&db, TxnContext::None)?;
//!
//! let status = db.read(|txn| Ok(txn.get(b"order-1")?.map(<[u8]>::to_vec)))?;
//! assert_eq!(status.as_deref(), Some(&b"pending"[..]));
//! # Ok(())
//! # }
//! ```
mod config;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod journal;
mod meta;
mod scope;
mod snapshot;
mod transaction;
mod types;
mod wrapper;

pub use config::DatabaseConfig;
pub use constants::{EnvFlags, DEFAULT_MAP_SIZE, DEFAULT_RESIZE_FACTOR, META_PAGES, PAGE_SIZE, RECORD_HEADER};
pub use cursor::Cursor;
pub use database::{next_map_size, Database};
pub use env::{EnvConfig, Environment};
pub use error::{Error, Result};
pub use journal::{ApplyJournal, Journal, JournalEntry, JournalFlush};
pub use scope::{ReadScope, TxnScope, WriteScope};
pub use transaction::Transaction;
pub use types::{EnvInfo, Stat};
pub use wrapper::{
    wrap_read_sequence, wrap_read_value, wrap_resizable_write, ReadSequence, ReadValue,
    ResizableWrite, SequenceIter, TxnContext,
};
