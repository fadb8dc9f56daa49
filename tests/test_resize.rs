use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lumokv::{
    next_map_size, wrap_resizable_write, ApplyJournal, Database, DatabaseConfig, Error, Journal,
    JournalFlush, Transaction, TxnContext, WriteScope, DEFAULT_RESIZE_FACTOR, META_PAGES, PAGE_SIZE,
    RECORD_HEADER,
};
use tempfile::TempDir;

/// Value length that makes one record (header + 6-byte key + value) fill a page
const PAGE_VALUE: usize = PAGE_SIZE - RECORD_HEADER - 6;

fn key(i: usize) -> Vec<u8> {
    format!("key-{:02}", i).into_bytes()
}

/// Database whose arena holds exactly ten page-sized records
fn setup_ten_record_db(dir: &TempDir, auto_resize: bool) -> Database {
    let config = DatabaseConfig::new("resize-test")
        .with_map_size((META_PAGES + 10) * PAGE_SIZE)
        .with_auto_resize(auto_resize)
        .with_no_sync(true);
    Database::open(dir.path(), config).unwrap()
}

fn insert_records(txn: &mut Transaction, count: usize, value: &[u8]) -> lumokv::Result<()> {
    for i in 0..count {
        txn.put(&key(i), value)?;
    }
    Ok(())
}

fn assert_released(db: &Database) {
    let info = db.info().unwrap();
    assert_eq!(info.num_readers, 0);
    assert!(!info.writer_active);
}

#[test]
fn test_ten_records_fit_without_resize() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);
    let initial = db.info().unwrap().map_size;
    let value = vec![1u8; PAGE_VALUE];

    db.write(|txn| insert_records(txn, 10, &value)).unwrap();

    assert_eq!(db.info().unwrap().map_size, initial);
    assert_eq!(db.read(|txn| txn.len()).unwrap(), 10);
}

#[test]
fn test_eleventh_record_triggers_single_resize() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);
    let initial = db.info().unwrap().map_size;
    assert_eq!(initial, 12 * PAGE_SIZE);
    let value = vec![7u8; PAGE_VALUE];

    let mut attempts = 0;
    let mut insert = wrap_resizable_write(|txn: &mut Transaction| {
        attempts += 1;
        insert_records(txn, 11, &value)
    });
    insert.call(&db, TxnContext::None).unwrap();
    drop(insert);

    // One failed attempt, one resize, one successful attempt
    assert_eq!(attempts, 2);
    let info = db.info().unwrap();
    assert_eq!(
        info.map_size,
        next_map_size(initial, DEFAULT_RESIZE_FACTOR, PAGE_SIZE).unwrap()
    );
    assert_eq!(info.map_size, 14 * PAGE_SIZE);
    assert_eq!(info.map_size % PAGE_SIZE, 0);
    assert!(info.map_size >= (META_PAGES + 11) * PAGE_SIZE);

    assert_eq!(db.read(|txn| txn.len()).unwrap(), 11);
    assert_eq!(db.config().map_size, info.map_size);
    assert_released(&db);
}

#[test]
fn test_map_full_without_auto_resize() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, false);
    let initial = db.info().unwrap().map_size;
    let value = vec![7u8; PAGE_VALUE];

    let result = db.write(|txn| insert_records(txn, 11, &value));

    assert!(matches!(result, Err(Error::MapFull)));
    assert_eq!(db.info().unwrap().map_size, initial);
    assert_eq!(db.read(|txn| txn.len()).unwrap(), 0);
    assert_released(&db);
}

#[test]
fn test_retry_is_equivalent_to_single_run() {
    let value = vec![3u8; PAGE_VALUE];
    let op = |txn: &mut Transaction| -> lumokv::Result<()> {
        let count = txn.get(b"counter")?.map_or(0, |v| v[0]);
        txn.put(b"counter", &[count + 1])?;
        insert_records(txn, 11, &value)
    };

    // Retried after a resize
    let small_dir = TempDir::new().unwrap();
    let small = setup_ten_record_db(&small_dir, true);
    small.write(op).unwrap();

    // Fits on the first try
    let large_dir = TempDir::new().unwrap();
    let large = Database::open(
        large_dir.path(),
        DatabaseConfig::new("large").with_map_size(64 * PAGE_SIZE),
    )
    .unwrap();
    large.write(op).unwrap();

    let dump = |db: &Database| {
        db.read(|txn| txn.cursor()?.collect::<lumokv::Result<Vec<_>>>())
            .unwrap()
    };
    let contents = dump(&small);
    assert_eq!(contents, dump(&large));
    assert_eq!(small.read(|txn| Ok(txn.get(b"counter")?.map(<[u8]>::to_vec))).unwrap(), Some(vec![1]));
    assert_eq!(contents.len(), 12);
}

#[test]
fn test_existing_context_propagates_map_full() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);
    let initial = db.info().unwrap().map_size;
    let value = vec![7u8; PAGE_VALUE];

    let env = db.env();
    let mut scope = WriteScope::begin(&env).unwrap();
    let mut attempts = 0;
    let mut overflow = wrap_resizable_write(|txn: &mut Transaction| {
        attempts += 1;
        insert_records(txn, 11, &value)
    });

    let result = overflow.call(&db, TxnContext::Existing(scope.txn().unwrap()));
    assert!(matches!(result, Err(Error::MapFull)));
    // The outer scope decides what happens next; here it gives up
    assert!(matches!(scope.finish(result), Err(Error::MapFull)));
    drop(overflow);

    assert_eq!(attempts, 1);
    assert_eq!(db.info().unwrap().map_size, initial);
    assert_eq!(db.read(|txn| txn.len()).unwrap(), 0);
    assert_released(&db);
}

#[test]
fn test_nested_writes_share_outer_transaction() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);
    let value = vec![5u8; PAGE_VALUE];

    let mut first = wrap_resizable_write(|txn: &mut Transaction| txn.put(b"first", b"1"));
    let mut bulk = wrap_resizable_write(|txn: &mut Transaction| insert_records(txn, 11, &value));

    // The inner calls hit the arena limit; only the outer call may grow it
    db.write(|txn| {
        first.call(&db, TxnContext::Existing(&mut *txn))?;
        bulk.call(&db, TxnContext::from(&mut *txn))
    })
    .unwrap();

    assert_eq!(db.read(|txn| txn.len()).unwrap(), 12);
    assert!(db.info().unwrap().map_size > 12 * PAGE_SIZE);
}

#[test]
fn test_non_resize_errors_are_not_retried() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);
    db.write(|txn| txn.put(b"taken", b"1")).unwrap();

    let mut attempts = 0;
    let result = db.write(|txn| {
        attempts += 1;
        txn.put(b"other", b"2")?;
        txn.put_new(b"taken", b"3")
    });

    assert!(matches!(result, Err(Error::KeyExist)));
    assert_eq!(attempts, 1);
    // The failed attempt left nothing behind
    assert!(!db.read(|txn| txn.contains(b"other")).unwrap());
    assert_released(&db);
}

#[test]
fn test_max_resizes_exhausts() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::new("capped")
        .with_map_size((META_PAGES + 1) * PAGE_SIZE)
        .with_resize_factor(1.01)
        .with_max_resizes(2)
        .with_no_sync(true);
    let db = Database::open(dir.path(), config).unwrap();
    let value = vec![0u8; PAGE_VALUE];

    // Needs ten more data pages; two one-page growths cannot get there
    let result = db.write(|txn| insert_records(txn, 11, &value));

    match result {
        Err(Error::TxnRetryExhausted(inner)) => assert!(inner.is_map_full()),
        other => panic!("expected TxnRetryExhausted, got {:?}", other),
    }
    assert_eq!(db.info().unwrap().map_size, (META_PAGES + 3) * PAGE_SIZE);
    assert_released(&db);
}

#[test]
fn test_growth_is_monotonic_and_page_aligned() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);

    let mut previous = db.info().unwrap().map_size;
    for _ in 0..5 {
        let grown = db.grow_map().unwrap();
        assert!(grown > previous);
        assert_eq!(grown % PAGE_SIZE, 0);
        assert_eq!(db.env().map_size(), grown);
        previous = grown;
    }
}

#[test]
fn test_journal_flushed_on_clean_exit() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);
    let value = vec![9u8; PAGE_VALUE];

    // Records only land in the journal; the flush is what overflows the arena
    db.write(|txn| {
        let journal = txn.journal_mut()?;
        for i in 0..11 {
            journal.put(&key(i), &value);
        }
        journal.delete(&key(10));
        journal.put(b"flushed", b"yes");
        Ok(())
    })
    .unwrap();

    assert_eq!(db.read(|txn| txn.len()).unwrap(), 11);
    assert!(db.read(|txn| txn.contains(b"flushed")).unwrap());
    assert!(!db.read(|txn| txn.contains(&key(10))).unwrap());
    assert_eq!(db.info().unwrap().map_size, 14 * PAGE_SIZE);
}

#[derive(Default)]
struct CountingFlush {
    flushes: AtomicUsize,
    entries: AtomicUsize,
}

impl JournalFlush for CountingFlush {
    fn flush(&self, journal: Journal, txn: Transaction) -> lumokv::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.entries.fetch_add(journal.len(), Ordering::SeqCst);
        ApplyJournal.flush(journal, txn)
    }
}

#[test]
fn test_custom_flusher_only_sees_non_empty_journals() {
    let dir = TempDir::new().unwrap();
    let flusher = Arc::new(CountingFlush::default());
    let db = setup_ten_record_db(&dir, true).with_flusher(flusher.clone());

    db.write(|txn| txn.put(b"direct", b"1")).unwrap();
    assert_eq!(flusher.flushes.load(Ordering::SeqCst), 0);

    db.write(|txn| {
        txn.journal_mut()?.put(b"journaled", b"2");
        Ok(())
    })
    .unwrap();
    assert_eq!(flusher.flushes.load(Ordering::SeqCst), 1);
    assert_eq!(flusher.entries.load(Ordering::SeqCst), 1);

    assert!(db.read(|txn| txn.contains(b"journaled")).unwrap());
    assert_released(&db);
}

#[test]
fn test_scope_aborts_on_error() {
    let dir = TempDir::new().unwrap();
    let db = setup_ten_record_db(&dir, true);
    let env = db.env();

    let scope = WriteScope::begin(&env).unwrap();
    let result: lumokv::Result<()> = scope.run(|txn| {
        txn.put(b"doomed", b"1")?;
        txn.journal_mut()?.put(b"also-doomed", b"2");
        Err(Error::Invalid)
    });

    assert!(matches!(result, Err(Error::Invalid)));
    assert_eq!(db.read(|txn| txn.len()).unwrap(), 0);
    assert_released(&db);
}

#[test]
fn test_grown_size_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let value = vec![4u8; PAGE_VALUE];

    {
        let db = setup_ten_record_db(&dir, true);
        db.write(|txn| insert_records(txn, 11, &value)).unwrap();
        db.close().unwrap();
    }

    let stored = DatabaseConfig::load(dir.path()).unwrap().unwrap();
    assert_eq!(stored.map_size, 14 * PAGE_SIZE);

    // Reopening with the original, smaller configuration keeps the growth
    let db = setup_ten_record_db(&dir, true);
    assert_eq!(db.info().unwrap().map_size, 14 * PAGE_SIZE);
    assert_eq!(db.read(|txn| txn.len()).unwrap(), 11);
    assert_eq!(db.read(|txn| Ok(txn.get(&key(10))?.map(<[u8]>::len))).unwrap(), Some(PAGE_VALUE));
}

#[test]
fn test_read_only_database_cannot_grow() {
    let dir = TempDir::new().unwrap();
    setup_ten_record_db(&dir, true).close().unwrap();

    let db = Database::open(
        dir.path(),
        DatabaseConfig::new("resize-test").with_read_only(true),
    )
    .unwrap();
    assert!(matches!(db.grow_map(), Err(Error::EnvReadOnly)));
    assert!(matches!(db.write(|txn| txn.put(b"k", b"v")), Err(Error::EnvReadOnly)));
}

#[test]
fn test_read_only_database_requires_existing_data() {
    let dir = TempDir::new().unwrap();

    let result = Database::open(
        dir.path(),
        DatabaseConfig::new("resize-test").with_read_only(true),
    );
    assert!(result.is_err());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
