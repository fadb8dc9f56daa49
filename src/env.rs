use lazy_static::lazy_static;
use log::{debug, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use crate::constants::{EnvFlags, DATA_FILE, DEFAULT_MAP_SIZE, META_PAGES, MIN_PAGE_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{MetaHeader, META_SIZE};
use crate::snapshot::{region_offset, Snapshot};
use crate::transaction::Transaction;
use crate::types::{EnvInfo, Stat};

lazy_static! {
    /// Environments open in this process, keyed by data file path
    static ref ENVIRONMENTS: Mutex<HashMap<PathBuf, Weak<Shared>>> = Mutex::new(HashMap::new());
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Round `size` up to a multiple of `page_size`
pub(crate) fn round_to_page(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size) * page_size
}

/// Environment configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    /// Requested arena capacity in bytes
    pub map_size: usize,
    /// Page size used for capacity accounting; ignored for existing files
    pub page_size: usize,
    /// Environment flags
    pub flags: EnvFlags,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            map_size: DEFAULT_MAP_SIZE,
            page_size: PAGE_SIZE,
            flags: EnvFlags::empty(),
        }
    }
}

impl EnvConfig {
    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(Error::EnvInvalidConfig(format!(
                "page size {} is not a power of two >= {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if self.map_size == 0 {
            return Err(Error::EnvInvalidMapSize(0));
        }
        Ok(())
    }
}

/// Mapping of the data file. Read-only environments map it without write
/// access.
#[derive(Debug)]
enum Mapping {
    Writable(MmapMut),
    ReadOnly(Mmap),
}

impl Mapping {
    fn new(file: &File, len: usize, read_only: bool) -> Result<Self> {
        let mut options = MmapOptions::new();
        options.len(len);
        let mapping = if read_only {
            Mapping::ReadOnly(unsafe { options.map(file)? })
        } else {
            Mapping::Writable(unsafe { options.map_mut(file)? })
        };
        Ok(mapping)
    }

    fn writable(&mut self) -> Result<&mut MmapMut> {
        match self {
            Mapping::Writable(map) => Ok(map),
            Mapping::ReadOnly(_) => Err(Error::EnvReadOnly),
        }
    }

    fn flush(&self) -> io::Result<()> {
        match self {
            Mapping::Writable(map) => map.flush(),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }
}

impl Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Mapping::Writable(map) => map,
            Mapping::ReadOnly(map) => map,
        }
    }
}

/// Data file plus its mapping. Guarded by `Shared::store`, which doubles as
/// the I/O lock for commits and remaps.
#[derive(Debug)]
struct Store {
    file: File,
    map: Mapping,
    /// Latest meta written to disk
    meta: MetaHeader,
}

impl Store {
    /// Write `meta` to its slot. The other slot keeps the previous meta, so
    /// `meta.txnid` must be one past the current one.
    fn write_meta(&mut self, meta: MetaHeader, page_size: usize, sync: bool) -> Result<()> {
        let offset = MetaHeader::slot(meta.txnid) * page_size;
        let map = self.map.writable()?;
        meta.encode(&mut map[offset..offset + META_SIZE]);
        if sync {
            map.flush_range(offset, META_SIZE)?;
        }
        self.meta = meta;
        Ok(())
    }
}

/// State shared by every handle on the same data file
#[derive(Debug)]
pub(crate) struct Shared {
    data_path: PathBuf,
    page_size: usize,
    read_only: bool,
    store: Mutex<Store>,
    committed: RwLock<Arc<Snapshot>>,
    /// Authoritative map size
    map_size: AtomicUsize,
    writer: Mutex<bool>,
    writer_released: Condvar,
    num_readers: AtomicU32,
}

impl Shared {
    fn open(data_path: &Path, config: &EnvConfig) -> Result<Self> {
        if config.flags.contains(EnvFlags::RDONLY) {
            // Never create, extend or write the file
            let file = File::open(data_path)?;
            let len = file.metadata()?.len() as usize;
            if len == 0 {
                return Err(Error::Invalid);
            }
            return Self::load(data_path, file, len, config);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(data_path)?;
        let len = file.metadata()?.len() as usize;

        if len == 0 {
            Self::create(data_path, file, config)
        } else {
            Self::load(data_path, file, len, config)
        }
    }

    fn create(data_path: &Path, file: File, config: &EnvConfig) -> Result<Self> {
        let page_size = config.page_size;
        let map_size = round_to_page(config.map_size, page_size).max(META_PAGES * page_size);

        file.set_len(map_size as u64)?;
        let mut map = unsafe { MmapOptions::new().len(map_size).map_mut(&file)? };

        // Both slots start out identical so either one is valid
        let meta = MetaHeader::new(page_size, map_size);
        for slot in 0..META_PAGES {
            let offset = slot * page_size;
            meta.encode(&mut map[offset..offset + META_SIZE]);
        }
        map.flush()?;

        debug!(
            "created {} (page_size={}, map_size={})",
            data_path.display(),
            page_size,
            map_size
        );
        let map = Mapping::Writable(map);
        Ok(Self::assemble(data_path, page_size, false, file, map, meta, Snapshot::default()))
    }

    fn load(data_path: &Path, file: File, len: usize, config: &EnvConfig) -> Result<Self> {
        let read_only = config.flags.contains(EnvFlags::RDONLY);
        let mut map = Mapping::new(&file, len, read_only)?;

        let first = MetaHeader::decode(&map[..META_SIZE.min(len)]);
        let slot_size = match &first {
            Ok(meta) => meta.page_size as usize,
            Err(_) => config.page_size,
        };
        let second = match map.get(slot_size..) {
            Some(buf) => MetaHeader::decode(buf),
            None => Err(Error::Invalid),
        };

        // Fall back to the older meta if the newest one points at garbage
        let mut loaded = None;
        for meta in MetaHeader::by_recency(first, second)? {
            match Self::read_snapshot(&map, &meta) {
                Ok(snapshot) => {
                    loaded = Some((meta, snapshot));
                    break;
                }
                Err(err) => warn!(
                    "{}: meta of txn {} is unusable ({}), trying the previous one",
                    data_path.display(),
                    meta.txnid,
                    err
                ),
            }
        }
        let (mut meta, snapshot) = loaded.ok_or(Error::Corrupted)?;

        let page_size = meta.page_size as usize;
        if page_size != config.page_size {
            debug!(
                "{} uses page size {}, ignoring configured {}",
                data_path.display(),
                page_size,
                config.page_size
            );
        }

        // Read-only handles never extend the file
        let map_size = if read_only {
            len
        } else {
            round_to_page((meta.mapsize as usize).max(config.map_size), page_size).max(len)
        };
        if map_size > len {
            file.set_len(map_size as u64)?;
            map = Mapping::new(&file, map_size, false)?;
        }
        meta.mapsize = map_size as u64;

        debug!(
            "loaded {} (txnid={}, entries={}, map_size={})",
            data_path.display(),
            meta.txnid,
            meta.entries,
            map_size
        );
        Ok(Self::assemble(data_path, page_size, read_only, file, map, meta, snapshot))
    }

    fn read_snapshot(map: &[u8], meta: &MetaHeader) -> Result<Snapshot> {
        let page_size = meta.page_size as usize;
        if map.len() < META_PAGES * page_size {
            return Err(Error::Corrupted);
        }

        let start = (META_PAGES * page_size)
            .checked_add(meta.offset as usize)
            .ok_or(Error::Corrupted)?;
        let end = start.checked_add(meta.used as usize).ok_or(Error::Corrupted)?;
        let data = map.get(start..end).ok_or(Error::Corrupted)?;
        Snapshot::decode(data, meta.entries as usize, meta.txnid, meta.offset as usize)
    }

    fn assemble(
        data_path: &Path,
        page_size: usize,
        read_only: bool,
        file: File,
        map: Mapping,
        meta: MetaHeader,
        snapshot: Snapshot,
    ) -> Self {
        Shared {
            data_path: data_path.to_path_buf(),
            page_size,
            read_only,
            map_size: AtomicUsize::new(map.len()),
            store: Mutex::new(Store { file, map, meta }),
            committed: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(false),
            writer_released: Condvar::new(),
            num_readers: AtomicU32::new(0),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn map_size(&self) -> usize {
        self.map_size.load(Ordering::SeqCst)
    }

    /// txnid of the newest meta on disk
    pub(crate) fn last_txnid(&self) -> u64 {
        lock(&self.store).meta.txnid
    }

    pub(crate) fn committed(&self) -> Arc<Snapshot> {
        let snapshot = self.committed.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&snapshot)
    }

    /// Grow the file and the mapping to at least `requested` bytes.
    ///
    /// Never shrinks; returns the resulting map size. The new size is
    /// recorded under a fresh txnid so the current meta stays intact.
    fn grow(&self, requested: usize) -> Result<usize> {
        if self.read_only {
            return Err(Error::EnvReadOnly);
        }

        let mut store = lock(&self.store);
        let current = self.map_size();
        let target = round_to_page(requested, self.page_size);
        if target <= current {
            return Ok(current);
        }

        store.file.set_len(target as u64)?;
        store.map = Mapping::new(&store.file, target, false)?;

        let mut meta = store.meta;
        meta.txnid += 1;
        meta.mapsize = target as u64;
        store.write_meta(meta, self.page_size, true)?;
        self.map_size.store(target, Ordering::SeqCst);

        debug!(
            "remapped {} from {} to {} bytes",
            self.data_path.display(),
            current,
            target
        );
        Ok(target)
    }

    /// Write `snapshot` to the data region and publish it.
    ///
    /// The records go to a region the current meta does not reference, so a
    /// torn meta write leaves the previous state readable. Callers must hold
    /// the writer lock.
    pub(crate) fn commit(&self, mut snapshot: Snapshot, sync: bool) -> Result<u64> {
        let mut store = lock(&self.store);
        let map_size = self.map_size();
        let previous = store.meta;

        snapshot.offset = region_offset(previous.offset as usize, previous.used as usize, snapshot.used);
        if snapshot.pages(self.page_size) * self.page_size > map_size {
            return Err(Error::MapFull);
        }

        let start = META_PAGES * self.page_size + snapshot.offset;
        let map = store.map.writable()?;
        snapshot.encode_into(&mut map[start..start + snapshot.used])?;
        if sync && snapshot.used > 0 {
            map.flush_range(start, snapshot.used)?;
        }

        let mut meta = previous;
        meta.txnid += 1;
        meta.mapsize = map_size as u64;
        meta.used = snapshot.used as u64;
        meta.entries = snapshot.entries.len() as u64;
        meta.offset = snapshot.offset as u64;
        store.write_meta(meta, self.page_size, sync)?;

        snapshot.txnid = meta.txnid;
        let mut committed = self.committed.write().unwrap_or_else(PoisonError::into_inner);
        *committed = Arc::new(snapshot);
        Ok(meta.txnid)
    }

    fn acquire_writer(self: &Arc<Self>) -> WriterGuard {
        let mut active = lock(&self.writer);
        while *active {
            active = self
                .writer_released
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *active = true;
        WriterGuard {
            shared: Arc::clone(self),
        }
    }

    fn register_reader(self: &Arc<Self>) -> ReaderGuard {
        self.num_readers.fetch_add(1, Ordering::SeqCst);
        ReaderGuard {
            shared: Arc::clone(self),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let store = self.store.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = store.map.flush() {
            warn!("failed to flush {}: {}", self.data_path.display(), err);
        }
    }
}

/// Exclusive right to write; released on drop
#[derive(Debug)]
pub(crate) struct WriterGuard {
    shared: Arc<Shared>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        *lock(&self.shared.writer) = false;
        self.shared.writer_released.notify_one();
    }
}

/// Reader slot; released on drop
#[derive(Debug)]
pub(crate) struct ReaderGuard {
    shared: Arc<Shared>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.shared.num_readers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle on a memory-mapped environment.
///
/// Every handle on the same directory shares the committed data, the writer
/// lock and the authoritative map size. Each handle keeps its own view of the
/// map size: once another handle grows the map, transactions begun here fail
/// with [`Error::MapResized`] until [`Environment::set_mapsize`] is called
/// with `0`.
#[derive(Debug)]
pub struct Environment {
    /// Path to the environment directory
    path: PathBuf,
    /// Environment flags
    flags: EnvFlags,
    /// Map size this handle operates against
    map_size: AtomicUsize,
    /// Environment is closed
    closed: AtomicBool,
    shared: Arc<Shared>,
}

impl Environment {
    /// Open (or create) the environment stored in directory `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: EnvConfig) -> Result<Self> {
        config.validate()?;

        let path = path.as_ref().to_path_buf();
        if !config.flags.contains(EnvFlags::RDONLY) {
            fs::create_dir_all(&path)?;
        }
        let data_path = fs::canonicalize(&path)?.join(DATA_FILE);

        let shared = {
            let mut envs = lock(&ENVIRONMENTS);
            envs.retain(|_, shared| shared.strong_count() > 0);

            let read_only = config.flags.contains(EnvFlags::RDONLY);
            match envs.get(&data_path).and_then(Weak::upgrade) {
                // A read-only mapping cannot serve writers; those get their own
                Some(shared) if read_only || !shared.read_only => {
                    if !read_only {
                        shared.grow(config.map_size)?;
                    }
                    shared
                }
                _ => {
                    let shared = Arc::new(Shared::open(&data_path, &config)?);
                    envs.insert(data_path, Arc::downgrade(&shared));
                    shared
                }
            }
        };

        Ok(Environment {
            path,
            flags: config.flags,
            map_size: AtomicUsize::new(shared.map_size()),
            closed: AtomicBool::new(false),
            shared,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn page_size(&self) -> usize {
        self.shared.page_size()
    }

    /// Map size this handle currently operates against
    pub fn map_size(&self) -> usize {
        self.map_size.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Set the map size.
    ///
    /// `0` adopts the size currently recorded for the data file, which is how
    /// a handle recovers from [`Error::MapResized`]. Any other value is rounded
    /// up to a page and grows the file and mapping; the map never shrinks, so a
    /// value below the current size just adopts the current size.
    pub fn set_mapsize(&self, size: usize) -> Result<()> {
        self.check_open()?;

        let effective = if size == 0 {
            self.shared.map_size()
        } else {
            if self.flags.contains(EnvFlags::RDONLY) {
                return Err(Error::EnvReadOnly);
            }
            self.shared.grow(size)?
        };

        let previous = self.map_size.swap(effective, Ordering::SeqCst);
        if previous != effective {
            debug!(
                "{}: map size view {} -> {}",
                self.path.display(),
                previous,
                effective
            );
        }
        Ok(())
    }

    pub fn info(&self) -> Result<EnvInfo> {
        self.check_open()?;
        let committed = self.shared.committed();
        let page_size = self.page_size();

        Ok(EnvInfo {
            map_size: self.shared.map_size(),
            mapped_size: self.map_size(),
            page_size,
            last_pgno: committed.pages(page_size) - 1,
            last_txnid: committed.txnid,
            num_readers: self.shared.num_readers.load(Ordering::SeqCst),
            writer_active: *lock(&self.shared.writer),
        })
    }

    pub fn stat(&self) -> Result<Stat> {
        self.check_open()?;
        let committed = self.shared.committed();
        let page_size = self.page_size();

        Ok(Stat {
            psize: page_size,
            data_pages: committed.used.div_ceil(page_size),
            used_bytes: committed.used,
            entries: committed.entries.len(),
        })
    }

    /// Begin a read (`write == false`) or write transaction
    pub fn begin(&self, write: bool) -> Result<Transaction> {
        if write {
            self.begin_rw_txn()
        } else {
            self.begin_ro_txn()
        }
    }

    /// Begin a read-only transaction over the latest committed snapshot
    pub fn begin_ro_txn(&self) -> Result<Transaction> {
        self.check_open()?;
        let view = self.check_view()?;
        let reader = self.shared.register_reader();
        Ok(Transaction::new_read(Arc::clone(&self.shared), view, reader))
    }

    /// Begin a write transaction, blocking until the writer lock is free
    pub fn begin_rw_txn(&self) -> Result<Transaction> {
        self.check_open()?;
        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }

        let writer = self.shared.acquire_writer();
        // The map may have been grown while we waited for the lock
        let view = self.check_view()?;
        Ok(Transaction::new_write(
            Arc::clone(&self.shared),
            view,
            writer,
            !self.flags.contains(EnvFlags::NOSYNC),
        ))
    }

    /// Flush the mapping to disk
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        let store = lock(&self.shared.store);
        store.map.flush()?;
        Ok(())
    }

    /// Close this handle. Transactions already begun are unaffected.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closed environment {}", self.path.display());
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::EnvClosed);
        }
        Ok(())
    }

    fn check_view(&self) -> Result<usize> {
        let view = self.map_size();
        if view < self.shared.map_size() {
            return Err(Error::MapResized);
        }
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> EnvConfig {
        EnvConfig::default().with_map_size(8 * PAGE_SIZE)
    }

    #[test]
    fn round_to_page_is_exact_for_multiples() {
        assert_eq!(round_to_page(4096, 4096), 4096);
        assert_eq!(round_to_page(4097, 4096), 8192);
        assert_eq!(round_to_page(1, 4096), 4096);
    }

    #[test]
    fn open_rejects_bad_page_size() {
        let dir = TempDir::new().unwrap();
        let result = Environment::open(dir.path(), small_config().with_page_size(1000));
        assert!(matches!(result, Err(Error::EnvInvalidConfig(_))));
    }

    #[test]
    fn second_handle_sees_growth_as_resized() {
        let dir = TempDir::new().unwrap();
        let first = Environment::open(dir.path(), small_config()).unwrap();
        let second = Environment::open(dir.path(), small_config()).unwrap();

        second.set_mapsize(16 * PAGE_SIZE).unwrap();
        assert_eq!(second.map_size(), 16 * PAGE_SIZE);
        assert!(matches!(first.begin_ro_txn(), Err(Error::MapResized)));
        assert!(matches!(first.begin_rw_txn(), Err(Error::MapResized)));

        first.set_mapsize(0).unwrap();
        assert_eq!(first.map_size(), 16 * PAGE_SIZE);
        assert!(first.begin_ro_txn().is_ok());
    }

    #[test]
    fn set_mapsize_never_shrinks() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), small_config()).unwrap();
        env.set_mapsize(PAGE_SIZE).unwrap();
        assert_eq!(env.info().unwrap().map_size, 8 * PAGE_SIZE);
    }

    #[test]
    fn closed_handle_refuses_transactions() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), small_config()).unwrap();
        env.close();
        assert!(matches!(env.begin_ro_txn(), Err(Error::EnvClosed)));
        assert!(matches!(env.set_mapsize(0), Err(Error::EnvClosed)));
    }

    #[test]
    fn read_only_handle_refuses_writes() {
        let dir = TempDir::new().unwrap();
        Environment::open(dir.path(), small_config()).unwrap();
        let env = Environment::open(dir.path(), small_config().with_flags(EnvFlags::RDONLY)).unwrap();
        assert!(matches!(env.begin_rw_txn(), Err(Error::EnvReadOnly)));
        assert!(env.begin_ro_txn().is_ok());
    }
}
