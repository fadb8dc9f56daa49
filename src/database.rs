use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::DatabaseConfig;
use crate::env::{lock, Environment};
use crate::error::{Error, Result};
use crate::journal::{ApplyJournal, JournalFlush};
use crate::transaction::Transaction;
use crate::types::EnvInfo;
use crate::wrapper::{wrap_read_value, wrap_resizable_write, TxnContext};

/// Map size after one growth step.
///
/// `floor(old * factor / page_size) * page_size`, bumped to the next page
/// boundary above `old` when rounding down would not grow at all. Returns
/// `None` if the result does not fit in `usize`.
pub fn next_map_size(old: usize, factor: f64, page_size: usize) -> Option<usize> {
    let scaled = old as f64 * factor;
    if scaled >= usize::MAX as f64 {
        return None;
    }

    let rounded = (scaled as usize / page_size) * page_size;
    if rounded > old {
        Some(rounded)
    } else {
        (old / page_size).checked_add(1)?.checked_mul(page_size)
    }
}

/// A named environment plus the configuration it was opened with.
///
/// The current environment sits behind a single swap point: [`Database::env`]
/// hands out the latest handle, [`Database::reopen`] replaces it. Holders of an
/// older handle keep working; their next transaction simply refreshes the map
/// size view.
pub struct Database {
    path: PathBuf,
    config: Mutex<DatabaseConfig>,
    env: RwLock<Arc<Environment>>,
    flusher: Arc<dyn JournalFlush>,
}

impl Database {
    /// Open (or create) the database stored in directory `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        if !config.read_only {
            fs::create_dir_all(&path)?;
        }

        let mut config = match DatabaseConfig::load(&path)? {
            Some(stored) => config.merge_stored(&stored),
            None => config,
        };

        let env = Environment::open(&path, config.env_config())?;
        // The data file may already be larger than either configuration says
        config.map_size = env.info()?.map_size;
        config.page_size = env.page_size();
        if !config.read_only {
            config.save(&path)?;
        }

        info!(
            "opened database {} at {} (map_size={}, auto_resize={})",
            config.name,
            path.display(),
            config.map_size,
            config.auto_resize
        );

        Ok(Database {
            path,
            config: Mutex::new(config),
            env: RwLock::new(Arc::new(env)),
            flusher: Arc::new(ApplyJournal),
        })
    }

    /// Use `flusher` for scopes that end with a non-empty journal
    pub fn with_flusher(mut self, flusher: Arc<dyn JournalFlush>) -> Self {
        self.flusher = flusher;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        self.lock_config().name.clone()
    }

    pub fn auto_resize(&self) -> bool {
        self.lock_config().auto_resize
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> DatabaseConfig {
        self.lock_config().clone()
    }

    pub fn flusher(&self) -> Arc<dyn JournalFlush> {
        Arc::clone(&self.flusher)
    }

    /// Current environment handle
    pub fn env(&self) -> Arc<Environment> {
        let env = self.env.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&env)
    }

    pub fn info(&self) -> Result<EnvInfo> {
        self.env().info()
    }

    /// Replace the environment handle with one built from the configuration
    pub fn reopen(&self) -> Result<()> {
        let config = self.lock_config();
        self.reopen_with(&config)
    }

    fn reopen_with(&self, config: &DatabaseConfig) -> Result<()> {
        let env = Arc::new(Environment::open(&self.path, config.env_config())?);
        let mut current = self.env.write().unwrap_or_else(PoisonError::into_inner);
        *current = env;
        debug!("reopened database {} (map_size={})", config.name, config.map_size);
        Ok(())
    }

    /// Grow the arena by the configured factor, persist the new size and
    /// reopen. Returns the new map size.
    ///
    /// Concurrent callers are serialized; each one grows from the size left
    /// by the previous one, so the map size only ever increases.
    pub fn grow_map(&self) -> Result<usize> {
        let mut config = self.lock_config();
        if config.read_only {
            return Err(Error::EnvReadOnly);
        }

        let env = self.env();
        let old = env.info()?.map_size;
        let target = next_map_size(old, config.resize_factor, env.page_size())
            .ok_or(Error::EnvInvalidMapSize(old))?;

        env.set_mapsize(target)?;
        let new = env.info()?.map_size;
        config.map_size = new;
        config.save(&self.path)?;
        self.reopen_with(&config)?;

        info!(
            "database {}: map size grown from {} to {} bytes",
            config.name, old, new
        );
        Ok(new)
    }

    /// Run `op` in a write transaction, growing the arena as needed
    pub fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&mut Transaction) -> Result<T>,
    {
        wrap_resizable_write(op).call(self, TxnContext::None)
    }

    /// Run `op` in a read transaction
    pub fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        wrap_read_value(op).call(self, TxnContext::None)
    }

    /// Flush and close the current environment handle
    pub fn close(self) -> Result<()> {
        let env = self.env();
        env.sync()?;
        env.close();
        info!("closed database {}", self.name());
        Ok(())
    }

    fn lock_config(&self) -> MutexGuard<'_, DatabaseConfig> {
        lock(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_floor_of_factor_on_page_boundary() {
        assert_eq!(next_map_size(12 * 4096, 1.2, 4096), Some(14 * 4096));
        assert_eq!(next_map_size(10 * 4096, 1.2, 4096), Some(12 * 4096));
        assert_eq!(next_map_size(100 * 4096, 1.5, 4096), Some(150 * 4096));
    }

    #[test]
    fn growth_bumps_one_page_when_flooring_stalls() {
        // 2 pages * 1.2 = 2.4 pages, which floors back to 2
        assert_eq!(next_map_size(2 * 4096, 1.2, 4096), Some(3 * 4096));
        // Not page aligned to begin with
        assert_eq!(next_map_size(5000, 1.2, 4096), Some(8192));
    }

    #[test]
    fn growth_overflow_is_reported() {
        assert_eq!(next_map_size(usize::MAX - 10, 1.2, 4096), None);
    }
}
