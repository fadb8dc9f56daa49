use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::constants::{EnvFlags, CONFIG_FILE, DEFAULT_MAP_SIZE, DEFAULT_RESIZE_FACTOR, PAGE_SIZE};
use crate::env::EnvConfig;
use crate::error::{Error, Result};

/// Database configuration, persisted next to the data file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Name used in diagnostics
    #[serde(default = "default_name")]
    pub name: String,

    /// Arena capacity in bytes
    /// Default: 10 MiB
    #[serde(default = "default_map_size")]
    pub map_size: usize,

    /// Page size for new data files; existing files keep theirs
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Grow the arena and retry when a write runs out of space
    #[serde(default = "default_true")]
    pub auto_resize: bool,

    /// Multiplier applied to the map size on each growth (must be > 1)
    #[serde(default = "default_resize_factor")]
    pub resize_factor: f64,

    /// Cap on growths per write call; `None` retries without limit
    #[serde(default)]
    pub max_resizes: Option<u32>,

    /// Skip flushing on commit
    #[serde(default)]
    pub no_sync: bool,

    /// Refuse write transactions; the configuration file is left untouched
    #[serde(default)]
    pub read_only: bool,
}

fn default_name() -> String {
    "lumokv".to_string()
}

fn default_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

fn default_page_size() -> usize {
    PAGE_SIZE
}

fn default_true() -> bool {
    true
}

fn default_resize_factor() -> f64 {
    DEFAULT_RESIZE_FACTOR
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            name: default_name(),
            map_size: default_map_size(),
            page_size: default_page_size(),
            auto_resize: default_true(),
            resize_factor: default_resize_factor(),
            max_resizes: None,
            no_sync: false,
            read_only: false,
        }
    }
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>) -> Self {
        DatabaseConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_map_size(mut self, map_size: usize) -> Self {
        self.map_size = map_size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_auto_resize(mut self, auto_resize: bool) -> Self {
        self.auto_resize = auto_resize;
        self
    }

    pub fn with_resize_factor(mut self, resize_factor: f64) -> Self {
        self.resize_factor = resize_factor;
        self
    }

    pub fn with_max_resizes(mut self, max_resizes: u32) -> Self {
        self.max_resizes = Some(max_resizes);
        self
    }

    pub fn with_no_sync(mut self, no_sync: bool) -> Self {
        self.no_sync = no_sync;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.resize_factor.is_finite() || self.resize_factor <= 1.0 {
            return Err(Error::EnvInvalidConfig(format!(
                "resize factor {} must be greater than 1",
                self.resize_factor
            )));
        }
        Ok(())
    }

    pub(crate) fn env_config(&self) -> EnvConfig {
        let mut flags = EnvFlags::empty();
        flags.set(EnvFlags::NOSYNC, self.no_sync);
        flags.set(EnvFlags::RDONLY, self.read_only);

        EnvConfig {
            map_size: self.map_size,
            page_size: self.page_size,
            flags,
        }
    }

    /// Merge a previously persisted configuration into this one.
    ///
    /// The stored map size wins when it is larger, so growth survives reopening
    /// with the original settings. The stored page size always wins.
    pub(crate) fn merge_stored(mut self, stored: &DatabaseConfig) -> Self {
        self.map_size = self.map_size.max(stored.map_size);
        self.page_size = stored.page_size;
        self
    }

    /// Load the configuration persisted in `dir`, if any
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(dir.join(CONFIG_FILE)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Io(err)),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Persist the configuration in `dir`.
    ///
    /// Written to a temporary file and renamed into place.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
