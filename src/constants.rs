use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
    }
}

// Transaction flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransactionFlags: u32 {
        // Reuse environment flags
        const RDONLY = EnvFlags::RDONLY.bits();

        // Transaction-specific flags
        const FINISHED = 0x01;
        const ERROR = 0x02;
        const DIRTY = 0x04;
    }
}

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Smallest page size accepted by an environment
pub const MIN_PAGE_SIZE: usize = 512;
/// Magic number for lumokv files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 1;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;
/// Packed format version stored in meta pages
pub const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;
/// Meta pages at the start of the data file
pub const META_PAGES: usize = 2;
/// Per-record header: key length and value length
pub const RECORD_HEADER: usize = 8;
/// Largest key accepted by `put`
pub const MAX_KEY_SIZE: usize = 511;
/// Largest value accepted by `put`; lengths are stored as `u32`
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Default arena capacity (10 MiB)
pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
/// Default growth multiplier applied on arena-full
pub const DEFAULT_RESIZE_FACTOR: f64 = 1.2;

/// Data file name inside an environment directory
pub const DATA_FILE: &str = "data.mdb";
/// Persisted database configuration file name
pub const CONFIG_FILE: &str = "lumokv.json";
