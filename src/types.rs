/// Environment information, as returned by `Environment::info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the data file and mmap region shared by every handle
    pub map_size: usize,
    /// Map size this handle currently operates against
    pub mapped_size: usize,
    /// Page size
    pub page_size: usize,
    /// Last page in use (meta pages included)
    pub last_pgno: usize,
    /// ID of the last committed transaction
    pub last_txnid: u64,
    /// Open read transactions
    pub num_readers: u32,
    /// Whether a write transaction currently holds the writer lock
    pub writer_active: bool,
}

/// Statistics of the committed data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Page size
    pub psize: usize,
    /// Pages occupied by records
    pub data_pages: usize,
    /// Bytes occupied by records
    pub used_bytes: usize,
    /// Number of records
    pub entries: usize,
}
