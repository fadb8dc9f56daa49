use crate::constants::{MDB_MAGIC, MDB_VERSION, META_PAGES};
use crate::error::{Error, Result};

/// Encoded size of a meta header
pub(crate) const META_SIZE: usize = 56;

/// Meta header stored at the start of each meta page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying lumokv files
    pub(crate) magic: u32,
    /// Version number
    pub(crate) version: u32,
    /// Page size for this environment
    pub(crate) page_size: u32,
    /// Format ID
    pub(crate) format_id: u32,
    /// Size of mmap region
    pub(crate) mapsize: u64,
    /// txnid that committed this page
    pub(crate) txnid: u64,
    /// Bytes used by records in the data region
    pub(crate) used: u64,
    /// Number of records
    pub(crate) entries: u64,
    /// Start of the records, relative to the data region
    pub(crate) offset: u64,
}

impl MetaHeader {
    pub(crate) fn new(page_size: usize, mapsize: usize) -> Self {
        MetaHeader {
            magic: MDB_MAGIC,
            version: MDB_VERSION,
            page_size: page_size as u32,
            format_id: 0,
            mapsize: mapsize as u64,
            txnid: 0,
            used: 0,
            entries: 0,
            offset: 0,
        }
    }

    /// Meta slot a given txnid is written to
    pub(crate) fn slot(txnid: u64) -> usize {
        (txnid % META_PAGES as u64) as usize
    }

    pub(crate) fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.format_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mapsize.to_le_bytes());
        buf[24..32].copy_from_slice(&self.txnid.to_le_bytes());
        buf[32..40].copy_from_slice(&self.used.to_le_bytes());
        buf[40..48].copy_from_slice(&self.entries.to_le_bytes());
        buf[48..56].copy_from_slice(&self.offset.to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(Error::Invalid);
        }

        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let meta = MetaHeader {
            magic: u32_at(0),
            version: u32_at(4),
            page_size: u32_at(8),
            format_id: u32_at(12),
            mapsize: u64_at(16),
            txnid: u64_at(24),
            used: u64_at(32),
            entries: u64_at(40),
            offset: u64_at(48),
        };

        // Validate magic number
        if meta.magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }

        // Validate version
        if meta.version != MDB_VERSION {
            return Err(Error::VersionMismatch);
        }

        if meta.page_size == 0 || !meta.page_size.is_power_of_two() {
            return Err(Error::Corrupted);
        }

        Ok(meta)
    }

    /// Valid metas out of the two slots, newest first.
    ///
    /// The older one is still usable when the newest turns out to describe a
    /// damaged data region.
    pub(crate) fn by_recency(first: Result<Self>, second: Result<Self>) -> Result<Vec<Self>> {
        match (first, second) {
            (Ok(a), Ok(b)) if b.txnid > a.txnid => Ok(vec![b, a]),
            (Ok(a), Ok(b)) => Ok(vec![a, b]),
            (Ok(meta), Err(_)) | (Err(_), Ok(meta)) => Ok(vec![meta]),
            (Err(err), Err(_)) => Err(err),
        }
    }
}
