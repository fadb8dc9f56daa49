use std::collections::BTreeMap;

use crate::constants::{MAX_KEY_SIZE, MAX_VALUE_SIZE, META_PAGES, RECORD_HEADER};
use crate::error::{Error, Result};

/// Committed (or in-flight) contents of an environment.
///
/// Readers share the committed snapshot through an `Arc`; write transactions
/// clone it on first mutation.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub(crate) entries: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Encoded size of all records
    pub(crate) used: usize,
    /// txnid that produced this snapshot
    pub(crate) txnid: u64,
    /// Where the records sit in the data region
    pub(crate) offset: usize,
}

/// Encoded size of one record
pub(crate) fn record_size(key: &[u8], value: &[u8]) -> usize {
    RECORD_HEADER + key.len() + value.len()
}

/// Whether a record of these sizes can be encoded
pub(crate) fn valid_record_sizes(key_len: usize, value_len: usize) -> bool {
    key_len > 0 && key_len <= MAX_KEY_SIZE && value_len <= MAX_VALUE_SIZE
}

/// Offset for a new region of `used` bytes that leaves the previous region
/// `[prev_offset, prev_offset + prev_used)` intact: the front of the data
/// region if it fits there, otherwise right after the previous region.
pub(crate) fn region_offset(prev_offset: usize, prev_used: usize, used: usize) -> usize {
    if prev_used == 0 || used <= prev_offset {
        0
    } else {
        prev_offset + prev_used
    }
}

/// Pages needed to hold `used` bytes of records plus the meta pages
pub(crate) fn pages_needed(used: usize, page_size: usize) -> usize {
    META_PAGES + used.div_ceil(page_size)
}

impl Snapshot {
    /// Pages up to the end of this snapshot's region, meta pages included
    pub(crate) fn pages(&self, page_size: usize) -> usize {
        pages_needed(self.offset + self.used, page_size)
    }

    /// Used bytes after replacing (or inserting) `key` with `value`
    pub(crate) fn used_after_put(&self, key: &[u8], value: &[u8]) -> usize {
        let old = self
            .entries
            .get(key)
            .map(|old| record_size(key, old))
            .unwrap_or(0);
        self.used - old + record_size(key, value)
    }

    pub(crate) fn insert(&mut self, key: &[u8], value: &[u8]) {
        let used = self.used_after_put(key, value);
        self.entries.insert(key.to_vec(), value.to_vec());
        self.used = used;
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.used -= record_size(key, &old);
                true
            }
            None => false,
        }
    }

    /// Write all records, in key order, into `buf`.
    pub(crate) fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.used {
            return Err(Error::MapFull);
        }

        let mut offset = 0;
        for (key, value) in &self.entries {
            buf[offset..offset + 4].copy_from_slice(&(key.len() as u32).to_le_bytes());
            buf[offset + 4..offset + 8].copy_from_slice(&(value.len() as u32).to_le_bytes());
            offset += RECORD_HEADER;
            buf[offset..offset + key.len()].copy_from_slice(key);
            offset += key.len();
            buf[offset..offset + value.len()].copy_from_slice(value);
            offset += value.len();
        }
        Ok(())
    }

    /// Rebuild a snapshot from an encoded data region.
    pub(crate) fn decode(buf: &[u8], entries: usize, txnid: u64, offset: usize) -> Result<Self> {
        let mut snapshot = Snapshot {
            txnid,
            offset,
            ..Snapshot::default()
        };

        let mut offset = 0;
        for _ in 0..entries {
            let header = buf
                .get(offset..offset + RECORD_HEADER)
                .ok_or(Error::Corrupted)?;
            let klen = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let vlen = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            offset += RECORD_HEADER;

            let key = buf.get(offset..offset + klen).ok_or(Error::Corrupted)?;
            offset += klen;
            let value = buf.get(offset..offset + vlen).ok_or(Error::Corrupted)?;
            offset += vlen;

            snapshot.insert(key, value);
        }

        if offset != buf.len() || snapshot.entries.len() != entries {
            return Err(Error::Corrupted);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_bytes_track_replace_and_remove() {
        let mut snapshot = Snapshot::default();
        snapshot.insert(b"a", b"12345");
        assert_eq!(snapshot.used, RECORD_HEADER + 1 + 5);

        snapshot.insert(b"a", b"1");
        assert_eq!(snapshot.used, RECORD_HEADER + 1 + 1);

        assert!(snapshot.remove(b"a"));
        assert!(!snapshot.remove(b"a"));
        assert_eq!(snapshot.used, 0);
    }

    #[test]
    fn pages_round_up_and_include_meta() {
        assert_eq!(pages_needed(0, 4096), META_PAGES);
        assert_eq!(pages_needed(1, 4096), META_PAGES + 1);
        assert_eq!(pages_needed(4096, 4096), META_PAGES + 1);
        assert_eq!(pages_needed(4097, 4096), META_PAGES + 2);
    }

    #[test]
    fn decode_rejects_truncated_region() {
        let mut snapshot = Snapshot::default();
        snapshot.insert(b"key", b"value");
        let mut buf = vec![0u8; snapshot.used];
        snapshot.encode_into(&mut buf).unwrap();

        let decoded = Snapshot::decode(&buf, 1, 3, 0).unwrap();
        assert_eq!(decoded.entries.get(&b"key"[..]).unwrap(), b"value");
        assert_eq!(decoded.txnid, 3);

        assert!(matches!(
            Snapshot::decode(&buf[..buf.len() - 1], 1, 3, 0),
            Err(Error::Corrupted)
        ));
    }

    #[test]
    fn new_region_never_overlaps_previous_one() {
        // Nothing to protect
        assert_eq!(region_offset(0, 0, 100), 0);
        assert_eq!(region_offset(500, 0, 100), 0);
        // Previous region at the front: go after it
        assert_eq!(region_offset(0, 300, 100), 300);
        // Room in front of the previous region
        assert_eq!(region_offset(300, 200, 300), 0);
        assert_eq!(region_offset(300, 200, 301), 500);
    }

    #[test]
    fn value_length_must_fit_the_record_header() {
        assert!(valid_record_sizes(1, 0));
        assert!(valid_record_sizes(MAX_KEY_SIZE, MAX_VALUE_SIZE));
        assert!(!valid_record_sizes(0, 1));
        assert!(!valid_record_sizes(MAX_KEY_SIZE + 1, 1));
        if let Some(too_long) = MAX_VALUE_SIZE.checked_add(1) {
            assert!(!valid_record_sizes(1, too_long));
        }
    }
}
