use std::ops::Bound;
use std::sync::Arc;

use crate::env::Shared;
use crate::error::{Error, Result};
use crate::snapshot::Snapshot;

/// Ordered iterator over a transaction's records.
///
/// Owns a reference to the snapshot it walks, so it can outlive the borrow of
/// the transaction that created it. A cursor created by a read transaction
/// yields [`Error::MapResized`] (and then ends) once the environment has been
/// grown past the map size the transaction was opened with.
#[derive(Debug)]
pub struct Cursor {
    shared: Arc<Shared>,
    data: Arc<Snapshot>,
    /// Map size to watch for remaps, if any
    watch: Option<usize>,
    /// Lower bound of the next step
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    done: bool,
}

impl Cursor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        data: Arc<Snapshot>,
        watch: Option<usize>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Self {
        // An empty or inverted range would make BTreeMap::range panic
        let done = matches!((start, end), (Some(start), Some(end)) if start >= end);

        Cursor {
            shared,
            data,
            watch,
            lower: start.map_or(Bound::Unbounded, |key| Bound::Included(key.to_vec())),
            upper: end.map_or(Bound::Unbounded, |key| Bound::Excluded(key.to_vec())),
            done,
        }
    }

    fn check_remap(&self) -> Result<()> {
        match self.watch {
            Some(map_size) if self.shared.map_size() > map_size => Err(Error::MapResized),
            _ => Ok(()),
        }
    }
}

impl Iterator for Cursor {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if let Err(err) = self.check_remap() {
            self.done = true;
            return Some(Err(err));
        }

        let next = self
            .data
            .entries
            .range((self.lower.clone(), self.upper.clone()))
            .next()
            .map(|(key, value)| (key.clone(), value.clone()));

        match next {
            Some((key, value)) => {
                self.lower = Bound::Excluded(key.clone());
                Some(Ok((key, value)))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
