use crate::storage::data::SeriesPath;

/// A recorded range deletion: every point of `path` at or before
/// `timestamp` is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    path: SeriesPath,
    timestamp: i64,
}

impl Deletion {
    pub fn new(path: SeriesPath, timestamp: i64) -> Self {
        Self { path, timestamp }
    }

    pub fn path(&self) -> &SeriesPath {
        &self.path
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Ordered, append-only deletion log of one memtable
#[derive(Debug, Default, Clone)]
pub struct ModificationLog {
    deletions: Vec<Deletion>,
}

impl ModificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, deletion: Deletion) {
        self.deletions.push(deletion);
    }

    /// Largest recorded boundary for `path`: every point at or before it is
    /// deleted. `None` without deletions.
    ///
    /// Scans the whole log; logs stay short because they die with their memtable.
    pub fn deleted_up_to(&self, path: &SeriesPath) -> Option<i64> {
        self.deletions
            .iter()
            .filter(|d| d.path() == path)
            .map(Deletion::timestamp)
            .max()
    }

    pub fn len(&self) -> usize {
        self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty()
    }

    pub fn clear(&mut self) {
        self.deletions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_deleted_without_records() {
        let log = ModificationLog::new();
        assert_eq!(log.deleted_up_to(&SeriesPath::new("d1", "s1")), None);
    }

    #[test]
    fn test_boundary_is_monotonic() {
        let path = SeriesPath::new("d1", "s1");
        let mut log = ModificationLog::new();
        log.record(Deletion::new(path.clone(), 10));
        log.record(Deletion::new(path.clone(), 4));
        assert_eq!(log.deleted_up_to(&path), Some(10));

        log.record(Deletion::new(SeriesPath::new("d1", "s2"), 100));
        assert_eq!(log.deleted_up_to(&path), Some(10));
        assert_eq!(log.len(), 3);

        log.record(Deletion::new(path.clone(), i64::MAX));
        assert_eq!(log.deleted_up_to(&path), Some(i64::MAX));

        log.clear();
        assert!(log.is_empty());
    }
}
