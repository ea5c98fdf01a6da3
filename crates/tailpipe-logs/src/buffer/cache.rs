use std::collections::HashMap;

use tailpipe_types::{Column, LogLineIndex, ReadOnlyLogEntry, Value};

use super::LogBufferList;

/// Default number of rows kept by a [`LogEntryCache`]
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Bounded cache of decoded rows, keyed by row index
///
/// Rows live in a contiguous [`LogBufferList`]; each storage position remembers which row it
/// holds and when it was last touched. Access stamps come from a logical clock so eviction order
/// is deterministic.
#[derive(Debug)]
pub struct LogEntryCache {
    capacity: usize,
    rows: LogBufferList,

    /// Row index held at each storage position
    keys: Vec<LogLineIndex>,

    /// Last access stamp of each storage position
    last_access: Vec<u64>,

    /// Storage position of each cached row
    positions: HashMap<LogLineIndex, usize>,

    clock: u64,
}

impl LogEntryCache {
    pub fn new(columns: impl IntoIterator<Item = Column>) -> Self {
        Self::with_capacity(columns, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(columns: impl IntoIterator<Item = Column>, capacity: usize) -> Self {
        Self {
            capacity,
            rows: LogBufferList::new(columns),
            keys: Vec::new(),
            last_access: Vec::new(),
            positions: HashMap::new(),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, index: LogLineIndex) -> bool {
        self.positions.contains_key(&index)
    }

    /// Row indices in storage order
    pub fn indices(&self) -> &[LogLineIndex] {
        &self.keys
    }

    /// Store `entry` as row `index`, replacing an existing copy.
    ///
    /// Capacity is only enforced by [`LogEntryCache::vacuum`].
    pub fn insert(&mut self, index: LogLineIndex, entry: &dyn ReadOnlyLogEntry) {
        if !index.is_valid() {
            return;
        }
        let stamp = self.tick();
        match self.positions.get(&index) {
            Some(&position) => {
                self.rows.remove_at(position);
                self.rows.insert(position, entry);
                self.last_access[position] = stamp;
            }
            None => {
                self.positions.insert(index, self.keys.len());
                self.rows.add(entry);
                self.keys.push(index);
                self.last_access.push(stamp);
            }
        }
    }

    /// Value of `column` for a cached row, refreshing its access stamp
    pub fn get(&mut self, index: LogLineIndex, column: Column) -> Option<Value> {
        let position = *self.positions.get(&index)?;
        self.last_access[position] = self.tick();
        Some(self.rows.value(column, position))
    }

    /// Drop a single row
    pub fn remove(&mut self, index: LogLineIndex) -> bool {
        match self.positions.get(&index) {
            Some(&position) => {
                self.remove_positions(vec![position]);
                true
            }
            None => false,
        }
    }

    /// Drop every row at or after `index`
    pub fn remove_from(&mut self, index: LogLineIndex) {
        let mut doomed: Vec<usize> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(_, key)| **key >= index)
            .map(|(position, _)| position)
            .collect();
        doomed.reverse();
        self.remove_positions(doomed);
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.keys.clear();
        self.last_access.clear();
        self.positions.clear();
    }

    /// Evict least recently used rows once the cache holds more than its capacity.
    ///
    /// Being `k` rows over capacity evicts `capacity / 2 + k` rows. Returns the number evicted.
    pub fn vacuum(&mut self) -> usize {
        let len = self.len();
        if len <= self.capacity {
            return 0;
        }
        let excess = len - self.capacity;
        let evict = (self.capacity / 2 + excess).min(len);

        let mut by_age: Vec<usize> = (0..len).collect();
        by_age.sort_by_key(|&position| self.last_access[position]);

        let mut doomed = by_age[..evict].to_vec();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        self.remove_positions(doomed);

        tracing::trace!(evicted = evict, remaining = self.len(), "Vacuumed entry cache");
        evict
    }

    /// Remove storage positions, which must be sorted in descending order
    fn remove_positions(&mut self, descending: Vec<usize>) {
        if descending.is_empty() {
            return;
        }
        // Adjacent positions are removed as one range
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for position in descending {
            match runs.last_mut() {
                Some((start, len)) if *start == position + 1 => {
                    *start = position;
                    *len += 1;
                }
                _ => runs.push((position, 1)),
            }
        }
        for (start, len) in runs {
            self.rows.remove_range(start, len);
            self.keys.drain(start..start + len);
            self.last_access.drain(start..start + len);
        }
        self.positions = self
            .keys
            .iter()
            .enumerate()
            .map(|(position, key)| (*key, position))
            .collect();
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tailpipe_types::LogEntry;
    use tailpipe_types::columns::RAW_CONTENT;

    fn line(text: String) -> LogEntry {
        LogEntry::new().with(&RAW_CONTENT, Value::Text(Some(text)))
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = LogEntryCache::new([&RAW_CONTENT]);
        cache.insert(LogLineIndex::new(4), &line("four".into()));
        cache.insert(LogLineIndex::INVALID, &line("nope".into()));

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(LogLineIndex::new(4), &RAW_CONTENT),
            Some(Value::Text(Some("four".into())))
        );
        assert_eq!(cache.get(LogLineIndex::new(5), &RAW_CONTENT), None);

        cache.insert(LogLineIndex::new(4), &line("FOUR".into()));
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(LogLineIndex::new(4), &RAW_CONTENT),
            Some(Value::Text(Some("FOUR".into())))
        );
    }

    #[test]
    fn test_vacuum_keeps_most_recent() {
        let mut cache = LogEntryCache::new([&RAW_CONTENT]);
        for i in 0..15_000usize {
            cache.insert(LogLineIndex::from(i), &line(format!("line {i}")));
        }
        assert_eq!(cache.len(), 15_000);

        assert_eq!(cache.vacuum(), 10_000);
        assert_eq!(cache.len(), 5_000);

        let expected: Vec<LogLineIndex> = (10_000..15_000usize).map(LogLineIndex::from).collect();
        assert_eq!(cache.indices(), expected.as_slice());
        assert_eq!(
            cache.get(LogLineIndex::new(12_345), &RAW_CONTENT),
            Some(Value::Text(Some("line 12345".into())))
        );
        assert_eq!(cache.get(LogLineIndex::new(9_999), &RAW_CONTENT), None);
    }

    #[test]
    fn test_vacuum_respects_reads() {
        let mut cache = LogEntryCache::with_capacity([&RAW_CONTENT], 4);
        for i in 0..6usize {
            cache.insert(LogLineIndex::from(i), &line(i.to_string()));
        }
        // Touch the two oldest rows so they survive
        cache.get(LogLineIndex::new(0), &RAW_CONTENT);
        cache.get(LogLineIndex::new(1), &RAW_CONTENT);

        // 2 over capacity: evict 4 / 2 + 2 rows
        assert_eq!(cache.vacuum(), 4);
        assert_eq!(
            cache.indices(),
            &[LogLineIndex::new(0), LogLineIndex::new(1)]
        );
    }

    #[test]
    fn test_remove_from() {
        let mut cache = LogEntryCache::new([&RAW_CONTENT]);
        for i in 0..5usize {
            cache.insert(LogLineIndex::from(i), &line(i.to_string()));
        }
        cache.remove_from(LogLineIndex::new(3));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(LogLineIndex::new(3)));

        assert!(cache.remove(LogLineIndex::new(1)));
        assert!(!cache.remove(LogLineIndex::new(1)));
        assert_eq!(
            cache.get(LogLineIndex::new(2), &RAW_CONTENT),
            Some(Value::Text(Some("2".into())))
        );
    }

    #[test]
    fn test_under_capacity_is_untouched() {
        let mut cache = LogEntryCache::with_capacity([&RAW_CONTENT], 10);
        cache.insert(LogLineIndex::new(0), &line("a".into()));
        assert_eq!(cache.vacuum(), 0);
        assert_eq!(cache.len(), 1);
    }
}
