use chrono::NaiveDateTime;
use tailpipe_types::{LogEntryIndex, LogLineIndex, SourceId};

/// One row of the merged sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergedLine {
    pub source_id: SourceId,
    pub source_line: LogLineIndex,
    pub source_entry: LogEntryIndex,
    pub merged_entry: LogEntryIndex,
    pub timestamp: NaiveDateTime,
}

/// Positions touched since the last call to [`MergedLogSourceIndex::take_changes`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexChanges {
    None,

    /// The index became empty
    Reset,

    /// Rows from `first_modified` onward changed; the index held `previous_len` rows before
    Changed {
        first_modified: usize,
        previous_len: usize,
    },
}

/// Globally timestamp-ordered view over the lines of up to 255 sources.
///
/// Lines without a timestamp are not indexed. Lines with equal timestamps keep the order in
/// which they were inserted.
#[derive(Debug, Default)]
pub struct MergedLogSourceIndex {
    lines: Vec<MergedLine>,
    first_modified: Option<usize>,
    len_at_last_changes: usize,
}

impl MergedLogSourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&MergedLine> {
        self.lines.get(position)
    }

    pub fn lines(&self) -> &[MergedLine] {
        &self.lines
    }

    /// Number of merged entries
    pub fn entry_count(&self) -> usize {
        self.lines
            .last()
            .and_then(|line| line.merged_entry.as_usize())
            .map_or(0, |last| last + 1)
    }

    /// Insert one line, returning its position; lines without a timestamp are dropped
    pub fn insert(
        &mut self,
        source_id: SourceId,
        source_line: LogLineIndex,
        source_entry: LogEntryIndex,
        timestamp: Option<NaiveDateTime>,
    ) -> Option<usize> {
        let timestamp = timestamp?;
        let line = MergedLine {
            source_id,
            source_line,
            source_entry,
            merged_entry: LogEntryIndex::INVALID,
            timestamp,
        };

        let position = match self.lines.last() {
            Some(last) if last.timestamp > timestamp => self
                .lines
                .partition_point(|existing| existing.timestamp <= timestamp),
            _ => self.lines.len(),
        };
        self.lines.insert(position, line);
        self.renumber_from(position);
        self.touch(position);
        Some(position)
    }

    /// Drop every line of `source_id` at or after `source_line`
    pub fn remove_from(&mut self, source_id: SourceId, source_line: LogLineIndex) {
        let first = self.lines.iter().position(|line| {
            line.source_id == source_id && line.source_line >= source_line
        });
        let Some(first) = first else {
            return;
        };
        self.lines.retain(|line| {
            !(line.source_id == source_id && line.source_line >= source_line)
        });
        let position = first.min(self.lines.len());
        self.renumber_from(position);
        self.touch(position);
    }

    /// Drop every line of `source_id`
    pub fn remove_source(&mut self, source_id: SourceId) {
        self.remove_from(source_id, LogLineIndex::new(0));
    }

    pub fn clear(&mut self) {
        if !self.lines.is_empty() {
            self.lines.clear();
            self.touch(0);
        }
    }

    /// What changed since the previous call
    pub fn take_changes(&mut self) -> IndexChanges {
        let previous_len = self.len_at_last_changes;
        self.len_at_last_changes = self.lines.len();
        let Some(first_modified) = self.first_modified.take() else {
            return IndexChanges::None;
        };
        if self.lines.is_empty() {
            return IndexChanges::Reset;
        }
        IndexChanges::Changed {
            first_modified,
            previous_len,
        }
    }

    fn touch(&mut self, position: usize) {
        self.first_modified = Some(self.first_modified.map_or(position, |p| p.min(position)));
    }

    /// Recompute merged entry indices from `position` on.
    ///
    /// Consecutive rows of the same source entry share a merged entry.
    fn renumber_from(&mut self, position: usize) {
        for i in position..self.lines.len() {
            let merged_entry = match i.checked_sub(1).map(|p| self.lines[p]) {
                None => LogEntryIndex::new(0),
                Some(previous)
                    if previous.source_id == self.lines[i].source_id
                        && previous.source_entry == self.lines[i].source_entry =>
                {
                    previous.merged_entry
                }
                Some(previous) => previous.merged_entry.offset(1),
            };
            self.lines[i].merged_entry = merged_entry;
        }
    }
}
