//! Line and entry filtering with index translation

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tailpipe_types::columns::{self, combine_with_minimum};
use tailpipe_types::properties::{self, PropertiesBuffer};
use tailpipe_types::{
    Column, LogEntry, LogEntryIndex, LogLineIndex, LogSourceSection, Modification, Property,
    ReadOnlyLogEntry, Value,
};
use tokio_util::sync::CancellationToken;

use crate::derived;
use crate::engine::{LogSourceCore, RunOnce, StageOptions};
use crate::error::{LogSourceError, Result, ensure_capacity};
use crate::filter::{LogEntryFilter, LogLineFilter};
use crate::listener::{LogSourceListener, StageKey};
use crate::pending::PendingModifications;
use crate::scheduler::TaskScheduler;
use crate::source::{LogSource, LogSourceExt};

/// Kept rows, in upstream order
#[derive(Default)]
struct FilterIndex {
    /// Upstream row of every kept row
    rows: Vec<LogLineIndex>,

    /// Entry index of every kept row, renumbered without gaps
    entries: Vec<LogEntryIndex>,

    /// Fraction of the known upstream rows processed so far
    progress: f64,
}

/// Lines of the upstream entry currently being read
struct PendingEntry {
    key: LogEntryIndex,

    /// Lines that passed the line filter
    lines: Vec<LogEntry>,

    /// How many of `lines` are currently exposed
    admitted: usize,
}

#[derive(Default)]
struct FilterState {
    /// Upstream rows announced so far
    known: usize,

    /// Next upstream row to read
    cursor: usize,

    /// First upstream row of every entry read so far
    entry_starts: Vec<usize>,

    current: Option<PendingEntry>,
    next_entry_index: i64,
}

/// Exposes the lines of an upstream source that pass a line filter and, grouped by
/// `LogEntryIndex`, an entry filter.
///
/// The trailing entry is exposed as soon as it passes and withdrawn again when more of its
/// lines arrive and it no longer does.
pub struct FilteredLogSource {
    core: LogSourceCore,
    source: Arc<dyn LogSource>,
    line_filter: Option<Arc<dyn LogLineFilter>>,
    entry_filter: Option<Arc<dyn LogEntryFilter>>,
    options: StageOptions,
    pending: PendingModifications,
    index: RwLock<FilterIndex>,
    state: Mutex<FilterState>,
}

impl FilteredLogSource {
    /// Filter `source`; without any filter every line is passed through
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        line_filter: Option<Arc<dyn LogLineFilter>>,
        entry_filter: Option<Arc<dyn LogEntryFilter>>,
        options: StageOptions,
    ) -> Arc<Self> {
        let stage = Arc::new(Self {
            core: LogSourceCore::new(scheduler),
            source,
            line_filter,
            entry_filter,
            options,
            pending: PendingModifications::new(),
            index: RwLock::new(FilterIndex::default()),
            state: Mutex::new(FilterState::default()),
        });
        stage.source.add_listener(
            stage.pending.listener(),
            stage.options.max_wait,
            stage.options.batch_size,
        );
        stage.core.start("filtered", &stage);
        stage
    }

    /// Position of upstream row `original` in this source, `INVALID` if it was filtered out
    pub fn index_of_original(&self, original: LogLineIndex) -> LogLineIndex {
        let index = self.index.read();
        match index.rows.binary_search(&original) {
            Ok(position) => LogLineIndex::from(position),
            Err(_) => LogLineIndex::INVALID,
        }
    }

    fn reset(&self, state: &mut FilterState) {
        *state = FilterState::default();
        *self.index.write() = FilterIndex::default();
        self.core.reset_end_of_source_reached();
        self.core.listeners().reset();
        tracing::debug!("Upstream reset, dropping filtered rows");
    }

    /// Upstream now ends at `count`.
    ///
    /// The entry the cut falls into may continue differently, so processing resumes at its
    /// first line.
    fn invalidate(&self, state: &mut FilterState, count: usize) {
        state.known = count;
        if count >= state.cursor {
            return;
        }

        while state.entry_starts.last().is_some_and(|start| *start >= count) {
            state.entry_starts.pop();
        }
        let rewind = state.entry_starts.pop().unwrap_or(0);
        state.cursor = rewind;
        state.current = None;

        let (kept, removed) = {
            let mut index = self.index.write();
            let kept = index
                .rows
                .partition_point(|row| row.as_usize().is_some_and(|row| row < rewind));
            let removed = index.rows.len() - kept;
            index.rows.truncate(kept);
            index.entries.truncate(kept);
            state.next_entry_index = index.entries.last().map_or(0, |last| last.value() + 1);
            (kept, removed)
        };
        if removed > 0 {
            self.core.listeners().invalidate(kept, removed);
        }
    }

    fn entry_passes(&self, lines: &[LogEntry]) -> bool {
        if lines.is_empty() {
            return false;
        }
        match &self.entry_filter {
            Some(filter) => {
                let lines: Vec<&dyn ReadOnlyLogEntry> =
                    lines.iter().map(|line| line as &dyn ReadOnlyLogEntry).collect();
                filter.passes_entry(&lines)
            }
            None => true,
        }
    }

    /// Expose the not yet exposed lines of `entry`, or withdraw all of them
    fn apply(&self, entry: &mut PendingEntry, entry_index: i64, keep: bool) {
        if keep {
            if entry.admitted < entry.lines.len() {
                let mut index = self.index.write();
                let entry_index = LogEntryIndex::new(entry_index);
                for line in &entry.lines[entry.admitted..] {
                    index.rows.push(line.index());
                    index.entries.push(entry_index);
                }
                entry.admitted = entry.lines.len();
            }
        } else if entry.admitted > 0 {
            let first = {
                let mut index = self.index.write();
                let first = index.rows.len().saturating_sub(entry.admitted);
                index.rows.truncate(first);
                index.entries.truncate(first);
                first
            };
            self.core.listeners().invalidate(first, entry.admitted);
            entry.admitted = 0;
        }
    }

    fn complete_entry(&self, state: &mut FilterState) {
        let Some(mut entry) = state.current.take() else {
            return;
        };
        let keep = self.entry_passes(&entry.lines);
        self.apply(&mut entry, state.next_entry_index, keep);
        if keep {
            state.next_entry_index += 1;
        }
    }

    fn admit_tentatively(&self, state: &mut FilterState) {
        let next_entry_index = state.next_entry_index;
        if let Some(entry) = state.current.as_mut() {
            let keep = self.entry_passes(&entry.lines);
            self.apply(entry, next_entry_index, keep);
        }
    }

    /// Read and filter the next batch of upstream rows
    fn process_batch(&self, state: &mut FilterState, token: &CancellationToken) -> usize {
        let end = state.known.min(state.cursor + self.options.batch_size);
        if state.cursor >= end {
            return 0;
        }

        let section = LogSourceSection::from_range(state.cursor..end);
        let columns = self.source.columns();
        let rows = match self.source.get_entries_in(section, &columns) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!("Failed to read upstream rows {}: {}", section, err);
                return 0;
            }
        };

        let mut processed = 0;
        for row in rows.iter() {
            if token.is_cancelled() {
                break;
            }
            let upstream = state.cursor;
            let key = match row.log_entry_index() {
                key if key.is_valid() => key,
                _ => LogEntryIndex::from(upstream),
            };

            if state.current.as_ref().is_some_and(|entry| entry.key != key) {
                self.complete_entry(state);
            }
            if state.current.is_none() {
                state.entry_starts.push(upstream);
            }
            let entry = state.current.get_or_insert_with(|| PendingEntry {
                key,
                lines: Vec::new(),
                admitted: 0,
            });

            let passes = self
                .line_filter
                .as_ref()
                .is_none_or(|filter| filter.passes_line(&row));
            if passes {
                let line = LogEntry::copy_of(&row)
                    .with(&columns::INDEX, Value::LineIndex(LogLineIndex::from(upstream)));
                entry.lines.push(line);
            }

            state.cursor += 1;
            processed += 1;
        }

        if state.cursor >= state.known {
            self.admit_tentatively(state);
        }
        processed
    }

    fn properties_snapshot(&self) -> PropertiesBuffer {
        let mut buffer = PropertiesBuffer::minimum();
        self.source.get_all_properties(&mut buffer);

        let (count, progress) = {
            let index = self.index.read();
            (index.rows.len(), index.progress)
        };
        let upstream_progress = buffer
            .value(&properties::PERCENTAGE_PROCESSED)
            .as_percentage()
            .unwrap_or(0.0);
        buffer.set(
            &properties::PERCENTAGE_PROCESSED,
            Value::Percentage((progress * upstream_progress).clamp(0.0, 1.0)),
        );
        buffer.set(&properties::LOG_ENTRY_COUNT, Value::Integer(count as i64));
        buffer
    }
}

impl RunOnce for FilteredLogSource {
    fn run_once(&self, token: &CancellationToken) -> Duration {
        let mut state = self.state.lock();
        for (_, modification) in self.pending.drain() {
            match modification {
                Modification::Reset => self.reset(&mut state),
                Modification::Invalidated(section) => {
                    self.invalidate(&mut state, section.index.as_usize().unwrap_or(0))
                }
                Modification::Appended(section) => state.known = state.known.max(section.end()),
            }
        }

        let processed = self.process_batch(&mut state, token);

        let count = {
            let mut index = self.index.write();
            index.progress = if state.known == 0 {
                1.0
            } else {
                state.cursor as f64 / state.known as f64
            };
            index.rows.len()
        };
        self.core.listeners().on_read_count(count);

        let caught_up = state.cursor >= state.known && self.pending.is_empty();
        if caught_up && self.source.end_of_source_reached() {
            self.core.set_end_of_source_reached();
        } else {
            self.core.reset_end_of_source_reached();
        }

        if processed > 0 {
            Duration::ZERO
        } else {
            self.options.idle_delay
        }
    }
}

impl LogSource for FilteredLogSource {
    fn key(&self) -> StageKey {
        self.core.key()
    }

    fn columns(&self) -> Vec<Column> {
        combine_with_minimum(self.source.columns())
    }

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        max_line_count: usize,
    ) {
        self.core.add_listener(listener, max_wait, max_line_count);
    }

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) {
        self.core.remove_listener(listener);
    }

    fn properties(&self) -> Vec<Property> {
        self.properties_snapshot().properties()
    }

    fn get_property(&self, property: Property) -> Result<Value> {
        self.properties_snapshot()
            .get(property)
            .cloned()
            .ok_or(LogSourceError::NoSuchProperty(property.id()))
    }

    fn get_all_properties(&self, destination: &mut PropertiesBuffer) {
        self.properties_snapshot().copy_all_to(destination);
    }

    fn get_column(
        &self,
        indices: &[LogLineIndex],
        column: Column,
        destination: &mut [Value],
    ) -> Result<()> {
        ensure_capacity(indices.len(), destination.len())?;
        if !self.columns().contains(&column) {
            return Err(LogSourceError::NoSuchColumn(column.id()));
        }

        let index = self.index.read();
        let count = index.rows.len();
        let position = |i: &LogLineIndex| i.as_usize().filter(|p| *p < count);

        if column == &columns::INDEX || column == &columns::LINE_NUMBER {
            derived::fill_positional(column, indices, count, destination);
            return Ok(());
        }
        if column == &columns::LOG_ENTRY_INDEX {
            for (slot, i) in destination.iter_mut().zip(indices) {
                *slot = match position(i) {
                    Some(p) => Value::EntryIndex(index.entries[p]),
                    None => column.default_value(),
                };
            }
            return Ok(());
        }

        let translated: Vec<LogLineIndex> = indices
            .iter()
            .map(|i| position(i).map_or(LogLineIndex::INVALID, |p| index.rows[p]))
            .collect();

        if column == &columns::ORIGINAL_INDEX {
            for (slot, upstream) in destination.iter_mut().zip(&translated) {
                *slot = if upstream.is_valid() {
                    Value::LineIndex(*upstream)
                } else {
                    column.default_value()
                };
            }
            return Ok(());
        }

        if column == &columns::DELTA_TIME {
            let previous: Vec<LogLineIndex> = indices
                .iter()
                .map(|i| {
                    position(i)
                        .and_then(|p| p.checked_sub(1))
                        .map_or(LogLineIndex::INVALID, |p| index.rows[p])
                })
                .collect();
            drop(index);

            let mut current = vec![columns::TIMESTAMP.default_value(); translated.len()];
            let mut before = current.clone();
            self.source
                .get_column(&translated, &columns::TIMESTAMP, &mut current)?;
            self.source
                .get_column(&previous, &columns::TIMESTAMP, &mut before)?;
            for ((slot, before), current) in destination.iter_mut().zip(&before).zip(&current) {
                *slot = derived::delta(before.as_timestamp(), current.as_timestamp());
            }
            return Ok(());
        }
        drop(index);

        if !self.source.columns().contains(&column) {
            destination[..indices.len()].fill(column.default_value());
            return Ok(());
        }
        self.source.get_column(&translated, column, destination)
    }

    fn count(&self) -> usize {
        self.index.read().rows.len()
    }

    fn end_of_source_reached(&self) -> bool {
        self.core.end_of_source_reached()
    }

    fn upstream(&self) -> Vec<Arc<dyn LogSource>> {
        vec![Arc::clone(&self.source)]
    }

    fn dispose(&self) {
        if self.core.dispose() {
            self.source.remove_listener(&self.pending.listener());
            *self.index.write() = FilterIndex::default();
        }
    }
}

impl Drop for FilteredLogSource {
    fn drop(&mut self) {
        self.dispose();
    }
}
