//! Grouping of continuation lines into logical entries

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tailpipe_types::columns::{self, combine_with_minimum};
use tailpipe_types::properties::{self, PropertiesBuffer};
use tailpipe_types::{
    Column, LogEntryIndex, LogLineIndex, LogSourceSection, Modification, Property,
    ReadOnlyLogEntry, Value,
};
use tokio_util::sync::CancellationToken;

use crate::derived;
use crate::engine::{LogSourceCore, RunOnce, StageOptions};
use crate::error::{LogSourceError, Result, ensure_capacity};
use crate::listener::{LogSourceListener, StageKey};
use crate::pending::PendingModifications;
use crate::scheduler::TaskScheduler;
use crate::source::{LogSource, LogSourceExt, clamp_indices};

/// Which entry a line belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryInfo {
    entry_index: LogEntryIndex,
    first_line: LogLineIndex,
}

#[derive(Default)]
struct MultiLineIndex {
    /// One mapping per upstream line
    lines: Vec<EntryInfo>,
    entry_count: usize,
    progress: f64,
}

#[derive(Default)]
struct MultiLineState {
    /// Upstream lines announced so far
    known: usize,

    /// Next upstream line to classify; always equal to the table length
    cursor: usize,
}

/// Re-assembles entries spread over several lines.
///
/// A line without a timestamp and without a definite level continues the entry before it. The
/// first line of an entry donates its timestamp and level to all of its lines.
pub struct MultiLineLogSource {
    core: LogSourceCore,
    source: Arc<dyn LogSource>,
    options: StageOptions,
    pending: PendingModifications,
    index: RwLock<MultiLineIndex>,
    state: Mutex<MultiLineState>,
}

impl MultiLineLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        source: Arc<dyn LogSource>,
        options: StageOptions,
    ) -> Arc<Self> {
        let stage = Arc::new(Self {
            core: LogSourceCore::new(scheduler),
            source,
            options,
            pending: PendingModifications::new(),
            index: RwLock::new(MultiLineIndex::default()),
            state: Mutex::new(MultiLineState::default()),
        });
        stage.source.add_listener(
            stage.pending.listener(),
            stage.options.max_wait,
            stage.options.batch_size,
        );
        stage.core.start("multi_line", &stage);
        stage
    }

    fn reset(&self, state: &mut MultiLineState) {
        *state = MultiLineState::default();
        *self.index.write() = MultiLineIndex::default();
        self.core.reset_end_of_source_reached();
        self.core.listeners().reset();
        tracing::debug!("Upstream reset, dropping entry table");
    }

    fn invalidate(&self, state: &mut MultiLineState, count: usize) {
        state.known = count;
        let removed = {
            let mut index = self.index.write();
            let removed = index.lines.len().saturating_sub(count);
            index.lines.truncate(count);
            index.entry_count = index
                .lines
                .last()
                .map_or(0, |last| last.entry_index.value() as usize + 1);
            removed
        };
        state.cursor = state.cursor.min(count);
        if removed > 0 {
            self.core.listeners().invalidate(count, removed);
        }
    }

    fn process_batch(&self, state: &mut MultiLineState, token: &CancellationToken) -> usize {
        let table_len = self.index.read().lines.len();
        if table_len != state.cursor {
            tracing::error!(
                table = table_len,
                cursor = state.cursor,
                "Entry table out of sync with upstream cursor, resuming from table"
            );
            state.cursor = table_len;
        }

        let end = state.known.min(state.cursor + self.options.batch_size);
        if state.cursor >= end {
            return 0;
        }
        let section = LogSourceSection::from_range(state.cursor..end);
        let rows = match self
            .source
            .get_entries_in(section, &[&columns::LOG_LEVEL, &columns::TIMESTAMP])
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!("Failed to read upstream rows {}: {}", section, err);
                return 0;
            }
        };

        let mut index = self.index.write();
        let mut processed = 0;
        for row in rows.iter() {
            if token.is_cancelled() {
                break;
            }
            let line = LogLineIndex::from(state.cursor);
            let starts_entry = row.timestamp().is_some() || row.log_level().is_definite();
            let previous = index.lines.last().copied();
            let info = match previous {
                Some(previous) if !starts_entry => previous,
                _ => {
                    let info = EntryInfo {
                        entry_index: LogEntryIndex::from(index.entry_count),
                        first_line: line,
                    };
                    index.entry_count += 1;
                    info
                }
            };
            index.lines.push(info);
            state.cursor += 1;
            processed += 1;
        }
        processed
    }

    /// Upstream first line of every requested row, `INVALID` out of range
    fn first_lines(&self, indices: &[LogLineIndex]) -> Vec<LogLineIndex> {
        let index = self.index.read();
        indices
            .iter()
            .map(|i| {
                i.as_usize()
                    .and_then(|p| index.lines.get(p))
                    .map_or(LogLineIndex::INVALID, |info| info.first_line)
            })
            .collect()
    }

    fn properties_snapshot(&self) -> PropertiesBuffer {
        let mut buffer = PropertiesBuffer::minimum();
        self.source.get_all_properties(&mut buffer);

        let (entries, progress) = {
            let index = self.index.read();
            (index.entry_count, index.progress)
        };
        let upstream_progress = buffer
            .value(&properties::PERCENTAGE_PROCESSED)
            .as_percentage()
            .unwrap_or(0.0);
        buffer.set(
            &properties::PERCENTAGE_PROCESSED,
            Value::Percentage((progress * upstream_progress).clamp(0.0, 1.0)),
        );
        buffer.set(&properties::LOG_ENTRY_COUNT, Value::Integer(entries as i64));
        buffer
    }
}

impl RunOnce for MultiLineLogSource {
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
            index.lines.len()
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

impl LogSource for MultiLineLogSource {
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

        if column == &columns::LOG_ENTRY_INDEX {
            let index = self.index.read();
            for (slot, i) in destination.iter_mut().zip(indices) {
                *slot = i
                    .as_usize()
                    .and_then(|p| index.lines.get(p))
                    .map_or_else(|| column.default_value(), |info| {
                        Value::EntryIndex(info.entry_index)
                    });
            }
            return Ok(());
        }

        if column == &columns::TIMESTAMP
            || column == &columns::LOG_LEVEL
            || column == &columns::ELAPSED_TIME
        {
            let first_lines = self.first_lines(indices);
            return self.source.get_column(&first_lines, column, destination);
        }

        if column == &columns::DELTA_TIME {
            let previous: Vec<LogLineIndex> = indices.iter().map(|i| i.offset(-1)).collect();
            let mut current = vec![columns::TIMESTAMP.default_value(); indices.len()];
            let mut before = current.clone();
            self.get_column(indices, &columns::TIMESTAMP, &mut current)?;
            self.get_column(&previous, &columns::TIMESTAMP, &mut before)?;
            for ((slot, before), current) in destination.iter_mut().zip(&before).zip(&current) {
                *slot = derived::delta(before.as_timestamp(), current.as_timestamp());
            }
            return Ok(());
        }

        let clamped = clamp_indices(indices, self.count());
        if !self.source.columns().contains(&column) {
            destination[..indices.len()].fill(column.default_value());
            return Ok(());
        }
        self.source.get_column(&clamped, column, destination)
    }

    fn count(&self) -> usize {
        self.index.read().lines.len()
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
            *self.index.write() = MultiLineIndex::default();
        }
    }
}

impl Drop for MultiLineLogSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::testing::RecordingListener;
    use crate::memory::InMemoryLogSource;
    use crate::scheduler::ManualTaskScheduler;
    use chrono::{NaiveDate, NaiveDateTime};
    use pretty_assertions::assert_eq;
    use tailpipe_types::{LogEntry, LogLevel};

    fn at(second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, second)
            .unwrap()
    }

    fn line(text: &str, level: LogLevel, timestamp: Option<NaiveDateTime>) -> LogEntry {
        LogEntry::new()
            .with(&columns::RAW_CONTENT, Value::Text(Some(text.to_string())))
            .with(&columns::LOG_LEVEL, Value::Level(level))
            .with(&columns::TIMESTAMP, Value::Timestamp(timestamp))
    }

    fn stage(
        scheduler: &Arc<ManualTaskScheduler>,
        upstream: &Arc<InMemoryLogSource>,
    ) -> Arc<MultiLineLogSource> {
        MultiLineLogSource::new(scheduler.clone(), upstream.clone(), StageOptions::default())
    }

    fn entry_indices(source: &dyn LogSource) -> Vec<i64> {
        source
            .get_column_in(LogSourceSection::new(0, source.count()), &columns::LOG_ENTRY_INDEX)
            .unwrap()
            .iter()
            .map(|v| v.as_entry_index().map_or(-1, |e| e.value()))
            .collect()
    }

    #[test]
    fn test_continuation_inherits_first_line() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let upstream = Arc::new(InMemoryLogSource::new());
        upstream.add(&line("2024-05-01 12:00:01 ERROR boom", LogLevel::Error, Some(at(1))));
        upstream.add(&line("   at main()", LogLevel::Other, None));
        let multi = stage(&scheduler, &upstream);

        scheduler.run_once();
        let first = multi.get_entry(LogLineIndex::new(0)).unwrap();
        let second = multi.get_entry(LogLineIndex::new(1)).unwrap();
        assert_eq!(first.log_entry_index(), second.log_entry_index());
        assert_eq!(second.timestamp(), Some(at(1)));
        assert_eq!(second.log_level(), LogLevel::Error);
        assert_eq!(second.raw_content().as_deref(), Some("   at main()"));
        assert_eq!(second.index(), LogLineIndex::new(1));
        assert_eq!(
            multi.property_or_default(&properties::LOG_ENTRY_COUNT),
            Value::Integer(1)
        );
    }

    #[test]
    fn test_definite_level_starts_entry() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let upstream = Arc::new(InMemoryLogSource::new());
        upstream.add(&line("INFO a", LogLevel::Info, None));
        upstream.add(&line("detail", LogLevel::Other, None));
        upstream.add(&line("WARN b", LogLevel::Warn, None));
        upstream.add(&line("detail", LogLevel::None, None));
        let multi = stage(&scheduler, &upstream);

        scheduler.run_once();
        assert_eq!(entry_indices(multi.as_ref()), vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_leading_continuation_forms_its_own_entry() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let upstream = Arc::new(InMemoryLogSource::new());
        upstream.add(&line("orphan", LogLevel::Other, None));
        upstream.add(&line("INFO a", LogLevel::Info, None));
        let multi = stage(&scheduler, &upstream);

        scheduler.run_once();
        assert_eq!(entry_indices(multi.as_ref()), vec![0, 1]);
    }

    #[test]
    fn test_invalidation_rolls_back_table() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let upstream = Arc::new(InMemoryLogSource::new());
        upstream.add(&line("INFO a", LogLevel::Info, None));
        upstream.add(&line("detail", LogLevel::Other, None));
        upstream.add(&line("INFO b", LogLevel::Info, None));
        let multi = stage(&scheduler, &upstream);
        let listener = RecordingListener::new();
        multi.add_listener(listener.clone(), Duration::ZERO, 100);
        scheduler.run_once();

        upstream.remove_from(1);
        upstream.add(&line("more detail", LogLevel::Other, None));
        upstream.add(&line("INFO c", LogLevel::Info, None));
        scheduler.run_once();

        assert_eq!(entry_indices(multi.as_ref()), vec![0, 0, 1]);
        assert_eq!(
            listener.modifications(),
            vec![
                Modification::Reset,
                Modification::appended(0, 3),
                Modification::invalidated(1, 2),
                Modification::appended(1, 2)
            ]
        );
    }

    #[test]
    fn test_reset_and_out_of_range() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let upstream = Arc::new(InMemoryLogSource::new());
        upstream.add(&line("INFO a", LogLevel::Info, Some(at(0))));
        let multi = stage(&scheduler, &upstream);
        scheduler.run_once();

        let indices = [LogLineIndex::new(1), LogLineIndex::INVALID];
        for column in columns::MINIMUM {
            let mut values = vec![Value::Integer(7); 2];
            multi.get_column(&indices, column, &mut values).unwrap();
            assert_eq!(values, vec![column.default_value(); 2], "{column}");
        }

        upstream.clear();
        scheduler.run_once();
        assert_eq!(multi.count(), 0);
    }

    #[test]
    fn test_delta_time_between_entries() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let upstream = Arc::new(InMemoryLogSource::new());
        upstream.add(&line("a", LogLevel::Info, Some(at(1))));
        upstream.add(&line("b", LogLevel::Other, None));
        upstream.add(&line("c", LogLevel::Info, Some(at(5))));
        let multi = stage(&scheduler, &upstream);
        scheduler.run_once();

        let deltas = multi
            .get_column_in(LogSourceSection::new(0, 3), &columns::DELTA_TIME)
            .unwrap();
        assert_eq!(
            deltas,
            vec![
                Value::TimeSpan(None),
                Value::TimeSpan(Some(chrono::TimeDelta::zero())),
                Value::TimeSpan(Some(chrono::TimeDelta::seconds(4))),
            ]
        );
    }
}
