//! Time-ordered merge of several sources

mod index;

pub use index::{IndexChanges, MergedLine, MergedLogSourceIndex};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tailpipe_types::columns::{self, combine_with_minimum};
use tailpipe_types::properties::{self, PropertiesBuffer};
use tailpipe_types::{
    Column, LogLineIndex, LogSourceSection, Modification, Property, ReadOnlyLogEntry, SourceId,
    Value,
};
use tokio_util::sync::CancellationToken;

use crate::derived;
use crate::engine::{LogSourceCore, RunOnce, StageOptions};
use crate::error::{LogSourceError, Result, ensure_capacity};
use crate::listener::{LogSourceListener, StageKey};
use crate::pending::PendingModifications;
use crate::scheduler::TaskScheduler;
use crate::source::{LogSource, LogSourceExt};

/// Lines read from one source per pass
const LINES_PER_SOURCE_PER_PASS: usize = 1000;

/// How far the merge got with one source
#[derive(Clone, Copy, Debug, Default)]
struct SourceCursor {
    /// Lines announced by the source
    known: usize,

    /// Next line to read
    next: usize,
}

/// Merges the timestamped lines of up to 255 sources into one sequence ordered by time.
///
/// Every row carries the [`SourceId`] of the source it came from. Rows without a timestamp
/// are left out.
pub struct MergedLogSource {
    core: LogSourceCore,
    sources: Vec<Arc<dyn LogSource>>,
    source_ids: HashMap<StageKey, SourceId>,
    options: StageOptions,
    pending: PendingModifications,
    index: RwLock<MergedLogSourceIndex>,
    cursors: Mutex<Vec<SourceCursor>>,
    properties: RwLock<PropertiesBuffer>,
}

impl MergedLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        sources: Vec<Arc<dyn LogSource>>,
        options: StageOptions,
    ) -> Result<Arc<Self>> {
        if sources.len() > SourceId::MAX_SOURCES {
            return Err(LogSourceError::TooManySources {
                requested: sources.len(),
                max: SourceId::MAX_SOURCES,
            });
        }

        let mut source_ids = HashMap::new();
        for (position, source) in sources.iter().enumerate() {
            let Some(id) = SourceId::new(position) else {
                continue;
            };
            if let Some(first) = source_ids.insert(source.key(), id) {
                return Err(LogSourceError::DuplicateSource {
                    first: first.index().unwrap_or(position),
                    duplicate: position,
                });
            }
        }

        let stage = Arc::new(Self {
            core: LogSourceCore::new(scheduler),
            cursors: Mutex::new(vec![SourceCursor::default(); sources.len()]),
            sources,
            source_ids,
            options,
            pending: PendingModifications::new(),
            index: RwLock::new(MergedLogSourceIndex::new()),
            properties: RwLock::new(PropertiesBuffer::minimum()),
        });
        for source in &stage.sources {
            source.add_listener(
                stage.pending.listener(),
                stage.options.max_wait,
                LINES_PER_SOURCE_PER_PASS,
            );
        }
        stage.core.start("merged", &stage);
        Ok(stage)
    }

    pub fn sources(&self) -> &[Arc<dyn LogSource>] {
        &self.sources
    }

    fn apply(&self, cursors: &mut [SourceCursor], key: StageKey, modification: Modification) {
        let Some(id) = self.source_ids.get(&key).copied() else {
            tracing::debug!(?key, "Ignoring modification from an unknown source");
            return;
        };
        let Some(cursor) = id.index().and_then(|i| cursors.get_mut(i)) else {
            return;
        };

        match modification {
            Modification::Reset => {
                *cursor = SourceCursor::default();
                self.index.write().remove_source(id);
            }
            Modification::Invalidated(section) => {
                let count = section.index.as_usize().unwrap_or(0);
                cursor.known = count;
                cursor.next = cursor.next.min(count);
                self.index.write().remove_from(id, section.index);
            }
            Modification::Appended(section) => {
                cursor.known = cursor.known.max(section.end());
            }
        }
    }

    /// Read the next lines of every source into the index
    fn read_sources(&self, cursors: &mut [SourceCursor], token: &CancellationToken) -> usize {
        let mut processed = 0;
        for (position, (source, cursor)) in self.sources.iter().zip(cursors.iter_mut()).enumerate()
        {
            if token.is_cancelled() {
                break;
            }
            let Some(id) = SourceId::new(position) else {
                continue;
            };
            let end = cursor.known.min(cursor.next + LINES_PER_SOURCE_PER_PASS);
            if cursor.next >= end {
                continue;
            }

            let section = LogSourceSection::from_range(cursor.next..end);
            let rows = match source
                .get_entries_in(section, &[&columns::TIMESTAMP, &columns::LOG_ENTRY_INDEX])
            {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(source = position, "Failed to read rows {}: {}", section, err);
                    continue;
                }
            };

            let mut index = self.index.write();
            for (offset, row) in rows.iter().enumerate() {
                index.insert(
                    id,
                    LogLineIndex::from(cursor.next + offset),
                    row.log_entry_index(),
                    row.timestamp(),
                );
            }
            processed += rows.len();
            cursor.next = end;
        }
        processed
    }

    /// Tell listeners what the last batch changed
    fn notify(&self) {
        let (changes, count) = {
            let mut index = self.index.write();
            (index.take_changes(), index.len())
        };
        let listeners = self.core.listeners();
        match changes {
            IndexChanges::None => {}
            IndexChanges::Reset => listeners.reset(),
            IndexChanges::Changed {
                first_modified,
                previous_len,
            } => {
                if first_modified < previous_len {
                    listeners.invalidate(first_modified, previous_len - first_modified);
                }
            }
        }
        listeners.on_read_count(count);
    }

    /// Recompute the aggregate properties
    fn update_properties(&self, cursors: &[SourceCursor]) {
        let mut merged = PropertiesBuffer::minimum();
        let mut start = None;
        let mut end = None;
        let mut last_modified = None;
        let mut created = None;
        let mut size: Option<u64> = None;
        let mut max_characters = 0;
        let mut progress = 0.0;
        let mut empty_reasons = Vec::new();

        for (source, cursor) in self.sources.iter().zip(cursors) {
            let mut buffer = PropertiesBuffer::minimum();
            source.get_all_properties(&mut buffer);

            let timestamp = |property: Property| buffer.value(property).as_timestamp();
            start = min_option(start, timestamp(&properties::START_TIMESTAMP));
            end = max_option(end, timestamp(&properties::END_TIMESTAMP));
            last_modified = max_option(last_modified, timestamp(&properties::LAST_MODIFIED));
            created = min_option(created, timestamp(&properties::CREATED));
            if let Some(source_size) = buffer.value(&properties::SIZE).as_size() {
                size = Some(size.unwrap_or(0) + source_size);
            }
            max_characters = max_characters.max(
                buffer
                    .value(&properties::MAX_CHARACTERS_PER_LINE)
                    .as_integer()
                    .unwrap_or(0),
            );

            let read = if cursor.known == 0 {
                1.0
            } else {
                cursor.next as f64 / cursor.known as f64
            };
            progress += read
                * buffer
                    .value(&properties::PERCENTAGE_PROCESSED)
                    .as_percentage()
                    .unwrap_or(0.0);
            empty_reasons.push(buffer.value(&properties::EMPTY_REASON).as_empty_reason());
        }

        if !self.sources.is_empty() {
            progress /= self.sources.len() as f64;
        } else {
            progress = 1.0;
        }
        // Only empty when every source is
        let empty_reason = if empty_reasons.iter().all(Option::is_some) {
            empty_reasons.into_iter().flatten().next()
        } else {
            None
        };
        let entry_count = self.index.read().entry_count();

        merged.set(&properties::START_TIMESTAMP, Value::Timestamp(start));
        merged.set(&properties::END_TIMESTAMP, Value::Timestamp(end));
        merged.set(
            &properties::DURATION,
            Value::TimeSpan(start.zip(end).map(|(start, end)| end - start)),
        );
        merged.set(&properties::LAST_MODIFIED, Value::Timestamp(last_modified));
        merged.set(&properties::CREATED, Value::Timestamp(created));
        merged.set(&properties::SIZE, Value::Size(size));
        merged.set(
            &properties::MAX_CHARACTERS_PER_LINE,
            Value::Integer(max_characters),
        );
        merged.set(
            &properties::PERCENTAGE_PROCESSED,
            Value::Percentage(progress.clamp(0.0, 1.0)),
        );
        merged.set(&properties::EMPTY_REASON, Value::EmptyReason(empty_reason));
        merged.set(&properties::LOG_ENTRY_COUNT, Value::Integer(entry_count as i64));

        *self.properties.write() = merged;
    }

    /// Read `column` from the sources, one request per source
    fn get_forwarded(
        &self,
        indices: &[LogLineIndex],
        column: Column,
        destination: &mut [Value],
    ) -> Result<()> {
        let mut groups: Vec<Vec<(usize, LogLineIndex)>> = vec![Vec::new(); self.sources.len()];
        {
            let index = self.index.read();
            for (position, i) in indices.iter().enumerate() {
                destination[position] = column.default_value();
                let Some(line) = i.as_usize().and_then(|p| index.get(p)) else {
                    continue;
                };
                if let Some(group) = line.source_id.index().and_then(|s| groups.get_mut(s)) {
                    group.push((position, line.source_line));
                }
            }
        }

        for (source, group) in self.sources.iter().zip(&groups) {
            if group.is_empty() || !source.columns().contains(&column) {
                continue;
            }
            let lines: Vec<LogLineIndex> = group.iter().map(|(_, line)| *line).collect();
            let mut values = vec![column.default_value(); lines.len()];
            source.get_column(&lines, column, &mut values)?;
            for ((position, _), value) in group.iter().zip(values) {
                destination[*position] = value;
            }
        }
        Ok(())
    }
}

fn min_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_option<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl RunOnce for MergedLogSource {
    fn run_once(&self, token: &CancellationToken) -> Duration {
        let mut cursors = self.cursors.lock();
        for (key, modification) in self.pending.drain() {
            self.apply(&mut cursors, key, modification);
        }

        let processed = self.read_sources(&mut cursors, token);
        self.notify();
        self.update_properties(&cursors);

        let caught_up = cursors.iter().all(|cursor| cursor.next >= cursor.known)
            && self.pending.is_empty();
        let sources_done = self
            .sources
            .iter()
            .all(|source| source.end_of_source_reached());
        if caught_up && sources_done {
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

impl LogSource for MergedLogSource {
    fn key(&self) -> StageKey {
        self.core.key()
    }

    fn columns(&self) -> Vec<Column> {
        combine_with_minimum(self.sources.iter().flat_map(|source| source.columns()))
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
        self.properties.read().properties()
    }

    fn get_property(&self, property: Property) -> Result<Value> {
        self.properties
            .read()
            .get(property)
            .cloned()
            .ok_or(LogSourceError::NoSuchProperty(property.id()))
    }

    fn get_all_properties(&self, destination: &mut PropertiesBuffer) {
        self.properties.read().copy_all_to(destination);
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

        let derived_here = [
            &columns::LOG_ENTRY_INDEX,
            &columns::SOURCE_ID,
            &columns::TIMESTAMP,
            &columns::DELTA_TIME,
            &columns::ELAPSED_TIME,
        ];
        if column != &columns::INDEX
            && column != &columns::ORIGINAL_INDEX
            && column != &columns::LINE_NUMBER
            && !derived_here.contains(&column)
        {
            return self.get_forwarded(indices, column, destination);
        }

        let start = self
            .properties
            .read()
            .value(&properties::START_TIMESTAMP)
            .as_timestamp();
        let index = self.index.read();
        // The merged sequence is the original one; SourceId and OriginalLineNumber locate a
        // row within its file
        if column == &columns::INDEX
            || column == &columns::ORIGINAL_INDEX
            || column == &columns::LINE_NUMBER
        {
            derived::fill_positional(column, indices, index.len(), destination);
            return Ok(());
        }

        let line_at = |i: LogLineIndex| i.as_usize().and_then(|p| index.get(p));
        let timestamp_at = |i: LogLineIndex| line_at(i).map(|line| line.timestamp);
        for (slot, i) in destination.iter_mut().zip(indices) {
            let value = if column == &columns::LOG_ENTRY_INDEX {
                line_at(*i).map(|line| Value::EntryIndex(line.merged_entry))
            } else if column == &columns::SOURCE_ID {
                line_at(*i).map(|line| Value::SourceId(line.source_id))
            } else if column == &columns::TIMESTAMP {
                line_at(*i).map(|line| Value::Timestamp(Some(line.timestamp)))
            } else if column == &columns::DELTA_TIME {
                Some(derived::delta(timestamp_at(i.offset(-1)), timestamp_at(*i)))
            } else {
                Some(derived::elapsed(start, timestamp_at(*i)))
            };
            *slot = value.unwrap_or_else(|| column.default_value());
        }
        Ok(())
    }

    fn count(&self) -> usize {
        self.index.read().len()
    }

    fn end_of_source_reached(&self) -> bool {
        self.core.end_of_source_reached()
    }

    fn upstream(&self) -> Vec<Arc<dyn LogSource>> {
        self.sources.clone()
    }

    fn dispose(&self) {
        if self.core.dispose() {
            let listener = self.pending.listener();
            for source in &self.sources {
                source.remove_listener(&listener);
            }
            *self.index.write() = MergedLogSourceIndex::new();
        }
    }
}

impl Drop for MergedLogSource {
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
    use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
    use pretty_assertions::assert_eq;
    use tailpipe_types::LogEntry;

    fn at(second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, second)
            .unwrap()
    }

    fn line(text: &str, second: Option<u32>) -> LogEntry {
        LogEntry::new()
            .with(&columns::RAW_CONTENT, Value::Text(Some(text.to_string())))
            .with(&columns::TIMESTAMP, Value::Timestamp(second.map(at)))
    }

    fn merge(
        scheduler: &Arc<ManualTaskScheduler>,
        sources: &[&Arc<InMemoryLogSource>],
    ) -> Arc<MergedLogSource> {
        let sources = sources
            .iter()
            .map(|source| Arc::clone(*source) as Arc<dyn LogSource>)
            .collect();
        MergedLogSource::new(scheduler.clone(), sources, StageOptions::default()).unwrap()
    }

    fn contents(source: &dyn LogSource) -> Vec<String> {
        source
            .get_column_in(LogSourceSection::new(0, source.count()), &columns::RAW_CONTENT)
            .unwrap()
            .into_iter()
            .map(|v| v.into_text().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_merges_by_timestamp() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        let b = Arc::new(InMemoryLogSource::new());
        a.add(&line("1", Some(1)));
        a.add(&line("3", Some(3)));
        b.add(&line("2", Some(2)));
        let merged = merge(&scheduler, &[&a, &b]);

        scheduler.run_once();
        assert_eq!(contents(merged.as_ref()), vec!["1", "2", "3"]);

        let ids = merged
            .get_column_in(LogSourceSection::new(0, 3), &columns::SOURCE_ID)
            .unwrap();
        let ids: Vec<_> = ids.iter().map(|v| v.as_source_id().and_then(|id| id.index())).collect();
        assert_eq!(ids, vec![Some(0), Some(1), Some(0)]);

        let original = merged
            .get_column_in(LogSourceSection::new(0, 3), &columns::ORIGINAL_INDEX)
            .unwrap();
        assert_eq!(
            original,
            vec![
                Value::LineIndex(LogLineIndex::new(0)),
                Value::LineIndex(LogLineIndex::new(1)),
                Value::LineIndex(LogLineIndex::new(2)),
            ]
        );
        let line_numbers = merged
            .get_column_in(LogSourceSection::new(0, 3), &columns::ORIGINAL_LINE_NUMBER)
            .unwrap();
        assert_eq!(
            line_numbers,
            vec![Value::Integer(1), Value::Integer(1), Value::Integer(2)]
        );
        assert!(merged.end_of_source_reached());
    }

    #[test]
    fn test_duplicate_source_is_rejected() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        let b = Arc::new(InMemoryLogSource::new());
        let sources: Vec<Arc<dyn LogSource>> = vec![a.clone(), b, a];

        assert!(matches!(
            MergedLogSource::new(scheduler, sources, StageOptions::default()),
            Err(LogSourceError::DuplicateSource {
                first: 0,
                duplicate: 2
            })
        ));
    }

    #[test]
    fn test_drops_lines_without_timestamp() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        a.add(&line("kept", Some(1)));
        a.add(&line("dropped", None));
        let merged = merge(&scheduler, &[&a]);

        scheduler.run_once();
        assert_eq!(contents(merged.as_ref()), vec!["kept"]);
    }

    #[test]
    fn test_late_line_invalidates_tail() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        let b = Arc::new(InMemoryLogSource::new());
        a.add(&line("1", Some(1)));
        a.add(&line("3", Some(3)));
        let merged = merge(&scheduler, &[&a, &b]);
        let listener = RecordingListener::new();
        merged.add_listener(listener.clone(), Duration::ZERO, 100);
        scheduler.run_once();

        b.add(&line("2", Some(2)));
        scheduler.run_once();

        assert_eq!(contents(merged.as_ref()), vec!["1", "2", "3"]);
        assert_eq!(
            listener.modifications(),
            vec![
                Modification::Reset,
                Modification::appended(0, 2),
                Modification::invalidated(1, 1),
                Modification::appended(1, 2)
            ]
        );
    }

    #[test]
    fn test_source_reset() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        a.add(&line("1", Some(1)));
        let merged = merge(&scheduler, &[&a]);
        let listener = RecordingListener::new();
        merged.add_listener(listener.clone(), Duration::ZERO, 100);
        scheduler.run_once();

        a.clear();
        scheduler.run_once();
        assert_eq!(merged.count(), 0);
        assert_eq!(listener.modifications().last(), Some(&Modification::Reset));
    }

    #[test]
    fn test_derived_columns() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        let b = Arc::new(InMemoryLogSource::new());
        a.add(&line("a", Some(10)));
        b.add(&line("b", Some(14)));
        let merged = merge(&scheduler, &[&a, &b]);
        scheduler.run_once();

        let deltas = merged
            .get_column_in(LogSourceSection::new(0, 2), &columns::DELTA_TIME)
            .unwrap();
        assert_eq!(
            deltas,
            vec![Value::TimeSpan(None), Value::TimeSpan(Some(TimeDelta::seconds(4)))]
        );
        let elapsed = merged
            .get_column_in(LogSourceSection::new(1, 1), &columns::ELAPSED_TIME)
            .unwrap();
        assert_eq!(elapsed, vec![Value::TimeSpan(Some(TimeDelta::seconds(4)))]);

        let entries = merged
            .get_column_in(LogSourceSection::new(0, 2), &columns::LOG_ENTRY_INDEX)
            .unwrap();
        assert_eq!(
            entries,
            vec![
                Value::EntryIndex(tailpipe_types::LogEntryIndex::new(0)),
                Value::EntryIndex(tailpipe_types::LogEntryIndex::new(1)),
            ]
        );
    }

    #[test]
    fn test_aggregate_properties() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        let b = Arc::new(InMemoryLogSource::new());
        a.add(&line("a", Some(5)));
        b.add(&line("b", Some(2)));
        b.add(&line("b", Some(20)));
        a.set_property(&properties::SIZE, Value::Size(Some(100)));
        b.set_property(&properties::SIZE, Value::Size(Some(50)));
        let merged = merge(&scheduler, &[&a, &b]);
        scheduler.run_once();

        assert_eq!(
            merged.property_or_default(&properties::START_TIMESTAMP),
            Value::Timestamp(Some(at(2)))
        );
        assert_eq!(
            merged.property_or_default(&properties::END_TIMESTAMP),
            Value::Timestamp(Some(at(20)))
        );
        assert_eq!(
            merged.property_or_default(&properties::DURATION),
            Value::TimeSpan(Some(TimeDelta::seconds(18)))
        );
        assert_eq!(
            merged.property_or_default(&properties::SIZE),
            Value::Size(Some(150))
        );
        assert_eq!(
            merged.property_or_default(&properties::PERCENTAGE_PROCESSED),
            Value::Percentage(1.0)
        );
    }

    #[test]
    fn test_too_many_sources() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let sources: Vec<Arc<dyn LogSource>> = (0..256)
            .map(|_| Arc::new(InMemoryLogSource::new()) as Arc<dyn LogSource>)
            .collect();
        let result = MergedLogSource::new(scheduler, sources, StageOptions::default());
        assert!(matches!(
            result,
            Err(LogSourceError::TooManySources {
                requested: 256,
                max: 255
            })
        ));
    }

    #[test]
    fn test_out_of_range_reads_default() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let a = Arc::new(InMemoryLogSource::new());
        a.add(&line("a", Some(1)));
        let merged = merge(&scheduler, &[&a]);
        scheduler.run_once();

        let indices = [LogLineIndex::new(3), LogLineIndex::INVALID];
        for column in columns::MINIMUM {
            let mut values = vec![Value::Integer(9); 2];
            merged.get_column(&indices, column, &mut values).unwrap();
            assert_eq!(values, vec![column.default_value(); 2], "{column}");
        }
    }
}
