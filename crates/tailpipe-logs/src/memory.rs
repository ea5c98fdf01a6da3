use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use tailpipe_types::columns::{self, combine_with_minimum};
use tailpipe_types::properties::{self, PropertiesBuffer};
use tailpipe_types::{Column, LogEntryIndex, LogLineIndex, Property, ReadOnlyLogEntry, Value};

use crate::buffer::LogBufferList;
use crate::derived;
use crate::error::{LogSourceError, Result, ensure_capacity};
use crate::listener::{LogSourceListener, LogSourceListenerCollection, StageKey};
use crate::source::LogSource;

/// A log source whose content is set directly by its owner.
///
/// Changes are announced to listeners synchronously; there is no periodic task.
pub struct InMemoryLogSource {
    key: StageKey,
    listeners: LogSourceListenerCollection,
    rows: RwLock<LogBufferList>,
    properties: RwLock<PropertiesBuffer>,
    end_of_source_reached: RwLock<bool>,
}

impl InMemoryLogSource {
    /// Source storing the minimum column set
    pub fn new() -> Self {
        Self::with_columns(columns::MINIMUM)
    }

    /// Source storing the minimum column set plus `additional`
    pub fn with_columns(additional: impl IntoIterator<Item = Column>) -> Self {
        let key = StageKey::next();
        let mut properties = PropertiesBuffer::minimum();
        properties.set(&properties::PERCENTAGE_PROCESSED, Value::Percentage(1.0));
        Self {
            key,
            listeners: LogSourceListenerCollection::new(key),
            rows: RwLock::new(LogBufferList::new(combine_with_minimum(additional))),
            properties: RwLock::new(properties),
            end_of_source_reached: RwLock::new(true),
        }
    }

    /// Append one entry; rows without an entry index form their own entry
    pub fn add(&self, entry: &dyn ReadOnlyLogEntry) {
        let count = {
            let mut rows = self.rows.write();
            let index = rows.len();
            rows.add(entry);
            if !entry.log_entry_index().is_valid() {
                rows.set_value(
                    &columns::LOG_ENTRY_INDEX,
                    index,
                    Value::EntryIndex(LogEntryIndex::from(index)),
                );
            }
            self.include_in_properties(entry, rows.len());
            rows.len()
        };
        self.listeners.on_read_count(count);
    }

    /// Drop every row from `index` onward
    pub fn remove_from(&self, index: usize) {
        let removed = {
            let mut rows = self.rows.write();
            let removed = rows.len().saturating_sub(index);
            rows.truncate(index);
            self.update_properties(&rows);
            removed
        };
        if removed > 0 {
            self.listeners.invalidate(index, removed);
        }
    }

    pub fn clear(&self) {
        {
            let mut rows = self.rows.write();
            rows.clear();
            self.update_properties(&rows);
        }
        self.listeners.reset();
    }

    pub fn set_end_of_source_reached(&self, reached: bool) {
        if reached {
            self.listeners.flush();
        }
        *self.end_of_source_reached.write() = reached;
    }

    pub fn set_property(&self, property: Property, value: Value) {
        self.properties.write().set(property, value);
    }

    /// Widen the summary properties by one freshly added row
    fn include_in_properties(&self, entry: &dyn ReadOnlyLogEntry, count: usize) {
        let mut properties = self.properties.write();
        let mut start = properties.value(&properties::START_TIMESTAMP).as_timestamp();
        let mut end = properties.value(&properties::END_TIMESTAMP).as_timestamp();
        if let Some(timestamp) = entry.timestamp() {
            start = Some(start.map_or(timestamp, |start| start.min(timestamp)));
            end = Some(end.map_or(timestamp, |end| end.max(timestamp)));
        }
        let longest = properties
            .value(&properties::MAX_CHARACTERS_PER_LINE)
            .as_integer()
            .unwrap_or(0)
            .max(entry.raw_content().map_or(0, |c| c.chars().count()) as i64);
        write_properties(&mut properties, start, end, count, longest);
    }

    /// Summarize every stored row again, after rows were removed
    fn update_properties(&self, rows: &LogBufferList) {
        let timestamps: Vec<_> = rows.iter().filter_map(|row| row.timestamp()).collect();
        let longest = rows
            .iter()
            .map(|row| row.raw_content().map_or(0, |c| c.chars().count()))
            .max()
            .unwrap_or(0);
        write_properties(
            &mut self.properties.write(),
            timestamps.iter().min().copied(),
            timestamps.iter().max().copied(),
            rows.len(),
            longest as i64,
        );
    }
}

fn write_properties(
    properties: &mut PropertiesBuffer,
    start: Option<NaiveDateTime>,
    end: Option<NaiveDateTime>,
    count: usize,
    longest: i64,
) {
    properties.set(&properties::START_TIMESTAMP, Value::Timestamp(start));
    properties.set(&properties::END_TIMESTAMP, Value::Timestamp(end));
    properties.set(
        &properties::DURATION,
        Value::TimeSpan(start.zip(end).map(|(start, end)| end - start)),
    );
    properties.set(&properties::LOG_ENTRY_COUNT, Value::Integer(count as i64));
    properties.set(&properties::MAX_CHARACTERS_PER_LINE, Value::Integer(longest));
}

impl Default for InMemoryLogSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSource for InMemoryLogSource {
    fn key(&self) -> StageKey {
        self.key
    }

    fn columns(&self) -> Vec<Column> {
        self.rows.read().columns()
    }

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        max_line_count: usize,
    ) {
        self.listeners
            .add_listener(listener, max_wait, max_line_count);
    }

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) {
        self.listeners.remove_listener(listener);
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
        let rows = self.rows.read();
        if !rows.contains(column) {
            return Err(LogSourceError::NoSuchColumn(column.id()));
        }

        let count = rows.len();
        if derived::fill_positional(column, indices, count, destination) {
            return Ok(());
        }
        if column == &columns::DELTA_TIME || column == &columns::ELAPSED_TIME {
            let timestamp = |index: LogLineIndex| {
                index
                    .as_usize()
                    .filter(|i| *i < count)
                    .and_then(|i| rows.value(&columns::TIMESTAMP, i).as_timestamp())
            };
            let start = self
                .properties
                .read()
                .value(&properties::START_TIMESTAMP)
                .as_timestamp();
            for (slot, index) in destination.iter_mut().zip(indices) {
                *slot = if column == &columns::DELTA_TIME {
                    derived::delta(timestamp(index.offset(-1)), timestamp(*index))
                } else {
                    derived::elapsed(start, timestamp(*index))
                };
            }
            return Ok(());
        }

        rows.copy_to(column, indices, destination);
        Ok(())
    }

    fn count(&self) -> usize {
        self.rows.read().len()
    }

    fn end_of_source_reached(&self) -> bool {
        *self.end_of_source_reached.read()
    }

    fn dispose(&self) {
        self.listeners.clear();
    }
}
