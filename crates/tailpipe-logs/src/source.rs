//! The contract every stage implements

use std::sync::Arc;
use std::time::Duration;

use tailpipe_types::{
    Column, LogEntry, LogLineIndex, LogSourceSection, PropertiesBuffer, Property, Value,
};

use crate::buffer::LogBufferArray;
use crate::error::{LogSourceError, Result};
use crate::listener::{LogSourceListener, StageKey};

/// A source of log rows that notifies listeners as its content changes
pub trait LogSource: Send + Sync {
    /// Identity used when notifying listeners
    fn key(&self) -> StageKey;

    /// Columns this source can answer for
    fn columns(&self) -> Vec<Column>;

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        max_line_count: usize,
    );

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>);

    fn properties(&self) -> Vec<Property>;

    /// Current value of `property`
    fn get_property(&self, property: Property) -> Result<Value>;

    /// Copy every property value into `destination`
    fn get_all_properties(&self, destination: &mut PropertiesBuffer);

    /// Read `column` for the given rows into `destination`.
    ///
    /// Rows that don't exist (yet) yield the column default.
    fn get_column(
        &self,
        indices: &[LogLineIndex],
        column: Column,
        destination: &mut [Value],
    ) -> Result<()>;

    /// Read every column of `destination` for the given rows, starting at
    /// `destination_index`; columns this source doesn't provide are default-filled
    fn get_entries(
        &self,
        indices: &[LogLineIndex],
        destination: &mut LogBufferArray,
        destination_index: usize,
    ) -> Result<()> {
        let available = destination.len().saturating_sub(destination_index);
        crate::error::ensure_capacity(indices.len(), available)?;

        let columns = self.columns();
        for column in destination.columns() {
            if columns.contains(&column) {
                if let Some(slots) = destination.column_mut(column, destination_index) {
                    self.get_column(indices, column, slots)?;
                }
            } else {
                destination.fill_default(column, destination_index, indices.len());
            }
        }
        Ok(())
    }

    /// Number of rows currently exposed
    fn count(&self) -> usize;

    fn end_of_source_reached(&self) -> bool;

    /// Sources this one listens to
    fn upstream(&self) -> Vec<Arc<dyn LogSource>> {
        Vec::new()
    }

    /// Stop processing and release upstream registrations; safe to call repeatedly
    fn dispose(&self);
}

/// Convenience reads on top of [`LogSource`]
pub trait LogSourceExt: LogSource {
    /// Read `column` for a contiguous section
    fn get_column_in(&self, section: LogSourceSection, column: Column) -> Result<Vec<Value>> {
        let indices = section.indices();
        let mut values = vec![column.default_value(); indices.len()];
        self.get_column(&indices, column, &mut values)?;
        Ok(values)
    }

    /// Read the given columns for a contiguous section
    fn get_entries_in(
        &self,
        section: LogSourceSection,
        columns: &[Column],
    ) -> Result<LogBufferArray> {
        let indices = section.indices();
        let mut array = LogBufferArray::new(indices.len(), columns.iter().copied());
        self.get_entries(&indices, &mut array, 0)?;
        Ok(array)
    }

    /// Read every column of a single row
    fn get_entry(&self, index: LogLineIndex) -> Result<LogEntry> {
        let mut entry = LogEntry::new();
        for column in self.columns() {
            let mut value = [column.default_value()];
            self.get_column(&[index], column, &mut value)?;
            let [value] = value;
            entry.set_value(column, value);
        }
        Ok(entry)
    }

    /// Typed read of a property, the default when the source doesn't have it
    fn property_or_default(&self, property: Property) -> Value {
        self.get_property(property)
            .unwrap_or_else(|_| property.default_value())
    }
}

impl<T: LogSource + ?Sized> LogSourceExt for T {}

/// True when `source` is `target` or transitively listens to it
pub fn depends_on(source: &dyn LogSource, target: StageKey) -> bool {
    if source.key() == target {
        return true;
    }
    source
        .upstream()
        .iter()
        .any(|upstream| depends_on(upstream.as_ref(), target))
}

/// Fails with [`LogSourceError::Cycle`] if `source` depends on `target`
pub fn ensure_acyclic(source: &dyn LogSource, target: StageKey) -> Result<()> {
    if depends_on(source, target) {
        return Err(LogSourceError::Cycle);
    }
    Ok(())
}

/// Map indices onto `0..count`, turning everything else into `INVALID`
pub(crate) fn clamp_indices(indices: &[LogLineIndex], count: usize) -> Vec<LogLineIndex> {
    indices
        .iter()
        .map(|index| match index.as_usize() {
            Some(position) if position < count => *index,
            _ => LogLineIndex::INVALID,
        })
        .collect()
}
