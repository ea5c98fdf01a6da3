use chrono::{NaiveDateTime, TimeDelta};

use crate::columns::{self, Column};
use crate::{LogEntryIndex, LogLevel, LogLineIndex, SourceId, Value};

/// Read access to the values of one log entry
pub trait ReadOnlyLogEntry {
    /// Columns this entry carries values for
    fn columns(&self) -> Vec<Column>;

    /// Value of `column`, `None` when the entry doesn't carry it
    fn try_get_value(&self, column: Column) -> Option<Value>;

    /// Value of `column`, falling back to the column default
    fn get_value(&self, column: Column) -> Value {
        self.try_get_value(column)
            .unwrap_or_else(|| column.default_value())
    }

    fn raw_content(&self) -> Option<String> {
        self.get_value(&columns::RAW_CONTENT).into_text()
    }

    fn index(&self) -> LogLineIndex {
        self.get_value(&columns::INDEX)
            .as_line_index()
            .unwrap_or(LogLineIndex::INVALID)
    }

    fn original_index(&self) -> LogLineIndex {
        self.get_value(&columns::ORIGINAL_INDEX)
            .as_line_index()
            .unwrap_or(LogLineIndex::INVALID)
    }

    fn log_entry_index(&self) -> LogEntryIndex {
        self.get_value(&columns::LOG_ENTRY_INDEX)
            .as_entry_index()
            .unwrap_or(LogEntryIndex::INVALID)
    }

    fn line_number(&self) -> i64 {
        self.get_value(&columns::LINE_NUMBER)
            .as_integer()
            .unwrap_or(0)
    }

    fn source_id(&self) -> SourceId {
        self.get_value(&columns::SOURCE_ID)
            .as_source_id()
            .unwrap_or(SourceId::INVALID)
    }

    fn log_level(&self) -> LogLevel {
        self.get_value(&columns::LOG_LEVEL)
            .as_level()
            .unwrap_or_default()
    }

    fn timestamp(&self) -> Option<NaiveDateTime> {
        self.get_value(&columns::TIMESTAMP).as_timestamp()
    }

    fn elapsed_time(&self) -> Option<TimeDelta> {
        self.get_value(&columns::ELAPSED_TIME).as_time_span()
    }

    fn delta_time(&self) -> Option<TimeDelta> {
        self.get_value(&columns::DELTA_TIME).as_time_span()
    }
}

/// A standalone entry owning its values
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogEntry {
    values: Vec<(Column, Value)>,
}

impl LogEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry with every given column at its default value
    pub fn with_columns(columns: impl IntoIterator<Item = Column>) -> Self {
        let mut entry = Self::new();
        for column in columns {
            entry.set_value(column, column.default_value());
        }
        entry
    }

    /// Copy every value of `other` into a new owned entry
    pub fn copy_of(other: &dyn ReadOnlyLogEntry) -> Self {
        let mut entry = Self::new();
        for column in other.columns() {
            entry.set_value(column, other.get_value(column));
        }
        entry
    }

    /// Builder-style setter
    pub fn with(mut self, column: Column, value: Value) -> Self {
        self.set_value(column, value);
        self
    }

    /// Store `value`; values of the wrong type are replaced by the column default
    pub fn set_value(&mut self, column: Column, value: Value) {
        let value = if column.accepts(&value) {
            value
        } else {
            column.default_value()
        };
        match self.values.iter_mut().find(|(c, _)| *c == column) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((column, value)),
        }
    }
}

impl ReadOnlyLogEntry for LogEntry {
    fn columns(&self) -> Vec<Column> {
        self.values.iter().map(|(c, _)| *c).collect()
    }

    fn try_get_value(&self, column: Column) -> Option<Value> {
        self.values
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{INDEX, LOG_LEVEL, RAW_CONTENT, TIMESTAMP};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_typed_accessors() {
        let entry = LogEntry::new()
            .with(&RAW_CONTENT, Value::Text(Some("hello".into())))
            .with(&LOG_LEVEL, Value::Level(LogLevel::Warn))
            .with(&INDEX, Value::LineIndex(LogLineIndex::new(3)));

        assert_eq!(entry.raw_content().as_deref(), Some("hello"));
        assert_eq!(entry.log_level(), LogLevel::Warn);
        assert_eq!(entry.index(), LogLineIndex::new(3));
        assert_eq!(entry.timestamp(), None);
        assert_eq!(entry.try_get_value(&TIMESTAMP), None);
    }

    #[test]
    fn test_wrong_type_falls_back_to_default() {
        let mut entry = LogEntry::with_columns([&LOG_LEVEL]);
        entry.set_value(&LOG_LEVEL, Value::Integer(5));
        assert_eq!(entry.log_level(), LogLevel::None);
        assert_eq!(entry.columns().len(), 1);
    }
}
