//! Typed per-column storage.
//!
//! The variant is picked from the descriptor's data type once, when a buffer is created for a
//! column; every later access goes straight to the typed vector.

use std::ops::Range;

use chrono::{NaiveDateTime, TimeDelta};
use tailpipe_types::{
    Column, DataType, EmptyReason, LogEntryIndex, LogLevel, LogLineIndex, SourceId, Value,
};

macro_rules! column_data {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        /// Values of one column, stored as a vector of the column's native type
        #[derive(Clone, Debug)]
        pub(crate) enum ColumnData {
            $($variant(Vec<$ty>)),*
        }

        impl ColumnData {
            fn empty(data_type: DataType) -> Self {
                match data_type {
                    $(DataType::$variant => Self::$variant(Vec::new())),*
                }
            }

            pub(crate) fn len(&self) -> usize {
                match self {
                    $(Self::$variant(values) => values.len()),*
                }
            }

            pub(crate) fn get(&self, index: usize) -> Option<Value> {
                match self {
                    $(Self::$variant(values) => values.get(index).cloned().map(Value::$variant)),*
                }
            }

            /// Returns the value back when its type doesn't match
            fn try_set(&mut self, index: usize, value: Value) -> Result<(), Value> {
                match (self, value) {
                    $((Self::$variant(values), Value::$variant(value)) => {
                        if let Some(slot) = values.get_mut(index) {
                            *slot = value;
                        }
                        Ok(())
                    })*
                    (_, value) => Err(value),
                }
            }

            fn try_insert(&mut self, index: usize, value: Value) -> Result<(), Value> {
                match (self, value) {
                    $((Self::$variant(values), Value::$variant(value)) => {
                        values.insert(index, value);
                        Ok(())
                    })*
                    (_, value) => Err(value),
                }
            }

            fn remove_range(&mut self, range: Range<usize>) {
                match self {
                    $(Self::$variant(values) => {
                        values.drain(range);
                    }),*
                }
            }

            fn truncate(&mut self, len: usize) {
                match self {
                    $(Self::$variant(values) => values.truncate(len)),*
                }
            }

            fn clear(&mut self) {
                match self {
                    $(Self::$variant(values) => values.clear()),*
                }
            }

            fn resize(&mut self, len: usize, fill: &Value) {
                match (self, fill) {
                    $((Self::$variant(values), Value::$variant(fill)) => {
                        values.resize(len, fill.clone());
                    })*
                    _ => {}
                }
            }
        }
    };
}

column_data! {
    LineIndex => LogLineIndex,
    EntryIndex => LogEntryIndex,
    SourceId => SourceId,
    Level => LogLevel,
    Text => Option<String>,
    Timestamp => Option<NaiveDateTime>,
    TimeSpan => Option<TimeDelta>,
    Integer => i64,
    Size => Option<u64>,
    Percentage => f64,
    EmptyReason => Option<EmptyReason>,
}

/// A column descriptor paired with its storage
#[derive(Clone, Debug)]
pub(crate) struct ColumnStore {
    pub(crate) column: Column,
    data: ColumnData,
}

impl ColumnStore {
    pub(crate) fn new(column: Column) -> Self {
        Self {
            column,
            data: ColumnData::empty(column.data_type()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<Value> {
        self.data.get(index)
    }

    /// Value at `index`, the column default when out of range
    pub(crate) fn value(&self, index: usize) -> Value {
        self.get(index)
            .unwrap_or_else(|| self.column.default_value())
    }

    pub(crate) fn set(&mut self, index: usize, value: Value) {
        if let Err(value) = self.data.try_set(index, value) {
            self.mismatch(&value);
            let default = self.column.default_value();
            let _ = self.data.try_set(index, default);
        }
    }

    pub(crate) fn push(&mut self, value: Value) {
        let len = self.len();
        self.insert(len, value);
    }

    pub(crate) fn insert(&mut self, index: usize, value: Value) {
        if let Err(value) = self.data.try_insert(index, value) {
            self.mismatch(&value);
            let default = self.column.default_value();
            let _ = self.data.try_insert(index, default);
        }
    }

    pub(crate) fn remove_range(&mut self, range: Range<usize>) {
        self.data.remove_range(range);
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
    }

    /// Grow with default values or shrink to `len`
    pub(crate) fn resize(&mut self, len: usize) {
        let default = self.column.default_value();
        self.data.resize(len, &default);
    }

    pub(crate) fn fill_default(&mut self, range: Range<usize>) {
        for index in range {
            self.set(index, self.column.default_value());
        }
    }

    fn mismatch(&self, value: &Value) {
        tracing::error!(
            column = self.column.id(),
            expected = ?self.column.data_type(),
            actual = ?value.data_type(),
            "Value doesn't match the column type, storing the default instead"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tailpipe_types::columns::{LOG_LEVEL, RAW_CONTENT};

    #[test]
    fn test_typed_storage() {
        let mut store = ColumnStore::new(&RAW_CONTENT);
        store.push(Value::Text(Some("a".into())));
        store.push(Value::Text(Some("c".into())));
        store.insert(1, Value::Text(Some("b".into())));

        assert_eq!(store.len(), 3);
        assert_eq!(store.value(1).as_text(), Some("b"));
        assert_eq!(store.value(10), Value::Text(None));
    }

    #[test]
    fn test_mismatch_stores_default() {
        let mut store = ColumnStore::new(&LOG_LEVEL);
        store.push(Value::Integer(3));
        assert_eq!(store.value(0), Value::Level(LogLevel::None));
    }

    #[test]
    fn test_resize_fills_defaults() {
        let mut store = ColumnStore::new(&LOG_LEVEL);
        store.push(Value::Level(LogLevel::Info));
        store.resize(3);
        assert_eq!(store.value(2), Value::Level(LogLevel::None));
        store.resize(1);
        assert_eq!(store.len(), 1);
    }
}
