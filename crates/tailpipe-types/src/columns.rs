//! Column descriptors
//!
//! Columns are `'static` singletons: stages, buffers and consumers all refer to the same
//! descriptor instance, and two descriptors are the same column when their ids match.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::{DataType, LogEntryIndex, LogLevel, LogLineIndex, SourceId, Value};

/// Shared handle to a column descriptor
pub type Column = &'static ColumnDescriptor;

/// Describes one column of a log source
pub struct ColumnDescriptor {
    id: &'static str,
    display_name: &'static str,
    default: Value,
}

impl ColumnDescriptor {
    pub const fn new(id: &'static str, display_name: &'static str, default: Value) -> Self {
        Self {
            id,
            display_name,
            default,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn display_name(&self) -> &'static str {
        self.display_name
    }

    pub fn data_type(&self) -> DataType {
        self.default.data_type()
    }

    /// Value reported for rows that don't exist or don't carry this column
    pub fn default_value(&self) -> Value {
        self.default.clone()
    }

    /// Check whether `value` may be stored in this column
    pub fn accepts(&self, value: &Value) -> bool {
        value.data_type() == self.data_type()
    }
}

impl PartialEq for ColumnDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ColumnDescriptor {}

impl Hash for ColumnDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ColumnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnDescriptor")
            .field("id", &self.id)
            .field("data_type", &self.data_type())
            .finish()
    }
}

impl fmt::Display for ColumnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id)
    }
}

// ============================================================================
// Well-known columns
// ============================================================================

/// The line exactly as it was read
pub static RAW_CONTENT: ColumnDescriptor =
    ColumnDescriptor::new("raw_content", "Raw Content", Value::Text(None));

/// Position of the row within the source that reports it
pub static INDEX: ColumnDescriptor =
    ColumnDescriptor::new("index", "Index", Value::LineIndex(LogLineIndex::INVALID));

/// Position of the row before any transformation
pub static ORIGINAL_INDEX: ColumnDescriptor = ColumnDescriptor::new(
    "original_index",
    "Original Index",
    Value::LineIndex(LogLineIndex::INVALID),
);

/// Logical entry the row belongs to
pub static LOG_ENTRY_INDEX: ColumnDescriptor = ColumnDescriptor::new(
    "log_entry_index",
    "Log Entry Index",
    Value::EntryIndex(LogEntryIndex::INVALID),
);

/// 1-based line number within the reporting source, 0 when the row doesn't exist
pub static LINE_NUMBER: ColumnDescriptor =
    ColumnDescriptor::new("line_number", "Line Number", Value::Integer(0));

/// 1-based line number within the original file
pub static ORIGINAL_LINE_NUMBER: ColumnDescriptor = ColumnDescriptor::new(
    "original_line_number",
    "Original Line Number",
    Value::Integer(0),
);

/// Which merged source the row came from
pub static SOURCE_ID: ColumnDescriptor =
    ColumnDescriptor::new("source_id", "Source", Value::SourceId(SourceId::INVALID));

pub static LOG_LEVEL: ColumnDescriptor =
    ColumnDescriptor::new("log_level", "Level", Value::Level(LogLevel::None));

pub static TIMESTAMP: ColumnDescriptor =
    ColumnDescriptor::new("timestamp", "Timestamp", Value::Timestamp(None));

/// Time since the first timestamp of the source
pub static ELAPSED_TIME: ColumnDescriptor =
    ColumnDescriptor::new("elapsed_time", "Elapsed", Value::TimeSpan(None));

/// Time since the previous row
pub static DELTA_TIME: ColumnDescriptor =
    ColumnDescriptor::new("delta_time", "Delta", Value::TimeSpan(None));

/// Columns every log source provides
pub static MINIMUM: [Column; 11] = [
    &INDEX,
    &ORIGINAL_INDEX,
    &LOG_ENTRY_INDEX,
    &LINE_NUMBER,
    &ORIGINAL_LINE_NUMBER,
    &SOURCE_ID,
    &RAW_CONTENT,
    &LOG_LEVEL,
    &TIMESTAMP,
    &ELAPSED_TIME,
    &DELTA_TIME,
];

/// The minimum set followed by any additional columns not already in it
pub fn combine_with_minimum(additional: impl IntoIterator<Item = Column>) -> Vec<Column> {
    let mut columns = MINIMUM.to_vec();
    for column in additional {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    columns
}
