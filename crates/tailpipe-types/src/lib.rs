//! Shared types for tailpipe
//!
//! This crate contains the data model used across the tailpipe crates: row and entry indices,
//! log levels, change notifications, cell values and the column/property descriptor registry.

use std::fmt;
use std::ops::Range;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

pub mod columns;
mod entry;
pub mod properties;

pub use columns::{Column, ColumnDescriptor};
pub use entry::{LogEntry, ReadOnlyLogEntry};
pub use properties::{PropertiesBuffer, Property, PropertyDescriptor};

// ============================================================================
// Indices
// ============================================================================

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        impl $name {
            /// Sentinel for "no such row"
            pub const INVALID: Self = Self(-1);

            pub const fn new(value: i64) -> Self {
                if value < 0 { Self::INVALID } else { Self(value) }
            }

            pub const fn value(self) -> i64 {
                self.0
            }

            pub const fn is_valid(self) -> bool {
                self.0 >= 0
            }

            /// Position as a usize, `None` for the invalid sentinel
            pub fn as_usize(self) -> Option<usize> {
                usize::try_from(self.0).ok()
            }

            /// Index shifted by `delta`, saturating to `INVALID` below zero
            pub fn offset(self, delta: i64) -> Self {
                if !self.is_valid() {
                    return Self::INVALID;
                }
                Self::new(self.0 + delta)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                i64::try_from(value).map(Self::new).unwrap_or(Self::INVALID)
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                Self::new(i64::from(value))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "#{}", self.0)
                } else {
                    f.write_str("#invalid")
                }
            }
        }
    };
}

index_type!(
    /// Position of a physical line within a log source
    LogLineIndex
);

index_type!(
    /// Position of a logical (possibly multi-line) entry within a log source
    LogEntryIndex
);

/// Identifies which merged source a row came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(u8);

impl SourceId {
    /// Rows which have not passed through a merge carry this id
    pub const INVALID: Self = Self(u8::MAX);

    /// Maximum number of sources a single merge can address
    pub const MAX_SOURCES: usize = u8::MAX as usize;

    /// Returns `None` once `index` no longer fits next to the sentinel
    pub fn new(index: usize) -> Option<Self> {
        u8::try_from(index)
            .ok()
            .filter(|id| *id != u8::MAX)
            .map(Self)
    }

    pub fn index(self) -> Option<usize> {
        (self != Self::INVALID).then_some(self.0 as usize)
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::INVALID
    }
}

// ============================================================================
// Log Levels
// ============================================================================

/// Severity detected on a log line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Nothing has been determined (yet)
    #[default]
    None,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    /// The line was inspected but carries no recognizable level
    Other,
}

impl LogLevel {
    /// Parse from a level keyword, case-insensitive
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" => Self::Trace,
            "debug" | "dbg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" => Self::Error,
            "fatal" | "critical" | "crit" | "panic" => Self::Fatal,
            "none" | "" => Self::None,
            _ => Self::Other,
        }
    }

    /// Short display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Other => "OTHER",
        }
    }

    /// True for levels that actually classify a line
    pub fn is_definite(&self) -> bool {
        !matches!(self, Self::None | Self::Other)
    }
}

// ============================================================================
// Change Notifications
// ============================================================================

/// A contiguous range of rows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogSourceSection {
    pub index: LogLineIndex,
    pub count: usize,
}

impl LogSourceSection {
    pub fn new(index: impl Into<LogLineIndex>, count: usize) -> Self {
        Self {
            index: index.into(),
            count,
        }
    }

    /// Section covering `[start, end)`
    pub fn from_range(range: Range<usize>) -> Self {
        Self::new(range.start, range.end.saturating_sub(range.start))
    }

    /// First row after this section
    pub fn end(&self) -> usize {
        self.index.as_usize().unwrap_or(0) + self.count
    }

    pub fn range(&self) -> Range<usize> {
        match self.index.as_usize() {
            Some(start) => start..start + self.count,
            None => 0..0,
        }
    }

    /// Every row index of this section, in order
    pub fn indices(&self) -> Vec<LogLineIndex> {
        self.range().map(LogLineIndex::from).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Display for LogSourceSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, +{}]", self.index, self.count)
    }
}

/// The incremental protocol every stage speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modification {
    /// Discard everything
    Reset,
    /// Rows from `section.index` onward are gone and will be re-derived
    Invalidated(LogSourceSection),
    /// New rows are available
    Appended(LogSourceSection),
}

impl Modification {
    pub fn appended(index: impl Into<LogLineIndex>, count: usize) -> Self {
        Self::Appended(LogSourceSection::new(index, count))
    }

    pub fn invalidated(index: impl Into<LogLineIndex>, count: usize) -> Self {
        Self::Invalidated(LogSourceSection::new(index, count))
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset)
    }

    pub fn is_invalidate(&self) -> bool {
        matches!(self, Self::Invalidated(_))
    }

    pub fn is_append(&self) -> bool {
        matches!(self, Self::Appended(_))
    }

    /// Section form: a reset is index -1 with count 0
    pub fn section(&self) -> LogSourceSection {
        match self {
            Self::Reset => LogSourceSection {
                index: LogLineIndex::INVALID,
                count: 0,
            },
            Self::Invalidated(section) | Self::Appended(section) => *section,
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// Why a source currently has no content
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmptyReason {
    SourceDoesNotExist,
    SourceCannotBeAccessed,
}

impl EmptyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceDoesNotExist => "source does not exist",
            Self::SourceCannotBeAccessed => "source cannot be accessed",
        }
    }
}

/// Type tag of a column or property; one per `Value` variant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    LineIndex,
    EntryIndex,
    SourceId,
    Level,
    Text,
    Timestamp,
    TimeSpan,
    Integer,
    Size,
    Percentage,
    EmptyReason,
}

/// A single cell or property value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    LineIndex(LogLineIndex),
    EntryIndex(LogEntryIndex),
    SourceId(SourceId),
    Level(LogLevel),
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
    TimeSpan(Option<TimeDelta>),
    Integer(i64),
    /// Size in bytes
    Size(Option<u64>),
    /// Fraction in [0, 1]
    Percentage(f64),
    EmptyReason(Option<EmptyReason>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::LineIndex(_) => DataType::LineIndex,
            Self::EntryIndex(_) => DataType::EntryIndex,
            Self::SourceId(_) => DataType::SourceId,
            Self::Level(_) => DataType::Level,
            Self::Text(_) => DataType::Text,
            Self::Timestamp(_) => DataType::Timestamp,
            Self::TimeSpan(_) => DataType::TimeSpan,
            Self::Integer(_) => DataType::Integer,
            Self::Size(_) => DataType::Size,
            Self::Percentage(_) => DataType::Percentage,
            Self::EmptyReason(_) => DataType::EmptyReason,
        }
    }

    pub fn as_line_index(&self) -> Option<LogLineIndex> {
        match self {
            Self::LineIndex(index) => Some(*index),
            _ => None,
        }
    }

    pub fn as_entry_index(&self) -> Option<LogEntryIndex> {
        match self {
            Self::EntryIndex(index) => Some(*index),
            _ => None,
        }
    }

    pub fn as_source_id(&self) -> Option<SourceId> {
        match self {
            Self::SourceId(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_level(&self) -> Option<LogLevel> {
        match self {
            Self::Level(level) => Some(*level),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => text.as_deref(),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(text) => text,
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Timestamp(timestamp) => *timestamp,
            _ => None,
        }
    }

    pub fn as_time_span(&self) -> Option<TimeDelta> {
        match self {
            Self::TimeSpan(span) => *span,
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_size(&self) -> Option<u64> {
        match self {
            Self::Size(size) => *size,
            _ => None,
        }
    }

    pub fn as_percentage(&self) -> Option<f64> {
        match self {
            Self::Percentage(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_empty_reason(&self) -> Option<EmptyReason> {
        match self {
            Self::EmptyReason(reason) => *reason,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_index_sentinels() {
        assert_eq!(LogLineIndex::new(-5), LogLineIndex::INVALID);
        assert_eq!(LogLineIndex::from(3usize).value(), 3);
        assert_eq!(LogLineIndex::new(0).offset(-1), LogLineIndex::INVALID);
        assert_eq!(LogLineIndex::INVALID.offset(10), LogLineIndex::INVALID);
        assert_eq!(LogEntryIndex::default(), LogEntryIndex::INVALID);
        assert_eq!(LogLineIndex::new(7).as_usize(), Some(7));
    }

    #[test]
    fn test_source_id_bounds() {
        assert_eq!(SourceId::new(0).and_then(SourceId::index), Some(0));
        assert_eq!(SourceId::new(254).and_then(SourceId::index), Some(254));
        assert!(SourceId::new(255).is_none());
        assert_eq!(SourceId::INVALID.index(), None);
    }

    #[test]
    fn test_modification_sections() {
        assert_eq!(Modification::Reset.section().index, LogLineIndex::INVALID);
        assert_eq!(Modification::Reset.section().count, 0);
        assert!(Modification::invalidated(4usize, 2).is_invalidate());

        let section = Modification::appended(2usize, 3).section();
        assert_eq!(section.range(), 2..5);
        assert_eq!(section.end(), 5);
        assert_eq!(
            section.indices(),
            vec![
                LogLineIndex::new(2),
                LogLineIndex::new(3),
                LogLineIndex::new(4)
            ]
        );
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!(LogLevel::from_str("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("crit"), LogLevel::Fatal);
        assert_eq!(LogLevel::from_str("verbose"), LogLevel::Other);
        assert!(!LogLevel::Other.is_definite());
        assert!(LogLevel::Info.is_definite());
    }

    #[test]
    fn test_value_types() {
        assert_eq!(Value::Text(None).data_type(), DataType::Text);
        assert_eq!(Value::Percentage(0.5).as_percentage(), Some(0.5));
        assert_eq!(Value::Integer(4).as_text(), None);
        assert_eq!(
            Value::Text(Some("hello".into())).into_text().as_deref(),
            Some("hello")
        );
    }
}
