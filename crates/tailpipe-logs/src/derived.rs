//! Columns computed from a row's position or its neighbours

use chrono::NaiveDateTime;
use tailpipe_types::columns;
use tailpipe_types::{Column, LogLineIndex, Value};

/// Fill `Index`, `OriginalIndex`, `LineNumber` and `OriginalLineNumber` for a source whose
/// rows are its original lines.
///
/// Returns false without touching `destination` for any other column.
pub(crate) fn fill_positional(
    column: Column,
    indices: &[LogLineIndex],
    count: usize,
    destination: &mut [Value],
) -> bool {
    let is_index = column == &columns::INDEX || column == &columns::ORIGINAL_INDEX;
    let is_line_number =
        column == &columns::LINE_NUMBER || column == &columns::ORIGINAL_LINE_NUMBER;
    if !is_index && !is_line_number {
        return false;
    }

    for (slot, index) in destination.iter_mut().zip(indices) {
        let position = index.as_usize().filter(|position| *position < count);
        *slot = match position {
            Some(_) if is_index => Value::LineIndex(*index),
            Some(position) => Value::Integer(position as i64 + 1),
            None => column.default_value(),
        };
    }
    true
}

/// Time between two rows, unset when either has no timestamp
pub(crate) fn delta(previous: Option<NaiveDateTime>, current: Option<NaiveDateTime>) -> Value {
    Value::TimeSpan(previous.zip(current).map(|(previous, current)| current - previous))
}

/// Time since the start of the source
pub(crate) fn elapsed(start: Option<NaiveDateTime>, current: Option<NaiveDateTime>) -> Value {
    Value::TimeSpan(start.zip(current).map(|(start, current)| current - start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_positional_columns() {
        let indices = [LogLineIndex::new(0), LogLineIndex::new(4), LogLineIndex::INVALID];
        let mut values = vec![Value::Integer(-1); 3];

        assert!(fill_positional(&columns::LINE_NUMBER, &indices, 2, &mut values));
        assert_eq!(
            values,
            vec![Value::Integer(1), Value::Integer(0), Value::Integer(0)]
        );

        assert!(fill_positional(&columns::INDEX, &indices, 2, &mut values));
        assert_eq!(values[0], Value::LineIndex(LogLineIndex::new(0)));
        assert_eq!(values[1], Value::LineIndex(LogLineIndex::INVALID));

        assert!(!fill_positional(&columns::RAW_CONTENT, &indices, 2, &mut values));
    }

    #[test]
    fn test_delta_needs_both_timestamps() {
        let at = |s| {
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(10, 0, s)
                .unwrap()
        };
        assert_eq!(
            delta(Some(at(1)), Some(at(3))),
            Value::TimeSpan(Some(TimeDelta::seconds(2)))
        );
        assert_eq!(delta(None, Some(at(3))), Value::TimeSpan(None));
        assert_eq!(elapsed(Some(at(0)), None), Value::TimeSpan(None));
    }
}
