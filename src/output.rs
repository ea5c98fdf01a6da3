//! Printing of the rows a pipeline appends

use std::io::Write;

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;
use tailpipe_logs::{
    Column, LogLevel, LogSource, LogSourceExt, LogSourceSection, Modification, ReadOnlyLogEntry,
    columns,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// One printed row in `--json` mode
#[derive(Serialize)]
struct JsonLine<'a> {
    line: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
    level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<NaiveDateTime>,
    message: &'a str,
}

/// Writes appended rows as they are announced
pub struct Printer<W: Write> {
    writer: W,
    format: OutputFormat,

    /// Display name per source id; empty unless several files are merged
    source_names: Vec<String>,

    /// Rows written so far
    printed: usize,
}

impl<W: Write> Printer<W> {
    pub fn new(writer: W, format: OutputFormat, source_names: Vec<String>) -> Self {
        Self {
            writer,
            format,
            source_names,
            printed: 0,
        }
    }

    pub fn printed(&self) -> usize {
        self.printed
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn apply(&mut self, source: &dyn LogSource, modification: Modification) -> Result<()> {
        match modification {
            Modification::Reset => {
                if self.printed > 0 {
                    tracing::info!("Source was reset, printing it again from the start");
                }
                self.printed = 0;
            }
            Modification::Invalidated(section) => {
                let first = section.index.as_usize().unwrap_or(0);
                if first < self.printed {
                    tracing::debug!("{} printed lines were replaced", self.printed - first);
                    self.printed = first;
                }
            }
            Modification::Appended(section) => self.print(source, section)?,
        }
        Ok(())
    }

    fn print(&mut self, source: &dyn LogSource, section: LogSourceSection) -> Result<()> {
        let columns: [Column; 5] = [
            &columns::LINE_NUMBER,
            &columns::SOURCE_ID,
            &columns::LOG_LEVEL,
            &columns::TIMESTAMP,
            &columns::RAW_CONTENT,
        ];
        let rows = source.get_entries_in(section, &columns)?;
        for row in rows.iter() {
            self.write_row(&row)?;
        }
        self.printed = section.end();
        self.writer.flush()?;
        Ok(())
    }

    fn write_row(&mut self, row: &dyn ReadOnlyLogEntry) -> Result<()> {
        let content = row.raw_content().unwrap_or_default();
        let source = row
            .source_id()
            .index()
            .and_then(|id| self.source_names.get(id))
            .map(String::as_str);

        match self.format {
            OutputFormat::Text => match source {
                Some(source) => writeln!(self.writer, "[{}] {}", source, content)?,
                None => writeln!(self.writer, "{}", content)?,
            },
            OutputFormat::Json => {
                let line = JsonLine {
                    line: row.line_number(),
                    source,
                    level: row.log_level(),
                    timestamp: row.timestamp(),
                    message: &content,
                };
                serde_json::to_writer(&mut self.writer, &line)?;
                writeln!(self.writer)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;
    use tailpipe_logs::{InMemoryLogSource, LogEntry, Value};

    fn source(lines: &[(&str, Option<NaiveDateTime>)]) -> InMemoryLogSource {
        let source = InMemoryLogSource::new();
        for (content, timestamp) in lines {
            source.add(
                &LogEntry::new()
                    .with(&columns::RAW_CONTENT, Value::Text(Some(content.to_string())))
                    .with(&columns::TIMESTAMP, Value::Timestamp(*timestamp)),
            );
        }
        source
    }

    fn printed(printer: Printer<Vec<u8>>) -> String {
        String::from_utf8(printer.into_inner()).unwrap()
    }

    #[test]
    fn test_text_output() {
        let source = source(&[("one", None), ("two", None), ("three", None)]);
        let mut printer = Printer::new(Vec::new(), OutputFormat::Text, Vec::new());

        printer.apply(&source, Modification::Reset).unwrap();
        printer.apply(&source, Modification::appended(0, 2)).unwrap();
        printer.apply(&source, Modification::appended(2, 1)).unwrap();

        assert_eq!(printer.printed(), 3);
        assert_eq!(printed(printer), "one\ntwo\nthree\n");
    }

    #[test]
    fn test_json_output() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(5, 6, 7)
            .unwrap();
        let source = source(&[("2024-03-04 05:06:07 started", Some(at)), ("plain", None)]);
        let mut printer = Printer::new(Vec::new(), OutputFormat::Json, Vec::new());

        printer.apply(&source, Modification::appended(0, 2)).unwrap();

        let lines: Vec<serde_json::Value> = printed(printer)
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                serde_json::json!({
                    "line": 1,
                    "level": "none",
                    "timestamp": "2024-03-04T05:06:07",
                    "message": "2024-03-04 05:06:07 started",
                }),
                serde_json::json!({
                    "line": 2,
                    "level": "none",
                    "message": "plain",
                }),
            ]
        );
    }

    #[test]
    fn test_invalidation_rewinds() {
        let source = source(&[("a", None), ("b", None)]);
        let mut printer = Printer::new(Vec::new(), OutputFormat::Text, Vec::new());

        printer.apply(&source, Modification::appended(0, 2)).unwrap();
        printer.apply(&source, Modification::invalidated(1, 1)).unwrap();
        assert_eq!(printer.printed(), 1);

        printer.apply(&source, Modification::Reset).unwrap();
        assert_eq!(printer.printed(), 0);
    }
}
