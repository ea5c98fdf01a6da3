//! Tails a text file line by line

use std::fs::{self, File, Metadata};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, NaiveDateTime};
use parking_lot::{Mutex, RwLock};
use tailpipe_types::columns;
use tailpipe_types::properties::{self, PropertiesBuffer};
use tailpipe_types::{
    Column, EmptyReason, LogEntry, LogEntryIndex, LogLevel, LogLineIndex, Property, Value,
};
use tokio_util::sync::CancellationToken;

use crate::buffer::{DEFAULT_CACHE_CAPACITY, LogEntryCache};
use crate::derived;
use crate::engine::{LogSourceCore, RunOnce};
use crate::error::{LogSourceError, Result, ensure_capacity};
use crate::listener::{LogSourceListener, StageKey};
use crate::parser::{GenericTextParser, LineTranslator, LogEntryParser};
use crate::scheduler::TaskScheduler;
use crate::source::LogSource;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Settings of a [`TextLogSource`]
#[derive(Clone)]
pub struct TextSourceOptions {
    /// Upper bound of lines read per pass
    pub max_lines_per_pass: usize,

    /// Delay between passes once the end of the file has been reached
    pub poll_interval: Duration,

    /// Number of decoded lines kept in memory
    pub cache_capacity: usize,

    /// Applied to every decoded line before it is parsed and stored
    pub translator: Option<Arc<dyn LineTranslator>>,
}

impl Default for TextSourceOptions {
    fn default() -> Self {
        Self {
            max_lines_per_pass: 10_000,
            poll_interval: Duration::from_millis(100),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            translator: None,
        }
    }
}

impl TextSourceOptions {
    pub fn with_max_lines_per_pass(mut self, max_lines_per_pass: usize) -> Self {
        self.max_lines_per_pass = max_lines_per_pass.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    pub fn with_translator(mut self, translator: impl LineTranslator + 'static) -> Self {
        self.translator = Some(Arc::new(translator));
        self
    }
}

/// Where a line lives in the file and what the parser found in it
#[derive(Clone, Copy, Debug)]
struct LineRecord {
    offset: u64,

    /// Content length in bytes, line terminator excluded
    length: usize,

    /// False while the line may still grow
    terminated: bool,
    level: LogLevel,
    timestamp: Option<NaiveDateTime>,
}

#[derive(Debug, Default)]
struct LineIndex {
    lines: Vec<LineRecord>,

    /// Earliest and latest timestamp among `lines[..=i]`, for each `i`
    time_ranges: Vec<Option<(NaiveDateTime, NaiveDateTime)>>,
    max_characters: usize,
}

impl LineIndex {
    fn push(&mut self, record: LineRecord, characters: usize) {
        let previous = self.time_ranges.last().copied().flatten();
        let range = match (previous, record.timestamp) {
            (Some((start, end)), Some(timestamp)) => {
                Some((start.min(timestamp), end.max(timestamp)))
            }
            (None, Some(timestamp)) => Some((timestamp, timestamp)),
            (range, None) => range,
        };
        self.time_ranges.push(range);
        self.max_characters = self.max_characters.max(characters);
        self.lines.push(record);
    }

    fn pop(&mut self) -> Option<LineRecord> {
        self.time_ranges.pop();
        self.lines.pop()
    }

    fn start(&self) -> Option<NaiveDateTime> {
        self.time_ranges.last().copied().flatten().map(|(start, _)| start)
    }

    fn end(&self) -> Option<NaiveDateTime> {
        self.time_ranges.last().copied().flatten().map(|(_, end)| end)
    }

    fn get(&self, index: LogLineIndex) -> Option<&LineRecord> {
        index.as_usize().and_then(|position| self.lines.get(position))
    }
}

/// State only the periodic task touches
struct Reader {
    /// Bytes consumed so far
    offset: u64,
    parser: Box<dyn LogEntryParser>,
}

/// A decoded line waiting to be published
struct DecodedLine {
    record: LineRecord,
    content: String,
}

/// Tails a text file, exposing one row per physical line.
///
/// Only a compact index is kept per line; decoded content lives in a bounded cache and is read
/// from disk again when it has been evicted.
pub struct TextLogSource {
    core: LogSourceCore,
    path: PathBuf,
    options: TextSourceOptions,
    reader: Mutex<Reader>,
    index: RwLock<LineIndex>,
    cache: Mutex<LogEntryCache>,
    properties: RwLock<PropertiesBuffer>,
}

impl TextLogSource {
    /// Tail `path` with the [`GenericTextParser`]
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        path: impl Into<PathBuf>,
        options: TextSourceOptions,
    ) -> Arc<Self> {
        Self::with_parser(scheduler, path, options, Box::new(GenericTextParser::new()))
    }

    pub fn with_parser(
        scheduler: Arc<dyn TaskScheduler>,
        path: impl Into<PathBuf>,
        options: TextSourceOptions,
        parser: Box<dyn LogEntryParser>,
    ) -> Arc<Self> {
        let path = path.into();
        let mut properties = PropertiesBuffer::minimum();
        properties.set(
            &properties::NAME,
            Value::Text(Some(path.display().to_string())),
        );

        let source = Arc::new(Self {
            core: LogSourceCore::new(scheduler),
            cache: Mutex::new(LogEntryCache::with_capacity(
                [&columns::RAW_CONTENT as Column],
                options.cache_capacity,
            )),
            path,
            options,
            reader: Mutex::new(Reader { offset: 0, parser }),
            index: RwLock::new(LineIndex::default()),
            properties: RwLock::new(properties),
        });
        source.core.start("text", &source);
        source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn decode(&self, bytes: &[u8]) -> String {
        let line = String::from_utf8_lossy(bytes).into_owned();
        match &self.options.translator {
            Some(translator) => translator.translate(line),
            None => line,
        }
    }

    /// Drop everything read so far and start over at byte 0
    fn reset_content(&self, reader: &mut Reader) {
        reader.offset = 0;
        let had_lines = {
            let mut index = self.index.write();
            let had_lines = !index.lines.is_empty();
            *index = LineIndex::default();
            had_lines
        };
        self.cache.lock().clear();
        if had_lines {
            self.core.listeners().reset();
        }
    }

    /// The file is gone or can't be read; report it and keep polling
    fn set_unavailable(&self, reader: &mut Reader, error: LogSourceError) {
        let reason = match error {
            LogSourceError::SourceDoesNotExist(_) => {
                tracing::debug!("{}", error);
                EmptyReason::SourceDoesNotExist
            }
            _ => {
                tracing::warn!("{}", error);
                EmptyReason::SourceCannotBeAccessed
            }
        };
        self.reset_content(reader);

        {
            let mut properties = self.properties.write();
            let name = properties.value(&properties::NAME);
            properties.reset();
            properties.set(&properties::NAME, name);
            properties.set(&properties::EMPTY_REASON, Value::EmptyReason(Some(reason)));
            if reason == EmptyReason::SourceDoesNotExist {
                properties.set(&properties::PERCENTAGE_PROCESSED, Value::Percentage(1.0));
            }
        }
        self.core.set_end_of_source_reached();
    }

    /// Take back a trailing line that had no terminator so it is read again in full
    fn reopen_partial_line(&self, reader: &mut Reader) {
        let reopened = {
            let mut index = self.index.write();
            match index.lines.last().copied() {
                Some(last) if !last.terminated => {
                    let position = index.lines.len() - 1;
                    index.pop().map(|record| (position, record))
                }
                _ => None,
            }
        };
        if let Some((position, record)) = reopened {
            reader.offset = record.offset;
            self.cache.lock().remove_from(LogLineIndex::from(position));
            self.core.listeners().invalidate(position, 1);
        }
    }

    /// Read and decode up to `max_lines_per_pass` lines starting at the reader's offset.
    ///
    /// Returns the lines and whether the end of the file was reached.
    fn read_lines(
        &self,
        reader: &mut Reader,
        file: File,
        token: &CancellationToken,
    ) -> io::Result<(Vec<DecodedLine>, bool)> {
        let mut file = BufReader::new(file);
        file.seek(SeekFrom::Start(reader.offset))?;

        let mut lines = Vec::new();
        let mut buffer = Vec::new();
        while lines.len() < self.options.max_lines_per_pass {
            if token.is_cancelled() {
                return Ok((lines, false));
            }
            buffer.clear();
            let read = file.read_until(b'\n', &mut buffer)?;
            if read == 0 {
                return Ok((lines, true));
            }

            let mut offset = reader.offset;
            let mut content = buffer.as_slice();
            if offset == 0 && content.starts_with(UTF8_BOM) {
                content = &content[UTF8_BOM.len()..];
                offset = UTF8_BOM.len() as u64;
            }
            reader.offset += read as u64;

            let terminated = content.ends_with(b"\n");
            let content = trim_line_end(content);
            let decoded = self.decode(content);
            let parsed = reader.parser.parse(&decoded);
            lines.push(DecodedLine {
                record: LineRecord {
                    offset,
                    length: content.len(),
                    terminated,
                    level: parsed.level,
                    timestamp: parsed.timestamp,
                },
                content: decoded,
            });
        }
        Ok((lines, false))
    }

    /// Add freshly read lines to the index and the cache
    fn publish(&self, lines: Vec<DecodedLine>) -> usize {
        let mut index = self.index.write();
        let mut cache = self.cache.lock();
        for line in lines {
            let position = LogLineIndex::from(index.lines.len());
            let characters = line.content.chars().count();
            let entry = LogEntry::new()
                .with(&columns::RAW_CONTENT, Value::Text(Some(line.content)));
            cache.insert(position, &entry);
            index.push(line.record, characters);
        }
        cache.vacuum();
        index.lines.len()
    }

    fn update_properties(&self, metadata: &Metadata, offset: u64, at_end: bool) {
        let (start, end, count, max_characters) = {
            let index = self.index.read();
            (index.start(), index.end(), index.lines.len(), index.max_characters)
        };
        let size = metadata.len();
        let progress = if at_end || size == 0 {
            1.0
        } else {
            (offset as f64 / size as f64).clamp(0.0, 1.0)
        };

        let mut properties = self.properties.write();
        properties.set(&properties::SIZE, Value::Size(Some(size)));
        properties.set(
            &properties::CREATED,
            Value::Timestamp(metadata.created().ok().map(local_time)),
        );
        properties.set(
            &properties::LAST_MODIFIED,
            Value::Timestamp(metadata.modified().ok().map(local_time)),
        );
        properties.set(&properties::EMPTY_REASON, Value::EmptyReason(None));
        properties.set(&properties::START_TIMESTAMP, Value::Timestamp(start));
        properties.set(&properties::END_TIMESTAMP, Value::Timestamp(end));
        properties.set(
            &properties::DURATION,
            Value::TimeSpan(start.zip(end).map(|(start, end)| end - start)),
        );
        properties.set(&properties::LOG_ENTRY_COUNT, Value::Integer(count as i64));
        properties.set(
            &properties::MAX_CHARACTERS_PER_LINE,
            Value::Integer(max_characters as i64),
        );
        properties.set(&properties::PERCENTAGE_PROCESSED, Value::Percentage(progress));
    }

    /// Raw content of the given rows, reading evicted lines from disk again
    fn get_raw_content(
        &self,
        index: &LineIndex,
        indices: &[LogLineIndex],
        destination: &mut [Value],
    ) {
        let mut cache = self.cache.lock();
        let mut file: Option<File> = None;
        let mut reread = false;

        for (slot, i) in destination.iter_mut().zip(indices) {
            let Some(record) = index.get(*i) else {
                *slot = columns::RAW_CONTENT.default_value();
                continue;
            };
            if let Some(value) = cache.get(*i, &columns::RAW_CONTENT) {
                *slot = value;
                continue;
            }

            match self.read_record(&mut file, record) {
                Ok(content) => {
                    let entry = LogEntry::new()
                        .with(&columns::RAW_CONTENT, Value::Text(Some(content.clone())));
                    cache.insert(*i, &entry);
                    reread = true;
                    *slot = Value::Text(Some(content));
                }
                Err(err) => {
                    tracing::warn!(
                        "Failed to read line {} of {}: {}",
                        i,
                        self.path.display(),
                        err
                    );
                    *slot = columns::RAW_CONTENT.default_value();
                }
            }
        }

        if reread {
            cache.vacuum();
        }
    }

    fn read_record(&self, file: &mut Option<File>, record: &LineRecord) -> io::Result<String> {
        let file = match file {
            Some(file) => file,
            None => file.insert(File::open(&self.path)?),
        };
        file.seek(SeekFrom::Start(record.offset))?;
        let mut bytes = vec![0; record.length];
        file.read_exact(&mut bytes)?;
        Ok(self.decode(&bytes))
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn local_time(time: SystemTime) -> NaiveDateTime {
    DateTime::<Local>::from(time).naive_local()
}

impl RunOnce for TextLogSource {
    fn run_once(&self, token: &CancellationToken) -> Duration {
        let mut reader = self.reader.lock();

        let opened = fs::metadata(&self.path).and_then(|metadata| {
            let file = File::open(&self.path)?;
            Ok((metadata, file))
        });
        let (metadata, file) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                self.set_unavailable(&mut reader, LogSourceError::from_io(&self.path, err));
                return self.options.poll_interval;
            }
        };

        if metadata.len() < reader.offset {
            tracing::debug!(
                "{} shrank from {} to {} bytes, reading it again",
                self.path.display(),
                reader.offset,
                metadata.len()
            );
            self.reset_content(&mut reader);
        } else if metadata.len() > reader.offset {
            self.reopen_partial_line(&mut reader);
        }

        let (lines, at_end) = match self.read_lines(&mut reader, file, token) {
            Ok(read) => read,
            Err(err) => {
                self.set_unavailable(&mut reader, LogSourceError::from_io(&self.path, err));
                return self.options.poll_interval;
            }
        };

        let read = lines.len();
        let count = self.publish(lines);
        self.update_properties(&metadata, reader.offset, at_end);
        self.core.listeners().on_read_count(count);

        if at_end {
            self.core.set_end_of_source_reached();
        } else {
            self.core.reset_end_of_source_reached();
        }

        if read > 0 {
            Duration::ZERO
        } else {
            self.options.poll_interval
        }
    }
}

impl LogSource for TextLogSource {
    fn key(&self) -> StageKey {
        self.core.key()
    }

    fn columns(&self) -> Vec<Column> {
        columns::MINIMUM.to_vec()
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
        let index = self.index.read();
        if derived::fill_positional(column, indices, index.lines.len(), destination) {
            return Ok(());
        }
        if column == &columns::RAW_CONTENT {
            self.get_raw_content(&index, indices, destination);
            return Ok(());
        }

        let start = index.start();
        let timestamp_at = |i: LogLineIndex| index.get(i).and_then(|record| record.timestamp);
        for (slot, i) in destination.iter_mut().zip(indices) {
            let record = index.get(*i);
            *slot = if column == &columns::LOG_ENTRY_INDEX {
                match record {
                    Some(_) => Value::EntryIndex(LogEntryIndex::new(i.value())),
                    None => column.default_value(),
                }
            } else if column == &columns::SOURCE_ID {
                column.default_value()
            } else if column == &columns::LOG_LEVEL {
                record.map_or_else(|| column.default_value(), |r| Value::Level(r.level))
            } else if column == &columns::TIMESTAMP {
                Value::Timestamp(record.and_then(|r| r.timestamp))
            } else if column == &columns::DELTA_TIME {
                derived::delta(timestamp_at(i.offset(-1)), timestamp_at(*i))
            } else if column == &columns::ELAPSED_TIME {
                derived::elapsed(start, timestamp_at(*i))
            } else {
                return Err(LogSourceError::NoSuchColumn(column.id()));
            };
        }
        Ok(())
    }

    fn count(&self) -> usize {
        self.index.read().lines.len()
    }

    fn end_of_source_reached(&self) -> bool {
        self.core.end_of_source_reached()
    }

    fn dispose(&self) {
        if self.core.dispose() {
            *self.index.write() = LineIndex::default();
            self.cache.lock().clear();
        }
    }
}

impl Drop for TextLogSource {
    fn drop(&mut self) {
        self.dispose();
    }
}
