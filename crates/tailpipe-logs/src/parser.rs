//! Level and timestamp detection for plain text lines

use std::borrow::Cow;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use regex::{Captures, Regex};
use tailpipe_types::LogLevel;

/// Timestamps are only looked for within this many leading characters
const TIMESTAMP_SEARCH_WINDOW: usize = 200;

/// The generic parser stops looking for timestamps after this many misses in a row,
/// as long as it never found one
const MAX_MISSES_WITHOUT_TIMESTAMP: usize = 100;

/// What a parser extracted from one line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedLine {
    pub level: LogLevel,
    pub timestamp: Option<NaiveDateTime>,
}

/// Extracts level and timestamp from a decoded line
pub trait LogEntryParser: Send {
    fn parse(&mut self, line: &str) -> ParsedLine;
}

/// Rewrites decoded lines before they are stored
pub trait LineTranslator: Send + Sync {
    fn translate(&self, line: String) -> String;
}

impl<F> LineTranslator for F
where
    F: Fn(String) -> String + Send + Sync,
{
    fn translate(&self, line: String) -> String {
        self(line)
    }
}

/// Remove control characters other than tab
pub fn strip_garbage(line: &str) -> Cow<'_, str> {
    if !line.chars().any(is_garbage) {
        return Cow::Borrowed(line);
    }
    Cow::Owned(line.chars().filter(|c| !is_garbage(*c)).collect())
}

fn is_garbage(c: char) -> bool {
    c.is_control() && c != '\t'
}

/// Find the largest valid char boundary <= the given byte index
fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// ============================================================================
// Levels
// ============================================================================

const LEVEL_KEYWORDS: [(&str, LogLevel); 11] = [
    ("FATAL", LogLevel::Fatal),
    ("PANIC", LogLevel::Fatal),
    ("CRITICAL", LogLevel::Fatal),
    ("ERROR", LogLevel::Error),
    ("ERR", LogLevel::Error),
    ("WARNING", LogLevel::Warn),
    ("WARN", LogLevel::Warn),
    ("INFO", LogLevel::Info),
    ("DEBUG", LogLevel::Debug),
    ("TRACE", LogLevel::Trace),
    ("VERBOSE", LogLevel::Trace),
];

/// Detect the level of a plain text line; `Other` when nothing looks like one
pub fn detect_level(line: &str) -> LogLevel {
    let upper = line.to_uppercase();

    // [ERROR] beats ERROR: beats " ERROR " beats a leading ERROR
    let shapes: [fn(&str, &str) -> bool; 4] = [
        |text, keyword| text.contains(&format!("[{keyword}]")),
        |text, keyword| text.contains(&format!("{keyword}:")),
        |text, keyword| text.contains(&format!(" {keyword} ")),
        |text, keyword| text.trim_start().starts_with(keyword),
    ];

    for matches in shapes {
        for (keyword, level) in LEVEL_KEYWORDS {
            if matches(&upper, keyword) {
                return level;
            }
        }
    }
    LogLevel::Other
}

// ============================================================================
// Timestamps
// ============================================================================

struct TimestampFormat {
    name: &'static str,
    pattern: Regex,
}

impl TimestampFormat {
    fn new(name: &'static str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            pattern: Regex::new(pattern)?,
        })
    }

    /// Parse a match starting exactly at byte `column`
    fn parse_at(&self, window: &str, column: usize) -> Option<NaiveDateTime> {
        let captures = self.pattern.captures_at(window, column)?;
        if captures.get(0)?.start() != column {
            return None;
        }
        to_date_time(&captures)
    }

    /// Parse the first valid match, returning it with its byte column
    fn find(&self, window: &str) -> Option<(NaiveDateTime, usize)> {
        self.pattern.captures_iter(window).find_map(|captures| {
            let column = captures.get(0)?.start();
            to_date_time(&captures).map(|timestamp| (timestamp, column))
        })
    }
}

fn to_date_time(captures: &Captures<'_>) -> Option<NaiveDateTime> {
    let number = |name: &str| captures.name(name).and_then(|m| m.as_str().parse::<u32>().ok());

    let date = match captures.name("year") {
        Some(year) => {
            let year = year.as_str().parse::<i32>().ok()?;
            let month = match captures.name("month_name") {
                Some(name) => month_from_name(name.as_str())?,
                None => number("month")?,
            };
            NaiveDate::from_ymd_opt(year, month, number("day")?)?
        }
        None => Local::now().date_naive(),
    };

    let nanos = match captures.name("fraction") {
        Some(fraction) => {
            let digits = fraction.as_str();
            let value = digits.parse::<u32>().ok()?;
            value * 10u32.pow(9u32.saturating_sub(digits.len() as u32))
        }
        None => 0,
    };
    let time = NaiveTime::from_hms_nano_opt(
        number("hour")?,
        number("minute")?,
        number("second")?,
        nanos,
    )?;
    Some(date.and_time(time))
}

fn month_from_name(name: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let name = name.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|month| *month == name)
        .map(|position| position as u32 + 1)
}

/// Finds timestamps in a set of common formats.
///
/// Once a format has matched, it is tried first at the same column for later lines.
pub struct TimestampParser {
    formats: Vec<TimestampFormat>,
    last_match: Option<(usize, usize)>,
}

impl TimestampParser {
    pub fn new() -> Result<Self, regex::Error> {
        const TIME: &str = r"(?P<hour>[0-9]{2}):(?P<minute>[0-9]{2}):(?P<second>[0-9]{2})";

        // Ordered from most to least specific; a bare time of day has to come last
        let formats = vec![
            TimestampFormat::new(
                "yyyy-MM-dd HH:mm:ss.fff",
                &format!(
                    r"(?P<year>[0-9]{{4}})-(?P<month>[0-9]{{2}})-(?P<day>[0-9]{{2}})[ T]{TIME}(?:[,.:](?P<fraction>[0-9]{{1,9}}))?"
                ),
            )?,
            TimestampFormat::new(
                "yyyy-MM-dd HH-mm-ss.fff",
                r"(?P<year>[0-9]{4})-(?P<month>[0-9]{2})-(?P<day>[0-9]{2}) (?P<hour>[0-9]{2})-(?P<minute>[0-9]{2})-(?P<second>[0-9]{2})(?:\.(?P<fraction>[0-9]{1,9}))?",
            )?,
            TimestampFormat::new(
                "dd/MM/yyyy HH:mm:ss:fff",
                &format!(
                    r"(?P<day>[0-9]{{2}})/(?P<month>[0-9]{{2}})/(?P<year>[0-9]{{4}}) {TIME}(?::(?P<fraction>[0-9]{{1,3}}))?"
                ),
            )?,
            TimestampFormat::new(
                "dd/MMM/yyyy:HH:mm:ss",
                &format!(
                    r"(?P<day>[0-9]{{2}})/(?P<month_name>[A-Za-z]{{3}})/(?P<year>[0-9]{{4}}):{TIME}"
                ),
            )?,
            TimestampFormat::new(
                "yyyy MMM dd HH:mm:ss.fff",
                &format!(
                    r"(?P<year>[0-9]{{4}}) (?P<month_name>[A-Za-z]{{3}}) (?P<day>[0-9]{{2}}) {TIME}(?:\.(?P<fraction>[0-9]{{1,9}}))?"
                ),
            )?,
            TimestampFormat::new(
                "ddd MMM dd HH:mm:ss.fff yyyy",
                &format!(
                    r"[A-Za-z]{{3}} (?P<month_name>[A-Za-z]{{3}}) (?P<day>[0-9]{{2}}) {TIME}\.(?P<fraction>[0-9]{{1,9}}) (?P<year>[0-9]{{4}})"
                ),
            )?,
            TimestampFormat::new(
                "HH:mm:ss.fff",
                &format!(r"{TIME}(?:\.(?P<fraction>[0-9]{{1,9}}))?"),
            )?,
        ];

        Ok(Self {
            formats,
            last_match: None,
        })
    }

    /// Name of the format that matched last
    pub fn detected_format(&self) -> Option<&'static str> {
        self.last_match
            .map(|(format, _)| self.formats[format].name)
    }

    pub fn parse(&mut self, line: &str) -> Option<NaiveDateTime> {
        let window_end = line
            .char_indices()
            .nth(TIMESTAMP_SEARCH_WINDOW)
            .map_or(line.len(), |(position, _)| position);
        let window = &line[..floor_char_boundary(line, window_end)];

        if let Some((format, column)) = self.last_match
            && column < window.len()
            && let Some(timestamp) = self.formats[format].parse_at(window, column)
        {
            return Some(timestamp);
        }

        for (index, format) in self.formats.iter().enumerate() {
            if let Some((timestamp, column)) = format.find(window) {
                self.last_match = Some((index, column));
                return Some(timestamp);
            }
        }
        None
    }
}

// ============================================================================
// Generic text
// ============================================================================

/// Default parser: keyword level detection plus common timestamp formats
pub struct GenericTextParser {
    timestamps: Option<TimestampParser>,
    found_timestamps: usize,
    misses_in_a_row: usize,
}

impl GenericTextParser {
    pub fn new() -> Self {
        let timestamps = match TimestampParser::new() {
            Ok(parser) => Some(parser),
            Err(err) => {
                tracing::error!("Failed to build timestamp parser: {}", err);
                None
            }
        };
        Self {
            timestamps,
            found_timestamps: 0,
            misses_in_a_row: 0,
        }
    }

    /// Whether timestamps are still being looked for
    pub fn detects_timestamps(&self) -> bool {
        self.timestamps.is_some()
    }

    fn parse_timestamp(&mut self, line: &str) -> Option<NaiveDateTime> {
        let timestamp = self.timestamps.as_mut()?.parse(line);
        if timestamp.is_some() {
            self.found_timestamps += 1;
            self.misses_in_a_row = 0;
            return timestamp;
        }

        self.misses_in_a_row += 1;
        if self.found_timestamps == 0 && self.misses_in_a_row >= MAX_MISSES_WITHOUT_TIMESTAMP {
            tracing::debug!(
                "No timestamp in the first {} lines, no longer looking",
                self.misses_in_a_row
            );
            self.timestamps = None;
        }
        None
    }
}

impl Default for GenericTextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogEntryParser for GenericTextParser {
    fn parse(&mut self, line: &str) -> ParsedLine {
        ParsedLine {
            level: detect_level(&strip_garbage(line)),
            timestamp: self.parse_timestamp(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_milli_opt(h, mi, s, ms)
            .unwrap()
    }

    #[test]
    fn test_detect_level() {
        assert_eq!(detect_level("[ERROR] something went wrong"), LogLevel::Error);
        assert_eq!(detect_level("2024-01-15 10:30:00 WARN: low disk"), LogLevel::Warn);
        assert_eq!(detect_level("2024-01-15 10:30:00 INFO started"), LogLevel::Info);
        assert_eq!(detect_level("debug output follows"), LogLevel::Debug);
        assert_eq!(detect_level("   at Foo.Bar()"), LogLevel::Other);
    }

    #[test]
    fn test_common_timestamp_formats() {
        let mut parser = TimestampParser::new().unwrap();
        let cases = [
            ("2024-01-15 10:30:00,123 INFO", at(2024, 1, 15, 10, 30, 0, 123)),
            ("2024-01-15T10:30:00 x", at(2024, 1, 15, 10, 30, 0, 0)),
            ("[15/01/2024 10:30:00:250] x", at(2024, 1, 15, 10, 30, 0, 250)),
            ("2024 Jan 15 10:30:00.5 x", at(2024, 1, 15, 10, 30, 0, 500)),
            ("2024-01-15 10-30-00 x", at(2024, 1, 15, 10, 30, 0, 0)),
            (
                r#"127.0.0.1 - - [15/Jan/2024:10:30:00 +0000] "GET /""#,
                at(2024, 1, 15, 10, 30, 0, 0),
            ),
            ("Mon Jan 15 10:30:00.125 2024 x", at(2024, 1, 15, 10, 30, 0, 125)),
        ];
        for (line, expected) in cases {
            assert_eq!(parser.parse(line), Some(expected), "{line}");
        }
    }

    #[test]
    fn test_time_of_day_uses_today() {
        let mut parser = TimestampParser::new().unwrap();
        let timestamp = parser.parse("10:30:00.100 started").unwrap();
        assert_eq!(timestamp.date(), Local::now().date_naive());
        assert_eq!(parser.detected_format(), Some("HH:mm:ss.fff"));
    }

    #[test]
    fn test_remembers_format_and_column() {
        let mut parser = TimestampParser::new().unwrap();
        parser.parse("app 2024-01-15 10:30:00.000 started");
        assert_eq!(parser.detected_format(), Some("yyyy-MM-dd HH:mm:ss.fff"));
        assert_eq!(
            parser.parse("app 2024-01-15 10:30:01.000 running"),
            Some(at(2024, 1, 15, 10, 30, 1, 0))
        );
    }

    #[test]
    fn test_only_searches_leading_characters() {
        let mut parser = TimestampParser::new().unwrap();
        let line = format!("{}2024-01-15 10:30:00", "x".repeat(250));
        assert_eq!(parser.parse(&line), None);
    }

    #[test]
    fn test_invalid_dates_are_rejected() {
        let mut parser = TimestampParser::new().unwrap();
        assert_eq!(parser.parse("2024-13-45 99:99:99"), None);
    }

    #[test]
    fn test_generic_parser_gives_up_on_timestamps() {
        let mut parser = GenericTextParser::new();
        for _ in 0..MAX_MISSES_WITHOUT_TIMESTAMP {
            parser.parse("no timestamp here");
        }
        assert!(!parser.detects_timestamps());
        assert_eq!(parser.parse("2024-01-15 10:30:00 INFO").timestamp, None);
    }

    #[test]
    fn test_generic_parser_keeps_looking_after_a_hit() {
        let mut parser = GenericTextParser::new();
        parser.parse("2024-01-15 10:30:00 INFO first");
        for _ in 0..(MAX_MISSES_WITHOUT_TIMESTAMP * 2) {
            parser.parse("continuation");
        }
        assert!(parser.detects_timestamps());
    }

    #[test]
    fn test_generic_parser_ignores_control_characters() {
        let mut parser = GenericTextParser::new();
        assert_eq!(parser.parse("\u{1b}[31m[ERROR]\u{1b}[0m boom").level, LogLevel::Error);
    }

    #[test]
    fn test_strip_garbage() {
        assert_eq!(strip_garbage("a\tb"), Cow::Borrowed("a\tb"));
        assert_eq!(strip_garbage("a\u{0}b\u{7}c"), "abc");
    }

    #[test]
    fn test_closure_translator() {
        let translator = |line: String| line.to_uppercase();
        assert_eq!(translator.translate("abc".to_string()), "ABC");
    }

    #[test]
    fn test_multibyte_window_no_panic() {
        let mut parser = TimestampParser::new().unwrap();
        let line = "─".repeat(300);
        assert_eq!(parser.parse(&line), None);
    }
}
