use regex::Regex;
use std::collections::HashSet;

use tailpipe_types::{LogLevel, ReadOnlyLogEntry};

/// Decides whether a single line is kept
pub trait LogLineFilter: Send + Sync {
    fn passes_line(&self, line: &dyn ReadOnlyLogEntry) -> bool;
}

/// Decides whether a complete logical entry is kept
pub trait LogEntryFilter: Send + Sync {
    fn passes_entry(&self, lines: &[&dyn ReadOnlyLogEntry]) -> bool;
}

impl<F> LogLineFilter for F
where
    F: Fn(&dyn ReadOnlyLogEntry) -> bool + Send + Sync,
{
    fn passes_line(&self, line: &dyn ReadOnlyLogEntry) -> bool {
        self(line)
    }
}

/// Compiled filter for log lines
#[derive(Clone)]
pub struct CompiledFilter {
    /// Regex pattern (if any)
    regex: Option<Regex>,

    /// Original pattern string
    pattern: String,

    /// Log levels to include (empty = all)
    levels: HashSet<LogLevel>,

    /// Whether to invert match
    invert: bool,

    case_insensitive: bool,
}

impl CompiledFilter {
    /// Create a new filter from a pattern string
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Self::build(pattern, false)
    }

    /// Create a case-insensitive filter
    pub fn new_case_insensitive(pattern: &str) -> Result<Self, regex::Error> {
        Self::build(pattern, true)
    }

    /// Filter on levels only
    pub fn for_levels(levels: impl IntoIterator<Item = LogLevel>) -> Self {
        Self {
            regex: None,
            pattern: String::new(),
            levels: levels.into_iter().collect(),
            invert: false,
            case_insensitive: false,
        }
    }

    fn build(pattern: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        let regex = match (pattern.is_empty(), case_insensitive) {
            (true, _) => None,
            (false, true) => Some(Regex::new(&format!("(?i){}", pattern))?),
            (false, false) => Some(Regex::new(pattern)?),
        };

        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            levels: HashSet::new(),
            invert: false,
            case_insensitive,
        })
    }

    /// Set log levels to filter by
    pub fn with_levels(mut self, levels: HashSet<LogLevel>) -> Self {
        self.levels = levels;
        self
    }

    /// Invert the match
    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    /// Check if a line matches this filter
    pub fn matches(&self, line: &dyn ReadOnlyLogEntry) -> bool {
        if !self.levels.is_empty() && !self.levels.contains(&line.log_level()) {
            return self.invert;
        }

        let text_match = match &self.regex {
            Some(re) => line.raw_content().is_some_and(|raw| re.is_match(&raw)),
            None => true,
        };

        if self.invert { !text_match } else { text_match }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn levels(&self) -> &HashSet<LogLevel> {
        &self.levels
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.regex.is_none() && self.levels.is_empty()
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }
}

impl LogLineFilter for CompiledFilter {
    fn passes_line(&self, line: &dyn ReadOnlyLogEntry) -> bool {
        self.matches(line)
    }
}

/// An entry passes when any of its lines does
impl LogEntryFilter for CompiledFilter {
    fn passes_entry(&self, lines: &[&dyn ReadOnlyLogEntry]) -> bool {
        lines.iter().any(|line| self.matches(*line))
    }
}

impl std::fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("pattern", &self.pattern)
            .field("levels", &self.levels)
            .field("invert", &self.invert)
            .finish()
    }
}

/// Quick filter presets
pub struct FilterPresets;

impl FilterPresets {
    pub fn errors_only() -> CompiledFilter {
        CompiledFilter::for_levels([LogLevel::Error, LogLevel::Fatal])
    }

    pub fn warnings_and_above() -> CompiledFilter {
        CompiledFilter::for_levels([LogLevel::Warn, LogLevel::Error, LogLevel::Fatal])
    }

    /// Everything but debug/trace
    pub fn info_and_above() -> CompiledFilter {
        CompiledFilter::for_levels([
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
            LogLevel::Fatal,
        ])
    }

    /// Levels at or above `minimum`
    pub fn at_least(minimum: LogLevel) -> CompiledFilter {
        match minimum {
            LogLevel::Fatal => CompiledFilter::for_levels([LogLevel::Fatal]),
            LogLevel::Error => Self::errors_only(),
            LogLevel::Warn => Self::warnings_and_above(),
            LogLevel::Info => Self::info_and_above(),
            LogLevel::Debug => CompiledFilter::for_levels([
                LogLevel::Debug,
                LogLevel::Info,
                LogLevel::Warn,
                LogLevel::Error,
                LogLevel::Fatal,
            ]),
            LogLevel::Trace | LogLevel::None | LogLevel::Other => {
                CompiledFilter::for_levels([])
            }
        }
    }
}
