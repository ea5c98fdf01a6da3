//! Settings file
//!
//! Every section and key is optional; missing ones keep their defaults.
//!
//! ```toml
//! [tailing]
//! poll_interval_ms = 100
//! max_lines_per_pass = 10000
//! cache_capacity = 10000
//!
//! [stages]
//! batch_size = 10000
//! max_wait_ms = 0
//! idle_delay_ms = 10
//!
//! [output]
//! json = false
//! max_wait_ms = 100
//! max_lines = 1000
//!
//! [filter]
//! level = "warn"
//! ignore_case = true
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tailpipe_logs::{LogLevel, StageOptions, TextSourceOptions};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub tailing: TailingSettings,
    pub stages: StageSettings,
    pub output: OutputSettings,
    pub filter: FilterSettings,
}

/// `[tailing]`: how files are read
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TailingSettings {
    pub poll_interval_ms: u64,
    pub max_lines_per_pass: usize,
    pub cache_capacity: usize,
}

impl Default for TailingSettings {
    fn default() -> Self {
        let options = TextSourceOptions::default();
        Self {
            poll_interval_ms: options.poll_interval.as_millis() as u64,
            max_lines_per_pass: options.max_lines_per_pass,
            cache_capacity: options.cache_capacity,
        }
    }
}

/// `[stages]`: batching of the filter, multi-line and merge stages
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub batch_size: usize,
    pub max_wait_ms: u64,
    pub idle_delay_ms: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        let options = StageOptions::default();
        Self {
            batch_size: options.batch_size,
            max_wait_ms: options.max_wait.as_millis() as u64,
            idle_delay_ms: options.idle_delay.as_millis() as u64,
        }
    }
}

/// `[output]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub json: bool,

    /// Longest time appended lines are held back before being printed
    pub max_wait_ms: u64,

    /// Lines printed per notification at most
    pub max_lines: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            json: false,
            max_wait_ms: 100,
            max_lines: 1000,
        }
    }
}

/// `[filter]`: defaults for the command-line filter flags
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub level: Option<LogLevel>,
    pub ignore_case: bool,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn text_options(&self) -> TextSourceOptions {
        TextSourceOptions::default()
            .with_poll_interval(Duration::from_millis(self.tailing.poll_interval_ms))
            .with_max_lines_per_pass(self.tailing.max_lines_per_pass)
            .with_cache_capacity(self.tailing.cache_capacity)
    }

    pub fn stage_options(&self) -> StageOptions {
        StageOptions::default()
            .with_batch_size(self.stages.batch_size)
            .with_max_wait(Duration::from_millis(self.stages.max_wait_ms))
            .with_idle_delay(Duration::from_millis(self.stages.idle_delay_ms))
    }

    pub fn output_max_wait(&self) -> Duration {
        Duration::from_millis(self.output.max_wait_ms)
    }
}
