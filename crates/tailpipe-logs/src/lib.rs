//! Log ingestion pipeline for tailpipe
//!
//! This crate tails text files and turns them into columnar rows, then lets stages filter,
//! group, merge and proxy those rows. Every stage does its work in small batches on a periodic
//! task and tells its listeners what changed.

mod buffer;
mod derived;
mod engine;
mod error;
mod filter;
mod filtered;
mod listener;
mod memory;
mod merged;
mod multiline;
mod parser;
mod pending;
mod pipeline;
mod proxy;
mod scheduler;
mod source;
mod text;

pub use buffer::{
    ArrayEntry, DEFAULT_CACHE_CAPACITY, ListEntry, LogBufferArray, LogBufferList, LogEntryCache,
};
pub use engine::{LogSourceCore, RunOnce, StageOptions};
pub use error::{LogSourceError, Result};
pub use filter::{CompiledFilter, FilterPresets, LogEntryFilter, LogLineFilter};
pub use filtered::FilteredLogSource;
pub use listener::{
    ListenerNotifier, LogSourceListener, LogSourceListenerCollection, StageKey,
};
pub use memory::InMemoryLogSource;
pub use merged::{IndexChanges, MergedLine, MergedLogSource, MergedLogSourceIndex};
pub use multiline::MultiLineLogSource;
pub use parser::{
    GenericTextParser, LineTranslator, LogEntryParser, ParsedLine, TimestampParser, detect_level,
    strip_garbage,
};
pub use pipeline::PipelineBuilder;
pub use proxy::LogSourceProxy;
pub use scheduler::{
    ManualTaskScheduler, PeriodicFn, TaskHandle, TaskScheduler, TokioTaskScheduler,
};
pub use source::{LogSource, LogSourceExt, depends_on, ensure_acyclic};
pub use text::{TextLogSource, TextSourceOptions};

// Re-export types used in our public API
pub use tailpipe_types::{
    Column, LogEntry, LogEntryIndex, LogLevel, LogLineIndex, LogSourceSection, Modification,
    Property, ReadOnlyLogEntry, SourceId, Value, columns, properties,
};
