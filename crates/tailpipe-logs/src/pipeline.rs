//! Composition of stages sharing one scheduler

use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::StageOptions;
use crate::error::Result;
use crate::filter::{LogEntryFilter, LogLineFilter};
use crate::filtered::FilteredLogSource;
use crate::merged::MergedLogSource;
use crate::multiline::MultiLineLogSource;
use crate::proxy::LogSourceProxy;
use crate::scheduler::TaskScheduler;
use crate::source::LogSource;
use crate::text::{TextLogSource, TextSourceOptions};

/// Builds stages on top of existing ones, injecting the scheduler and options.
///
/// Stages can only be built from sources that already exist, so a pipeline built this way
/// can't contain a cycle. [`LogSourceProxy::set_inner`] checks for cycles itself.
#[derive(Clone)]
pub struct PipelineBuilder {
    scheduler: Arc<dyn TaskScheduler>,
    stage_options: StageOptions,
    text_options: TextSourceOptions,
}

impl PipelineBuilder {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            scheduler,
            stage_options: StageOptions::default(),
            text_options: TextSourceOptions::default(),
        }
    }

    pub fn with_stage_options(mut self, options: StageOptions) -> Self {
        self.stage_options = options;
        self
    }

    pub fn with_text_options(mut self, options: TextSourceOptions) -> Self {
        self.text_options = options;
        self
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    pub fn text_file(&self, path: impl Into<PathBuf>) -> Arc<TextLogSource> {
        TextLogSource::new(self.scheduler.clone(), path, self.text_options.clone())
    }

    pub fn filtered(
        &self,
        source: Arc<dyn LogSource>,
        line_filter: Option<Arc<dyn LogLineFilter>>,
        entry_filter: Option<Arc<dyn LogEntryFilter>>,
    ) -> Arc<FilteredLogSource> {
        FilteredLogSource::new(
            self.scheduler.clone(),
            source,
            line_filter,
            entry_filter,
            self.stage_options.clone(),
        )
    }

    pub fn multi_line(&self, source: Arc<dyn LogSource>) -> Arc<MultiLineLogSource> {
        MultiLineLogSource::new(self.scheduler.clone(), source, self.stage_options.clone())
    }

    pub fn merged(&self, sources: Vec<Arc<dyn LogSource>>) -> Result<Arc<MergedLogSource>> {
        MergedLogSource::new(self.scheduler.clone(), sources, self.stage_options.clone())
    }

    pub fn proxy(&self, inner: Option<Arc<dyn LogSource>>) -> Arc<LogSourceProxy> {
        LogSourceProxy::new(self.scheduler.clone(), inner, self.stage_options.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterPresets;
    use crate::scheduler::ManualTaskScheduler;
    use crate::source::LogSourceExt;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tailpipe_types::{LogSourceSection, SourceId, Value, columns};
    use tempfile::TempDir;

    fn contents(source: &dyn LogSource) -> Vec<String> {
        source
            .get_column_in(LogSourceSection::new(0, source.count()), &columns::RAW_CONTENT)
            .unwrap()
            .into_iter()
            .map(|v| v.into_text().unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_file_to_filtered_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(
            &path,
            "2024-01-02 03:04:05 INFO starting\n\
             2024-01-02 03:04:06 ERROR failed\n    at frame one\n\
             2024-01-02 03:04:07 INFO done\n",
        )
        .unwrap();

        let scheduler = Arc::new(ManualTaskScheduler::new());
        let builder = PipelineBuilder::new(scheduler.clone());
        let text = builder.text_file(&path);
        let entries = builder.multi_line(text);
        let errors = builder.filtered(
            entries,
            None,
            Some(Arc::new(FilterPresets::errors_only())),
        );
        scheduler.run(5);

        assert_eq!(
            contents(errors.as_ref()),
            vec!["2024-01-02 03:04:06 ERROR failed", "    at frame one"]
        );
        assert!(errors.end_of_source_reached());
        assert_eq!(
            scheduler.task_names(),
            vec!["text", "multi_line", "filtered"]
        );
    }

    #[test]
    fn test_merged_files() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        fs::write(&a, "2024-01-02 03:04:05 a1\n2024-01-02 03:04:07 a2\n").unwrap();
        fs::write(&b, "2024-01-02 03:04:06 b1\n").unwrap();

        let scheduler = Arc::new(ManualTaskScheduler::new());
        let builder = PipelineBuilder::new(scheduler.clone());
        let sources: Vec<Arc<dyn LogSource>> = vec![builder.text_file(&a), builder.text_file(&b)];
        let merged = builder.merged(sources).unwrap();
        scheduler.run(3);

        assert_eq!(
            contents(merged.as_ref()),
            vec![
                "2024-01-02 03:04:05 a1",
                "2024-01-02 03:04:06 b1",
                "2024-01-02 03:04:07 a2"
            ]
        );
        assert_eq!(
            merged
                .get_column_in(LogSourceSection::new(1, 1), &columns::SOURCE_ID)
                .unwrap(),
            vec![Value::SourceId(SourceId::new(1).unwrap())]
        );
        assert!(merged.end_of_source_reached());
    }

    #[test]
    fn test_proxy_over_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "one\ntwo\n").unwrap();

        let scheduler = Arc::new(ManualTaskScheduler::new());
        let builder = PipelineBuilder::new(scheduler.clone());
        let proxy = builder.proxy(None);
        proxy.set_inner(Some(builder.text_file(&path))).unwrap();
        scheduler.run(3);

        assert_eq!(contents(proxy.as_ref()), vec!["one", "two"]);
    }
}
