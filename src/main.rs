use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use tailpipe_logs::{
    CompiledFilter, FilterPresets, LogEntryFilter, LogLevel, LogLineFilter, LogSource,
    LogSourceListener, Modification, PipelineBuilder, StageKey, TokioTaskScheduler,
};

mod config;
mod output;

use config::Settings;
use output::{OutputFormat, Printer};

/// Tailpipe - tail, filter and merge log files
#[derive(Parser, Debug)]
#[command(name = "tailpipe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log files to read; several files are merged by timestamp
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Only show lines matching this regular expression
    #[arg(short, long)]
    filter: Option<String>,

    /// Match the filter case-insensitively
    #[arg(short = 'i', long)]
    ignore_case: bool,

    /// Only show lines at or above this level (trace, debug, info, warn, error, fatal)
    #[arg(short, long)]
    level: Option<String>,

    /// Group continuation lines with the entry they belong to
    #[arg(short, long)]
    multi_line: bool,

    /// Keep waiting for new lines once the end of the files has been reached
    #[arg(short = 'F', long)]
    follow: bool,

    /// Print one JSON object per line
    #[arg(long)]
    json: bool,

    /// Settings file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

/// Forwards the pipeline's modifications to the print loop
struct ChannelListener {
    sender: mpsc::UnboundedSender<Modification>,
}

impl LogSourceListener for ChannelListener {
    fn on_log_source_modified(&self, _source: StageKey, modification: Modification) {
        // The print loop is gone once the send fails
        let _ = self.sender.send(modification);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let scheduler = TokioTaskScheduler::current().context("No tokio runtime")?;
    let builder = PipelineBuilder::new(Arc::new(scheduler))
        .with_stage_options(settings.stage_options())
        .with_text_options(settings.text_options());
    let pipeline = build_pipeline(&builder, &args, &settings)?;

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let listener: Arc<dyn LogSourceListener> = Arc::new(ChannelListener { sender });
    pipeline.add_listener(
        listener.clone(),
        settings.output_max_wait(),
        settings.output.max_lines,
    );

    let format = if args.json || settings.output.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let mut printer = Printer::new(io::stdout(), format, source_names(&args.files));

    let mut idle = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            modification = receiver.recv() => match modification {
                Some(modification) => printer.apply(pipeline.as_ref(), modification)?,
                None => break,
            },
            _ = idle.tick() => {
                let done = pipeline.end_of_source_reached()
                    && receiver.is_empty()
                    && printer.printed() >= pipeline.count();
                if done && !args.follow {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("Interrupted");
                break;
            }
        }
    }

    pipeline.remove_listener(&listener);
    pipeline.dispose();
    Ok(())
}

/// Text source per file, optionally grouped into entries, merged, then filtered
fn build_pipeline(
    builder: &PipelineBuilder,
    args: &Args,
    settings: &Settings,
) -> Result<Arc<dyn LogSource>> {
    let mut sources: Vec<Arc<dyn LogSource>> = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let text: Arc<dyn LogSource> = builder.text_file(path);
        let source: Arc<dyn LogSource> = if args.multi_line {
            builder.multi_line(text)
        } else {
            text
        };
        sources.push(source);
    }

    let mut pipeline: Arc<dyn LogSource> = match sources.len() {
        1 => sources.remove(0),
        _ => builder.merged(sources)?,
    };

    if let Some(filter) = compile_filter(args, settings)? {
        let filter = Arc::new(filter);
        pipeline = if args.multi_line {
            let filter: Arc<dyn LogEntryFilter> = filter;
            builder.filtered(pipeline, None, Some(filter))
        } else {
            let filter: Arc<dyn LogLineFilter> = filter;
            builder.filtered(pipeline, Some(filter), None)
        };
    }
    Ok(pipeline)
}

/// The filter requested on the command line, falling back to the settings file for the level
fn compile_filter(args: &Args, settings: &Settings) -> Result<Option<CompiledFilter>> {
    let level = match &args.level {
        Some(level) => Some(parse_level(level)?),
        None => settings.filter.level,
    };
    let ignore_case = args.ignore_case || settings.filter.ignore_case;

    let filter = match &args.filter {
        Some(pattern) => {
            let compiled = if ignore_case {
                CompiledFilter::new_case_insensitive(pattern)
            } else {
                CompiledFilter::new(pattern)
            };
            compiled.with_context(|| format!("Invalid filter '{}'", pattern))?
        }
        None if level.is_none() => return Ok(None),
        None => CompiledFilter::for_levels([]),
    };

    Ok(Some(match level {
        Some(level) => filter.with_levels(FilterPresets::at_least(level).levels().clone()),
        None => filter,
    }))
}

fn parse_level(level: &str) -> Result<LogLevel> {
    let parsed = LogLevel::from_str(level);
    if !parsed.is_definite() {
        anyhow::bail!("Unknown log level '{}'", level);
    }
    Ok(parsed)
}

/// Names shown in front of merged lines; none for a single file
fn source_names(files: &[PathBuf]) -> Vec<String> {
    if files.len() < 2 {
        return Vec::new();
    }
    files
        .iter()
        .map(|path| {
            path.file_name()
                .map(Path::new)
                .unwrap_or(path)
                .display()
                .to_string()
        })
        .collect()
}
