use anyhow::Result;
use llm_perf::config::OutputFormat;
use llm_perf::report::{self, MetricsReport};
use llm_perf::{Cli, Config, Message, OpenAIClient, RequestTracker};
use log::{LevelFilter, Metadata, Record, debug, info, warn};
use parking_lot::Mutex;
use ringlog::{Drain, File, LogBuilder, MultiLogBuilder, Output, Stderr};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Maximum log file size before rotation (10MB)
const LOG_FILE_MAX_SIZE: u64 = 1024 * 1024 * 10;

/// Parse log filter strings like "hyper=info" into a map of module prefix to level filter
fn parse_log_filters(filters: &[String]) -> HashMap<String, LevelFilter> {
    let mut map = HashMap::new();
    for filter in filters {
        if let Some((module, level)) = filter.split_once('=') {
            let level_filter = match level.to_lowercase().as_str() {
                "error" => LevelFilter::Error,
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                "off" => LevelFilter::Off,
                _ => continue,
            };
            map.insert(module.to_string(), level_filter);
        }
    }
    map
}

/// The longest matching module prefix decides; unmatched targets fall through
/// to the global level.
fn should_log(metadata: &Metadata, filters: &HashMap<String, LevelFilter>) -> bool {
    let target = metadata.target();

    filters
        .iter()
        .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
        .max_by_key(|(prefix, _)| prefix.len())
        .is_none_or(|(_, level)| metadata.level() <= *level)
}

/// `log::Log` over a ringlog output with per-module filtering
struct FilteredLogger {
    output: Mutex<Box<dyn Output>>,
    max_level: LevelFilter,
    filters: HashMap<String, LevelFilter>,
}

impl log::Log for FilteredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level && should_log(metadata, &self.filters)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!("{} {}\n", record.level(), record.args());
            let _ = self.output.lock().write_all(message.as_bytes());
        }
    }

    fn flush(&self) {
        let _ = self.output.lock().flush();
    }
}

/// Shared handle to the ringlog drain. A background thread flushes it
/// periodically; `main` flushes once more before exiting.
#[derive(Clone)]
struct LogFlusher {
    drain: Arc<Mutex<Box<dyn Drain>>>,
}

impl LogFlusher {
    fn new(drain: Box<dyn Drain>) -> Self {
        Self {
            drain: Arc::new(Mutex::new(drain)),
        }
    }

    fn flush(&self) {
        let _ = Drain::flush(&mut **self.drain.lock());
    }

    fn spawn_periodic(&self, interval: Duration) {
        let flusher = self.clone();
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(interval);
                flusher.flush();
            }
        });
    }
}

/// Returns the drain handle when ringlog buffers output.
fn init_logging(config: &Config) -> Result<Option<LogFlusher>> {
    let log_level = config.log.level.to_level_filter();

    let output: Box<dyn Output> = if let Some(ref log_file) = config.output.trace_log {
        let backup_file = log_file.with_extension("old");
        Box::new(File::new(log_file.clone(), backup_file, LOG_FILE_MAX_SIZE)?)
    } else {
        Box::new(Stderr::new())
    };

    let filters = parse_log_filters(&config.log.filter);

    if filters.is_empty() {
        let base_log = LogBuilder::new()
            .output(output)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to initialize logger: {:?}", e))?;

        let drain = MultiLogBuilder::new()
            .level_filter(log_level)
            .default(base_log)
            .build()
            .start();

        let flusher = LogFlusher::new(drain);
        flusher.spawn_periodic(Duration::from_millis(50));
        Ok(Some(flusher))
    } else {
        let logger = FilteredLogger {
            output: Mutex::new(output),
            max_level: log_level,
            filters,
        };

        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(log_level);
        Ok(None)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Config::load(&cli.config)?;

    let flusher = init_logging(&config)?;

    if !config.output.quiet {
        println!("LLM Request Tracker");
        println!("   Config: {}", cli.config.display());
        println!("   Target: {}", config.endpoint.base_url);
        println!("   Model: {}", config.endpoint.model);
        println!(
            "   Prompts: {} ({} concurrent)",
            config.workload.prompts.len(),
            config.workload.concurrency
        );
        println!();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    let result = runtime.block_on(run(config));
    if let Some(flusher) = flusher {
        flusher.flush();
    }
    log::logger().flush();
    result
}

async fn run(config: Config) -> Result<()> {
    let client = OpenAIClient::new(config.client_config())?;
    let mut tracker = RequestTracker::new(client).with_tokenizer(config.tracker.tokenizer.build()?);
    if let Some(timeout) = config.request_timeout()? {
        tracker = tracker.with_request_timeout(timeout);
    }
    let tracker = Arc::new(tracker);

    let model: Arc<str> = Arc::from(config.endpoint.model.as_str());
    let options = Arc::new(config.generation.clone());
    let semaphore = Arc::new(Semaphore::new(config.workload.concurrency));
    let mut tasks = JoinSet::new();

    info!(
        "Sending {} prompts to {}",
        config.workload.prompts.len(),
        config.endpoint.base_url
    );

    for (index, prompt) in config.workload.prompts.iter().enumerate() {
        let permit = semaphore.clone().acquire_owned().await?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &config.workload.system_prompt {
            messages.push(Message::system(system.as_str()));
        }
        messages.push(Message::user(prompt.as_str()));

        let tracker = tracker.clone();
        let model = model.clone();
        let options = options.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let result = tracker.chat_completion(&model, &messages, &options).await;
            (index, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined? {
            (index, Ok(text)) => {
                debug!("Prompt {} completed - {} bytes of output", index, text.len())
            }
            (index, Err(e)) => warn!("Prompt {} failed: {}", index, e),
        }
    }

    let report = MetricsReport::from_snapshot(tracker.snapshot());
    info!(
        "Batch finished - {} of {} requests succeeded",
        report.batch_stats.successful_requests, report.total_requests
    );

    match config.output.format {
        OutputFormat::Console => {
            if !config.output.quiet {
                report::print_console_report(&report.batch_stats);
            }
        }
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    if config.output.save {
        let path = report::write_report(
            &report,
            config.output.file.as_deref(),
            &config.output.directory,
        )
        .await?;
        if !config.output.quiet {
            println!("Metrics saved to {}", path.display());
        }
    }

    Ok(())
}
