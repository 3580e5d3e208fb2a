use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{filter::FromEnvError, fmt, layer::SubscriberExt, EnvFilter, Layer};

use crate::gate_filter;

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log file path (optional)
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Installs the global subscriber. Can only succeed once per process.
    pub fn init(self) -> anyhow::Result<()> {
        init_logging_core(self.output, self.level, self.write_logs_file)
    }
}

pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

fn init_logging_core(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let output_logs_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?;

    let make_detailed_logs_filter = || -> Result<EnvFilter, FromEnvError> {
        if std::env::var("WRITE_RUST_LOG").is_ok() {
            EnvFilter::builder()
                .with_env_var("WRITE_RUST_LOG")
                .from_env()
        } else {
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env()
        }
    };

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

    match output {
        LogOutput::Console => layers.push(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(output_logs_filter)
                .with_filter(gate_filter())
                .boxed(),
        ),
        LogOutput::Json => layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(output_logs_filter)
                .with_filter(gate_filter())
                .boxed(),
        ),
        LogOutput::None => {}
    }

    if let Some(log_file_path) = write_logs_file {
        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(log_file_path)?;

        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(log_file)
                .with_filter(make_detailed_logs_filter()?)
                .with_filter(gate_filter())
                .boxed(),
        );
    }

    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
