//! Process logging setup for upkeep binaries.
//!
//! ```ignore
//! let mut log_config = LogConfig::from_env("info").with_stderr();
//! if verbose {
//!     log_config = log_config.with_level("debug");
//! }
//! let _logging_guards = init_logging(&log_config)?;
//! ```

use crate::config::EnvParser;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Read `UPKEEP_LOG_LEVEL`, `UPKEEP_LOG_FORMAT` and `UPKEEP_LOG_FILE`.
    ///
    /// Invalid values fall back to defaults; logging is not up yet, so the
    /// problems cannot be reported here.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let level = parser.get_log_level("LOG_LEVEL", default_level).value;
        let format = LogFormat::parse(&parser.get_string("LOG_FORMAT", "pretty").value)
            .unwrap_or_default();
        let file = parser
            .get_optional_string("LOG_FILE")
            .value
            .map(PathBuf::from);
        Self {
            level,
            format,
            stderr: false,
            file,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        match std::env::var("RUST_LOG") {
            Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
            _ => EnvFilter::try_new(&self.level),
        }
        .map_err(|e| LoggingError::Filter(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("cannot open log file {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Keeps non-blocking writers flushing; drop at process exit.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guards = Vec::new();

    if config.stderr {
        layers.push(stderr_layer(config.format));
    }

    if let Some(path) = &config.file {
        let (layer, guard) = file_layer(path)?;
        layers.push(layer);
        guards.push(guard);
    }

    layers.push(Box::new(config.filter()?));

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(LoggingGuards { _guards: guards })
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true),
        ),
    }
}

fn file_layer(
    path: &Path,
) -> Result<(BoxedLayer, tracing_appender::non_blocking::WorkerGuard), LoggingError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| LoggingError::File {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::File {
            path: path.to_path_buf(),
            source,
        })?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(true);
    Ok((Box::new(layer), guard))
}
