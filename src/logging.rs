use colored::*;
use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;
use std::panic;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::types::{CellstreamError, ProviderPulse, Result};

pub const DEFAULT_FILTER: &str = "cellstream=info";
pub const LOG_FILE_NAME: &str = "cellstream.log";

lazy_static! {
    static ref REDACTION_REGEX: Regex =
        Regex::new(r"(?i)(sk-[A-Za-z0-9_-]{20,}|Bearer\s+[^\s]+|api[_-]?key[=:]\s*[^\s,]+)")
            .expect("Invalid redaction regex");
}

/// Masks credentials before bytes reach the log sink.
pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = REDACTION_REGEX.replace_all(&input, "[REDACTED]");
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub fn redact(text: &str) -> String {
    REDACTION_REGEX.replace_all(text, "[REDACTED]").into_owned()
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Overrides `RUST_LOG` when set.
    pub filter: Option<String>,
    pub json: bool,
    /// Directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = match &config.filter {
        Some(f) => EnvFilter::try_new(f)
            .map_err(|e| CellstreamError::Configuration(format!("invalid log filter '{}': {}", f, e)))?,
        None => match EnvFilter::try_from_default_env() {
            Ok(f) => f,
            Err(_) => DEFAULT_FILTER.into(),
        },
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.json {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        );
    }

    let mut guard = None;
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(move || RedactingWriter::new(non_blocking.clone()))
                .with_ansi(false)
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .with(tracing_error::ErrorLayer::default())
        .try_init()
        .map_err(|e| CellstreamError::Configuration(format!("tracing already initialised: {}", e)))?;

    Ok(guard)
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-turn stream counters, summarised once the producer task ends.
#[derive(Default)]
pub struct StreamMetric {
    pub turn_id: String,
    pub chunks: usize,
    pub tokens: usize,
    pub tool_parts: usize,
    pub text_chars: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            ..Self::default()
        }
    }

    pub fn record_chunk(&mut self, pulse: &ProviderPulse) {
        self.chunks += 1;
        if let Some(usage) = &pulse.usage {
            self.tokens = usage.total_tokens as usize;
        }
        for choice in &pulse.choices {
            if let Some(content) = &choice.delta.content {
                self.text_chars += content.chars().count();
            }
            if let Some(tools) = &choice.delta.tool_calls {
                self.tool_parts += tools.len();
                for t in tools {
                    if let Some(f) = &t.function {
                        if let Some(name) = &f.name {
                            if !name.is_empty() {
                                self.tool_names.push(name.clone());
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn log_summary(&self) {
        let tools_str = if self.tool_names.is_empty() {
            format!("{}", self.tool_parts)
        } else {
            format!("{} ({})", self.tool_parts, self.tool_names.join(", "))
        };

        info!(
            "{} TurnID: {} | Chunks: {} | Tools: {} | Text: {} chars | Tokens: {}",
            "[STREAM END]".cyan(),
            self.turn_id,
            self.chunks,
            tools_str,
            self.text_chars,
            self.tokens
        );
    }
}
