//! Tracing setup shared by the DSS binaries
//!
//! A [`LogConfig`] describes the sinks (console, daily-rolling file, or
//! both), the line format and the filter. [`init_logging`] installs it as the
//! global subscriber. Settings can be layered: start from what the command
//! line asks for and let `DSS_LOG_*` variables replace individual fields.
//!
//! Library code logs with structured fields:
//!
//! ```rust,ignore
//! info!(transaction_id = %tx.id(), data_set = %code, "Data set stored");
//! warn!(error = %err, hook = "post-registration", "Hook failed");
//! ```
//!
//! ```no_run
//! use dss_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> anyhow::Result<()> {
//!     let base = LogConfig::default().with_level(LogLevel::Debug);
//!     let _guard = init_logging(&base.overlay_env()?)?;
//!     tracing::info!("Registrator started");
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{format::FmtSpan, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, Registry};

pub const ENV_PREFIX: &str = "DSS_LOG_";

/// Look `input` up in a table of accepted spellings
fn lookup<T: Copy>(kind: &str, input: &str, table: &[(&str, T)]) -> anyhow::Result<T> {
    let wanted = input.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow!("Unknown {} '{}'", kind, input))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        lookup(
            "log level",
            s,
            &[
                ("trace", Self::Trace),
                ("debug", Self::Debug),
                ("info", Self::Info),
                ("warn", Self::Warn),
                ("warning", Self::Warn),
                ("error", Self::Error),
            ],
        )
    }
}

/// Where lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn sinks(self) -> (bool, bool) {
        match self {
            LogOutput::Console => (true, false),
            LogOutput::File => (false, true),
            LogOutput::Both => (true, true),
        }
    }
}

impl FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        lookup(
            "log output",
            s,
            &[
                ("console", Self::Console),
                ("stdout", Self::Console),
                ("file", Self::File),
                ("both", Self::Both),
                ("all", Self::Both),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        lookup("log format", s, &[("text", Self::Text), ("pretty", Self::Text), ("json", Self::Json)])
    }
}

fn parse_switch(var: &str, value: &str) -> anyhow::Result<bool> {
    lookup(
        var,
        value,
        &[
            ("1", true),
            ("true", true),
            ("yes", true),
            ("on", true),
            ("0", false),
            ("false", false),
            ("no", false),
            ("off", false),
        ],
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Rolling files land here as `<file_prefix>.<date>`
    pub dir: PathBuf,
    pub file_prefix: String,
    /// Comma separated directives such as `reqwest=warn,dss_registrator=debug`
    pub directives: Option<String>,
    /// Print source file and line
    pub source_location: bool,
    pub targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::default(),
            output: LogOutput::default(),
            format: LogFormat::default(),
            dir: PathBuf::from("./logs"),
            file_prefix: String::from("dss"),
            directives: None,
            source_location: false,
            targets: true,
        }
    }
}

impl LogConfig {
    /// Defaults with every `DSS_LOG_*` variable applied
    pub fn from_env() -> anyhow::Result<Self> {
        Self::default().overlay_env()
    }

    /// Replace the fields named by `DSS_LOG_LEVEL`, `_OUTPUT`, `_FORMAT`,
    /// `_DIR`, `_FILE_PREFIX`, `_FILTER`, `_INCLUDE_LOCATION` and
    /// `_INCLUDE_TARGETS`; fields without a variable keep their value.
    pub fn overlay_env(self) -> anyhow::Result<Self> {
        self.overlay(|suffix| std::env::var(format!("{}{}", ENV_PREFIX, suffix)).ok())
    }

    fn overlay(mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        if let Some(v) = var("LEVEL") {
            self.level = v.parse()?;
        }
        if let Some(v) = var("OUTPUT") {
            self.output = v.parse()?;
        }
        if let Some(v) = var("FORMAT") {
            self.format = v.parse()?;
        }
        if let Some(v) = var("DIR") {
            self.dir = PathBuf::from(v);
        }
        if let Some(v) = var("FILE_PREFIX") {
            self.file_prefix = v;
        }
        if let Some(v) = var("FILTER") {
            self.directives = Some(v).filter(|d| !d.trim().is_empty());
        }
        if let Some(v) = var("INCLUDE_LOCATION") {
            self.source_location = parse_switch("DSS_LOG_INCLUDE_LOCATION", &v)?;
        }
        if let Some(v) = var("INCLUDE_TARGETS") {
            self.targets = parse_switch("DSS_LOG_INCLUDE_TARGETS", &v)?;
        }
        Ok(self)
    }

    pub fn with_level(self, level: LogLevel) -> Self {
        LogConfig { level, ..self }
    }

    pub fn with_output(self, output: LogOutput) -> Self {
        LogConfig { output, ..self }
    }

    pub fn with_format(self, format: LogFormat) -> Self {
        LogConfig { format, ..self }
    }

    pub fn with_dir(self, dir: impl AsRef<Path>) -> Self {
        LogConfig { dir: dir.as_ref().to_path_buf(), ..self }
    }

    pub fn with_file_prefix(self, prefix: &str) -> Self {
        LogConfig { file_prefix: prefix.to_string(), ..self }
    }

    pub fn with_directives(self, directives: &str) -> Self {
        LogConfig { directives: Some(directives.to_string()), ..self }
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let extra = self.directives.as_deref().unwrap_or_default();
        extra
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .try_fold(
                EnvFilter::builder()
                    .with_default_directive(Level::from(self.level).into())
                    .from_env_lossy(),
                |filter, d| {
                    let directive = d
                        .parse::<Directive>()
                        .with_context(|| format!("Bad log directive '{}'", d))?;
                    Ok(filter.add_directive(directive))
                },
            )
    }

    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> Box<dyn tracing_subscriber::Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(self.targets)
            .with_file(self.source_location)
            .with_line_number(self.source_location)
            .with_span_events(FmtSpan::CLOSE);
        if self.format == LogFormat::Json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }
}

/// Holds the file writer thread; logs written before drop are flushed.
#[must_use]
pub struct LoggingGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuard> {
    let (console, file) = config.output.sinks();
    let mut layers = Vec::new();
    let mut file_writer = None;

    if console {
        layers.push(config.fmt_layer(std::io::stdout, true));
    }
    if file {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("Cannot create log directory {}", config.dir.display()))?;
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(&config.dir, &config.file_prefix));
        layers.push(config.fmt_layer(writer, false));
        file_writer = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(config.filter()?)
        .try_init()
        .context("Global tracing subscriber already installed")?;

    Ok(LoggingGuard { _file_writer: file_writer })
}
