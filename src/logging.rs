//! Tracing setup and per-device verbosity.
//!
//! The process installs one `tracing-subscriber` pipeline whose global level
//! comes from `application.log_level` (overridable with `RUST_LOG`). Each
//! device additionally carries a [`DeviceLogLevel`] driven by its `loglevel`
//! parameter; device events below that level are never emitted, so a noisy
//! axis can be silenced without touching the global filter.
//!
//! # Example
//! ```no_run
//! use daq_runtime::{config::RuntimeConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuntimeConfig::load_from("setup.toml")?;
//! logging::init_from_config(&config)?;
//!
//! tracing::info!(device = "m1", "device created");
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use crate::config::RuntimeConfig;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colors, for a terminal
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON for log shipping
    Json,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    pub with_source_location: bool,
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_source_location: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level taken from `application.log_level`.
    pub fn from_runtime_config(config: &RuntimeConfig) -> Result<Self, String> {
        parse_log_level(&config.application.log_level).map(Self::new)
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()));
        let spans = if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(spans)
            .with_file(self.with_source_location)
            .with_line_number(self.with_source_location)
            .with_target(false);
        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.with_ansi).with_filter(filter).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).with_filter(filter).boxed(),
            OutputFormat::Json => base.json().with_filter(filter).boxed(),
        }
    }
}

/// Install the global subscriber from the runtime configuration.
pub fn init_from_config(config: &RuntimeConfig) -> Result<(), String> {
    init(TracingConfig::from_runtime_config(config)?)
}

/// Install the global subscriber. A subscriber installed earlier (by tests
/// or an embedding application) is left in place.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    tracing_subscriber::registry()
        .with(config.layer())
        .try_init()
        .map_err(|e| format!("failed to initialize tracing: {e}"))
}

/// Parse a level name. Accepts the device `loglevel` spelling `warning`.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "invalid log level '{level}', expected one of trace, debug, info, warning, error"
        )),
    }
}

/// Verbosity threshold of one device.
#[derive(Debug)]
pub struct DeviceLogLevel(AtomicU8);

impl Default for DeviceLogLevel {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl DeviceLogLevel {
    pub fn new(level: Level) -> Self {
        Self(AtomicU8::new(rank(level)))
    }

    pub fn get(&self) -> Level {
        match self.0.load(Ordering::Relaxed) {
            0 => Level::ERROR,
            1 => Level::WARN,
            2 => Level::INFO,
            3 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    pub fn set(&self, level: Level) {
        self.0.store(rank(level), Ordering::Relaxed);
    }

    /// Apply a `loglevel` parameter value; unknown names are ignored.
    pub fn set_from_param(&self, value: &serde_json::Value) -> bool {
        match value.as_str().map(parse_log_level) {
            Some(Ok(level)) => {
                self.set(level);
                true
            }
            _ => false,
        }
    }

    /// Whether an event at `level` passes this threshold.
    pub fn enabled(&self, level: Level) -> bool {
        rank(level) <= self.0.load(Ordering::Relaxed)
    }
}

fn rank(level: Level) -> u8 {
    match level {
        Level::ERROR => 0,
        Level::WARN => 1,
        Level::INFO => 2,
        Level::DEBUG => 3,
        Level::TRACE => 4,
    }
}
