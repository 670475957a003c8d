//! Logging Module
//!
//! Provides structured logging utilities using the `tracing` crate.
//! Supports various output formats and log levels for debugging and production use.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Create a verbose logging config for debugging
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            ansi_colors: true,
        }
    }

    /// Create a quiet logging config (errors only)
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            include_target: false,
            ansi_colors: true,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Initialize logging with the given configuration
///
/// Returns an error message if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Numbered progress lines for the sequential pipeline stages
pub struct StageLogger {
    total: usize,
    current: usize,
    stage_start: Instant,
    run_start: Instant,
}

impl StageLogger {
    /// Create a logger for a run with `total` stages
    pub fn new(total: usize) -> Self {
        Self {
            total,
            current: 0,
            stage_start: Instant::now(),
            run_start: Instant::now(),
        }
    }

    /// Log the start of the next stage
    pub fn begin(&mut self, stage: &str) {
        self.current = (self.current + 1).min(self.total);
        self.stage_start = Instant::now();
        tracing::info!("[{}/{}] {}", self.current, self.total, stage);
    }

    /// Log the end of the current stage
    pub fn end(&self, detail: &str) {
        tracing::info!(
            "[{}/{}] done in {:.2}s: {}",
            self.current,
            self.total,
            self.stage_start.elapsed().as_secs_f64(),
            detail
        );
    }

    /// Index of the stage currently running (1-based, 0 before the first)
    pub fn current(&self) -> usize {
        self.current
    }

    /// Seconds since the logger was created
    pub fn total_elapsed_secs(&self) -> f64 {
        self.run_start.elapsed().as_secs_f64()
    }
}
