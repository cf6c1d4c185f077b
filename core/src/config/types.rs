use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// If true, log to stderr.
    #[serde(default = "default_logging_console")]
    pub console: bool,

    /// If true, log to a file under `directory` (or OS temp dir if unset).
    #[serde(default = "default_logging_file")]
    pub file: bool,

    /// EnvFilter string, e.g. "info" or "seqflow_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,

    /// Optional directory for log files. If empty or unset, uses OS temp dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_console() -> bool {
    true
}

fn default_logging_file() -> bool {
    false
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            console: default_logging_console(),
            file: default_logging_file(),
            level: default_logging_level(),
            directory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Re-poll cadence for tasks whose `report()` asked to be called again.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Window between SIGTERM and SIGKILL when canceling a worker process.
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,

    #[serde(default = "default_line_channel_capacity")]
    pub line_channel_capacity: usize,

    /// Raw stdout tail kept for failure diagnostics.
    #[serde(default = "default_capture_bytes")]
    pub capture_bytes: usize,

    /// Encoding label for decoding worker stdout. Empty selects the
    /// platform default: IBM866 on Windows (legacy worker wire
    /// compatibility), UTF-8 everywhere else.
    #[serde(default)]
    pub console_encoding: String,
}

fn default_abort_grace_ms() -> u64 {
    200
}

fn default_line_channel_capacity() -> usize {
    1024
}

fn default_capture_bytes() -> usize {
    16 * 1024
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            abort_grace_ms: default_abort_grace_ms(),
            line_channel_capacity: default_line_channel_capacity(),
            capture_bytes: default_capture_bytes(),
            console_encoding: String::new(),
        }
    }
}

impl ProcessConfig {
    pub fn console_encoding(&self) -> &'static encoding_rs::Encoding {
        if !self.console_encoding.is_empty() {
            if let Some(enc) = encoding_rs::Encoding::for_label(self.console_encoding.as_bytes()) {
                return enc;
            }
            tracing::warn!(
                label = %self.console_encoding,
                "unknown console_encoding label, falling back to platform default"
            );
        }
        if cfg!(windows) {
            encoding_rs::IBM866
        } else {
            encoding_rs::UTF_8
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Remote requests failing to complete within this window are failed
    /// with a timeout error.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Cancellation poll cadence while a transfer is in flight.
    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_cancel_poll_ms() -> u64 {
    100
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            cancel_poll_ms: default_cancel_poll_ms(),
        }
    }
}
