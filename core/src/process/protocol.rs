//! The wire protocol spoken by worker processes on stdout.
//!
//! One directive per physical line, tolerant of surrounding free text:
//! leveled log lines (`[time][LEVEL] message`), progress tokens
//! (`task-progress=<n>` as a whitespace-delimited word) and an error payload
//! wrapped in a sentinel token. Both the parent-side parsers and the
//! worker-side formatters live here so the codec stays symmetric.

use lazy_static::lazy_static;
use regex::Regex;

pub const PROGRESS_TAG: &str = "task-progress=";
pub const ERROR_SENTINEL: &str = "#%*seqflow-finished-with-error#%*";

/// Worker flags the parent passes to request structured output.
pub const NO_TASK_PROGRESS_ARG: &str = "log-no-task-progress";
pub const EMIT_PROGRESS_ARG: &str = "emit-progress-state";
pub const EMIT_ERROR_ARG: &str = "emit-task-error";

lazy_static! {
    static ref LOG_HEADER: Regex =
        Regex::new(r"^\[[^\]]*\]\[([A-Za-z]+)\]").expect("static pattern");
}

/// Log levels of the wire protocol, ordered by verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Details,
    Info,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [
        LogLevel::Trace,
        LogLevel::Details,
        LogLevel::Info,
        LogLevel::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Details => "DETAILS",
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.name() == name)
    }

    /// Parse the lowercase form used in `--log-level-<name>` flags.
    pub fn parse_flag_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(name))
    }
}

/// Split a `[time][LEVEL] message` line into its level and message. Lines
/// without the bracket header, or with an unknown level name, yield `None`
/// and are passed through unfiltered by callers.
pub fn log_level_candidate(line: &str) -> Option<(LogLevel, &str)> {
    let caps = LOG_HEADER.captures(line)?;
    let level = LogLevel::parse(caps.get(1)?.as_str())?;
    let rest = &line[caps.get(0)?.end()..];
    Some((level, rest.trim()))
}

/// Scan a line for the first `task-progress=<n>` word. Values above 100
/// clamp to 100; a malformed or negative number yields `None` (progress
/// unchanged).
pub fn parse_progress_token(line: &str) -> Option<u32> {
    for word in line.split_whitespace() {
        if let Some(num) = word.strip_prefix(PROGRESS_TAG) {
            return match num.parse::<i64>() {
                Ok(n) if n >= 0 => Some((n as u64).min(100) as u32),
                _ => None,
            };
        }
    }
    None
}

/// Incremental scanner for the sentinel-wrapped error payload.
///
/// The payload is delimited by a second occurrence of the sentinel; when the
/// stream ends without one, the remainder after the opening sentinel is the
/// error text, trimmed.
#[derive(Debug, Default)]
pub struct ErrorCapture {
    open: Option<String>,
    captured: Option<String>,
}

impl ErrorCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded line. Returns true when the line participated in
    /// error capture and must not be treated as an ordinary log line.
    pub fn feed_line(&mut self, line: &str) -> bool {
        if self.captured.is_some() {
            return false;
        }

        if let Some(buf) = self.open.as_mut() {
            if let Some(end) = line.find(ERROR_SENTINEL) {
                buf.push_str(&line[..end]);
                self.captured = Some(std::mem::take(buf));
                self.open = None;
            } else {
                buf.push_str(line);
                buf.push('\n');
            }
            return true;
        }

        if let Some(start) = line.find(ERROR_SENTINEL) {
            let rest = &line[start + ERROR_SENTINEL.len()..];
            if let Some(end) = rest.find(ERROR_SENTINEL) {
                self.captured = Some(rest[..end].to_string());
            } else {
                let mut buf = String::from(rest);
                buf.push('\n');
                self.open = Some(buf);
            }
            return true;
        }

        false
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// A payload completed by a closing sentinel, if any.
    pub fn take_captured(&mut self) -> Option<String> {
        self.captured.take()
    }

    /// End of stream: an unterminated capture yields the trimmed remainder.
    pub fn finish(&mut self) -> Option<String> {
        if let Some(buf) = self.open.take() {
            let text = buf.trim().to_string();
            if self.captured.is_none() && !text.is_empty() {
                self.captured = Some(text);
            }
        }
        self.captured.take()
    }
}

/// One-shot sentinel extraction over a complete buffer.
pub fn extract_error_payload(data: &str) -> Option<String> {
    let mut capture = ErrorCapture::new();
    for line in data.lines() {
        capture.feed_line(line);
        if let Some(err) = capture.take_captured() {
            return Some(err);
        }
    }
    capture.finish()
}

/// Build the worker argument vector: the worker command, the flags
/// requesting structured progress/error output, the caller's arguments, and
/// a minimum log level flag iff the caller supplied none.
pub fn worker_args(command: &str, user_args: &[String], log_level: LogLevel) -> Vec<String> {
    let mut args = vec![
        command.to_string(),
        format!("--{NO_TASK_PROGRESS_ARG}"),
        format!("--{EMIT_PROGRESS_ARG}"),
        format!("--{EMIT_ERROR_ARG}"),
    ];
    args.extend(user_args.iter().cloned());

    if !contains_prefix(&args, "--log-level") {
        args.push(format!("--log-level-{}", log_level.name().to_lowercase()));
    }
    args
}

fn contains_prefix(args: &[String], prefix: &str) -> bool {
    args.iter().any(|arg| arg.starts_with(prefix))
}

/// Worker-side formatter for a protocol log line.
pub fn format_log_line(level: LogLevel, msg: &str) -> String {
    let ts = chrono::Local::now().format("%H:%M:%S");
    format!("[{ts}][{}] {msg}", level.name())
}

/// Worker-side progress emission.
pub fn progress_line(progress: u32) -> String {
    format_log_line(LogLevel::Info, &format!("{PROGRESS_TAG}{}", progress.min(100)))
}

/// Worker-side error emission: the payload wrapped in the sentinel.
pub fn error_report(error: &str) -> String {
    format_log_line(
        LogLevel::Info,
        &format!("{ERROR_SENTINEL}{error}{ERROR_SENTINEL}"),
    )
}
