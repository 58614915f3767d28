use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Host,
    Sidecar,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Host => "host",
            ProcessKind::Sidecar => "sidecar",
        }
    }

    /// Rotated files are `<prefix>.<YYYY-MM-DD>.jsonl`.
    pub fn log_prefix(self) -> String {
        format!("wingman.{}", self.as_str())
    }

    /// Filter used when neither `WINGMAN_LOG` nor `RUST_LOG` is set. The host
    /// keeps HTTP client internals quiet; a sidecar relay logs at debug so
    /// worker output lines reach the file.
    fn default_directives(self) -> &'static str {
        match self {
            ProcessKind::Host => "info,reqwest=warn,hyper=warn,hyper_util=warn",
            ProcessKind::Sidecar => "debug,reqwest=warn,hyper=warn,hyper_util=warn",
        }
    }

    /// `None` means file only. Otherwise whether the stderr layer uses colour.
    fn console_ansi(self, stderr_is_terminal: bool) -> Option<bool> {
        match self {
            ProcessKind::Host => Some(stderr_is_terminal),
            // Stderr of a relay belongs to whoever spawned it.
            ProcessKind::Sidecar => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub filter: String,
    pub console: bool,
    /// False when another global subscriber was already installed.
    pub installed: bool,
    pub initialized_at: DateTime<Utc>,
}

/// One structured lifecycle/transport record. Everything except `event` and
/// `component` is optional so call sites only fill in what they know.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub pid: Option<u32>,
    pub attempt: Option<u32>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Target of every `emit_event` record.
pub const OBS_TARGET: &str = "wingman.obs";

/// JSON keys whose string values must never reach a log file.
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "accessToken",
    "access_token",
    "refreshToken",
    "refresh_token",
    "deviceCode",
    "device_code",
    "clientSecret",
    "client_secret",
    "secret",
    "password",
    "apiKey",
    "api_key",
    "authorization",
];

static SENSITIVE_FIELD: Lazy<Regex> = Lazy::new(|| {
    let keys = SENSITIVE_KEYS
        .iter()
        .map(|key| regex::escape(key))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r#"(?i)"({keys})"(\s*:\s*)"(?:[^"\\]|\\.)*""#
    ))
    .expect("sensitive field pattern is valid")
});

/// Masks the string values of known credential fields in a JSON-ish body.
/// Works on raw text so truncated or malformed bodies are still scrubbed.
pub fn redact_sensitive_fields(body: &str) -> String {
    SENSITIVE_FIELD
        .replace_all(body, r#""$1"$2"***""#)
        .into_owned()
}

/// Renders a response body for a log line: the scrubbed body when verbose body
/// logging is enabled, otherwise only its size.
pub fn describe_body(body: &str, verbose: bool) -> String {
    if verbose {
        redact_sensitive_fields(body)
    } else {
        format!("<{} bytes>", body.len())
    }
}

macro_rules! obs_record {
    ($log:ident, $process:expr, $event:expr) => {
        tracing::$log!(
            target: OBS_TARGET,
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            pid = $event.pid.map(i64::from).unwrap_or(-1),
            attempt = $event.attempt.map(i64::from).unwrap_or(-1),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

/// Writes one structured record under the `wingman.obs` target. Levels below
/// INFO are raised to INFO so lifecycle records survive the default filter.
pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        obs_record!(error, process, event);
    } else if level == Level::WARN {
        obs_record!(warn, process, event);
    } else {
        obs_record!(info, process, event);
    }
}

/// Installs the global subscriber for `process`: a daily-rotated JSONL file in
/// `logs_dir`, plus a compact stderr layer for the host. Files older than
/// `retention_days` are pruned first. Keep the guard alive for the life of the
/// process or buffered lines are lost.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let prefix = process.log_prefix();
    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let jsonl = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console = process
        .console_ansi(std::io::stderr().is_terminal())
        .map(|ansi| {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
        });

    let (filter, directives) = env_filter(process);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(jsonl)
        .try_init()
        .is_ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        filter: directives,
        console: process.console_ansi(false).is_some(),
        installed,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

/// `WINGMAN_LOG` wins over `RUST_LOG`; both fall back to the per-process default.
fn env_filter(process: ProcessKind) -> (EnvFilter, String) {
    for var in ["WINGMAN_LOG", "RUST_LOG"] {
        if let Ok(directives) = std::env::var(var) {
            if let Ok(filter) = EnvFilter::try_new(&directives) {
                return (filter, directives);
            }
        }
    }
    let directives = process.default_directives();
    (EnvFilter::new(directives), directives.to_string())
}

/// Removes `wingman.<process>.<YYYY-MM-DD>.jsonl` files older than the
/// retention window. Anything not named that way is left alone.
fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("wingman.{process}.");

    let expired = fs::read_dir(logs_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|name| rotated_file_date(name, &prefix))
                .is_some_and(|date| date < cutoff)
        });
    for path in expired {
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!("Could not remove old log {}: {}", path.display(), e);
        }
    }
    Ok(())
}

fn rotated_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub fn default_logs_dir() -> PathBuf {
    std::env::temp_dir().join("wingman").join("logs")
}
