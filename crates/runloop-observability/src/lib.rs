use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Engine,
    Worker,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Engine => "engine",
            ProcessKind::Worker => "worker",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub initialized_at: DateTime<Utc>,
}

/// Flat field set logged for every lifecycle event of the run core.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub run_id: Option<&'a str>,
    pub thread_id: Option<&'a str>,
    pub worker_id: Option<&'a str>,
    pub tool: Option<&'a str>,
    pub category: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl<'a> ObservabilityEvent<'a> {
    pub fn new(event: &'a str, component: &'a str) -> Self {
        Self {
            event,
            component,
            ..Default::default()
        }
    }

    pub fn run(mut self, run_id: &'a str) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn thread(mut self, thread_id: &'a str) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn worker(mut self, worker_id: &'a str) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn tool(mut self, tool: &'a str, category: &'a str) -> Self {
        self.tool = Some(tool);
        self.category = Some(category);
        self
    }

    pub fn category(mut self, category: &'a str) -> Self {
        self.category = Some(category);
        self
    }

    pub fn status(mut self, status: &'a str) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error_code(mut self, code: &'a str) -> Self {
        self.error_code = Some(code);
        self
    }

    pub fn detail(mut self, detail: &'a str) -> Self {
        self.detail = Some(detail);
        self
    }
}

pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

macro_rules! obs_log {
    ($mac:ident, $process:expr, $event:expr) => {
        tracing::$mac!(
            target: "runloop.obs",
            process = $process.as_str(),
            component = $event.component,
            event = $event.event,
            run_id = $event.run_id.unwrap_or(""),
            thread_id = $event.thread_id.unwrap_or(""),
            worker_id = $event.worker_id.unwrap_or(""),
            tool = $event.tool.unwrap_or(""),
            category = $event.category.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_log!(error, process, event),
        Level::WARN => obs_log!(warn, process, event),
        Level::DEBUG | Level::TRACE => obs_log!(debug, process, event),
        _ => obs_log!(info, process, event),
    }
}

fn log_prefix(process: ProcessKind) -> String {
    format!("runloop.{}", process.as_str())
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, process, retention_days, Utc::now())?;

    let prefix = log_prefix(process);
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix.clone())
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init in the same process (tests, embedded use) keeps the first subscriber.
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn cleanup_old_jsonl(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let cutoff = now - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", log_prefix(process));
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // runloop.<proc>.YYYY-MM-DD.jsonl
        let Some(date_part) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        let Some(dt) = date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        if DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc) < cutoff
            && fs::remove_file(&path).is_ok()
        {
            removed += 1;
        }
    }

    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "sk-live-abcdef";
        let redacted = redact_text(raw);
        assert!(redacted.starts_with("[redacted len=14"));
        assert!(!redacted.contains("abcdef"));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn event_builder_sets_fields() {
        let event = ObservabilityEvent::new("lock.acquired", "run_lock")
            .run("run-1")
            .worker("w-1")
            .status("ok");
        assert_eq!(event.run_id, Some("run-1"));
        assert_eq!(event.worker_id, Some("w-1"));
        assert_eq!(event.tool, None);
    }

    #[test]
    fn cleanup_removes_only_expired_files_of_the_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("runloop.engine.2020-01-01.jsonl");
        let fresh = dir.path().join("runloop.engine.2026-10-15.jsonl");
        let other = dir.path().join("runloop.worker.2020-01-01.jsonl");
        for path in [&old, &fresh, &other] {
            fs::write(path, "{}\n").expect("write");
        }
        let now = DateTime::parse_from_rfc3339("2026-10-16T00:00:00Z")
            .expect("date")
            .with_timezone(&Utc);

        let removed = cleanup_old_jsonl(dir.path(), ProcessKind::Engine, 7, now).expect("cleanup");

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }
}
