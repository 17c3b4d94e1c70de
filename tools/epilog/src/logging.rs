use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::errors::EpilogError;

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;

const RUN_LOG_FILE: &str = "run.jsonl";

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), EpilogError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EpilogError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| EpilogError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EpilogError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| EpilogError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| EpilogError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            let _ = prune_to_budget(parent, self.budget_bytes)?;
        }

        Ok(())
    }
}

/// Deletes oldest-modified files in `dir` until the directory's total size
/// fits the byte budget. Returns how many files were removed.
pub fn prune_to_budget(dir: &Path, budget_bytes: u64) -> Result<usize, EpilogError> {
    let mut files = fs::read_dir(dir)
        .map_err(|e| EpilogError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect::<Vec<_>>();

    files.sort_by(|a, b| {
        let ma = fs::metadata(a).ok().and_then(|m| m.modified().ok());
        let mb = fs::metadata(b).ok().and_then(|m| m.modified().ok());
        ma.cmp(&mb)
    });

    let mut total = files
        .iter()
        .filter_map(|path| fs::metadata(path).ok().map(|meta| meta.len()))
        .sum::<u64>();

    let mut pruned = 0;
    for path in files {
        if total <= budget_bytes {
            break;
        }
        let len = fs::metadata(&path)
            .map_err(|e| EpilogError::Io(e.to_string()))?
            .len();
        fs::remove_file(&path).map_err(|e| EpilogError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        pruned += 1;
    }

    Ok(pruned)
}

static RUN_LOG: OnceLock<JsonlLogger> = OnceLock::new();

/// Points the process-wide run log at the configured directory. Later calls
/// are no-ops; the first wins (like installing a tracing subscriber).
pub fn init_run_log(dir: &Path, budget_bytes: u64) {
    let mut logger = JsonlLogger::new(dir.join(RUN_LOG_FILE));
    logger.budget_bytes = budget_bytes;
    let _ = RUN_LOG.set(logger);
}

fn run_logger() -> &'static JsonlLogger {
    RUN_LOG.get_or_init(|| {
        let dir = std::env::var_os("EPILOG_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".cache/epilog/logs"));
        JsonlLogger::new(dir.join(RUN_LOG_FILE))
    })
}

/// Appends one structured event to the run log. Best-effort: a failed
/// append never fails the calling operation.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let _ = run_logger().append(&LogEvent {
        level,
        event_type,
        payload,
    });
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    // Payloads carry caller-supplied text, so the cut must land on a UTF-8
    // char boundary.
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = rendered;
    truncated.truncate(cut);
    Value::String(format!("{truncated}..."))
}
