//! JSONL bulk export.
//!
//! Streams the filtered result set as one self-contained JSON object per
//! line. Episodes are written as they arrive from the store, so memory use
//! stays proportional to a single record. An empty result set produces an
//! empty body — not even a trailing newline.

use std::io::Write;

use crate::episode_store::{EpisodeStore, ExportFilter};
use crate::errors::EpilogError;

/// Writes every matching episode to `out`, one JSON line each. Returns the
/// number of lines written.
pub fn write_jsonl(
    store: &EpisodeStore,
    filter: &ExportFilter,
    out: &mut impl Write,
) -> Result<u64, EpilogError> {
    store.export(filter, |episode| {
        let line =
            serde_json::to_string(&episode).map_err(|e| EpilogError::Io(e.to_string()))?;
        out.write_all(line.as_bytes())
            .map_err(|e| EpilogError::Io(e.to_string()))?;
        out.write_all(b"\n")
            .map_err(|e| EpilogError::Io(e.to_string()))?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tempfile::TempDir;

    use super::write_jsonl;
    use crate::episode::{EpisodeStatus, NewEpisode, Step, StepKind};
    use crate::episode_store::{EpisodeStore, ExportFilter};

    fn temp_store() -> (EpisodeStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("episodes.sqlite");
        (EpisodeStore::open(&db).expect("open store"), dir)
    }

    fn payload(agent_id: &str, steps: Vec<Step>) -> NewEpisode {
        NewEpisode {
            agent_id: agent_id.to_string(),
            steps,
            status: EpisodeStatus::Success,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn each_line_parses_independently_with_steps() {
        let (store, _dir) = temp_store();
        let mut step = Step::new(0, StepKind::ToolCall);
        step.tool_name = Some("web_search".to_string());
        let _ = store.create(payload("a", vec![step])).expect("create");
        let _ = store.create(payload("b", Vec::new())).expect("create");

        let mut buffer = Vec::new();
        let written =
            write_jsonl(&store, &ExportFilter::default(), &mut buffer).expect("export");
        assert_eq!(written, 2);

        let text = String::from_utf8(buffer).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            let value: Value = serde_json::from_str(line).expect("line parses");
            assert!(value.get("episode_id").is_some());
            assert!(value.get("steps").is_some());
        }
        // Trailing newline after the final record, nothing else.
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn empty_result_set_writes_nothing() {
        let (store, _dir) = temp_store();
        let mut buffer = Vec::new();
        let written =
            write_jsonl(&store, &ExportFilter::default(), &mut buffer).expect("export");
        assert_eq!(written, 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn status_filter_applies_to_export() {
        let (store, _dir) = temp_store();
        let _ = store.create(payload("a", Vec::new())).expect("create");
        let mut running = payload("a", Vec::new());
        running.status = EpisodeStatus::Running;
        let _ = store.create(running).expect("create running");

        let filter = ExportFilter {
            status: Some(EpisodeStatus::Running),
            ..ExportFilter::default()
        };
        let mut buffer = Vec::new();
        let written = write_jsonl(&store, &filter, &mut buffer).expect("export");
        assert_eq!(written, 1);

        let value: Value =
            serde_json::from_str(String::from_utf8(buffer).expect("utf8").trim())
                .expect("parse");
        assert_eq!(value["status"], "running");
    }
}
