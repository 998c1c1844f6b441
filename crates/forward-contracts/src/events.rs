use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::entries::GeneratedEntry;

pub type EventPayload = Map<String, Value>;

/// Append-only writer for a run's `events.jsonl`.
///
/// Every state transition the orchestrator applies is mirrored here, one
/// compact JSON object per line, so anything watching the run directory sees
/// entries flip in the same order the run applied them. Defaults are `event`,
/// `run_id`, `ts`; the caller payload is merged last and may override them.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut record = Map::new();
        record.insert("event".to_string(), Value::String(event.to_string()));
        record.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        record.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            record.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(record))
    }

    /// Emit one `entry_status_changed` line for an entry that just flipped.
    /// Image payloads are never written to the log, only the status and, for
    /// failures, the message.
    pub fn emit_entry_status(&self, entry: &GeneratedEntry) -> anyhow::Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert(
            "label".to_string(),
            Value::String(entry.label.clone()),
        );
        payload.insert(
            "status".to_string(),
            Value::String(entry.status.as_str().to_string()),
        );
        if let Some(message) = entry.error_message.as_deref() {
            payload.insert("error".to_string(), Value::String(message.to_string()));
        }
        if let Some(path) = entry.artifact_path.as_deref() {
            payload.insert(
                "artifact_path".to_string(),
                Value::String(path.to_string()),
            );
        }
        self.emit("entry_status_changed", payload)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use crate::entries::EntrySequence;

    use super::*;

    #[test]
    fn emit_writes_one_compact_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "run-42");

        let mut payload = EventPayload::new();
        payload.insert(
            "out_dir".to_string(),
            Value::String("/tmp/run".to_string()),
        );
        let emitted = log.emit("run_started", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["event"], Value::String("run_started".to_string()));
        assert_eq!(parsed["run_id"], Value::String("run-42".to_string()));
        assert_eq!(parsed["out_dir"], Value::String("/tmp/run".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn emit_appends_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "run-42");

        log.emit("run_started", EventPayload::new())?;
        log.emit("run_settled", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["event"], Value::String("run_started".to_string()));
        assert_eq!(second["event"], Value::String("run_settled".to_string()));
        Ok(())
    }

    #[test]
    fn entry_status_line_carries_message_but_never_pixels() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "run-42");

        let mut sequence =
            EntrySequence::seed("photo.jpg", &["2035".to_string(), "2045".to_string()]);
        sequence.mark_ready("2035", "data:image/png;base64,AAAA", None);
        sequence.mark_error("2045", "service refused");

        let ready = log.emit_entry_status(sequence.get("2035").unwrap())?;
        assert_eq!(ready["status"], Value::String("ready".to_string()));
        assert!(ready.get("error").is_none());
        assert!(!serde_json::to_string(&ready)?.contains("base64"));

        let failed = log.emit_entry_status(sequence.get("2045").unwrap())?;
        assert_eq!(failed["status"], Value::String("error".to_string()));
        assert_eq!(
            failed["error"],
            Value::String("service refused".to_string())
        );
        Ok(())
    }
}
