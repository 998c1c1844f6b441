use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::entries::{EntrySequence, GeneratedEntry};

pub const SUMMARY_SCHEMA_VERSION: u64 = 1;

/// Terminal record of one run, written as `summary.json` in the run
/// directory. Inline image payloads are never persisted; a ready entry is
/// re-displayable through its artifact path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub source_image: String,
    pub entries: Vec<GeneratedEntry>,
}

impl RunSummary {
    pub fn from_sequence(
        run_id: impl Into<String>,
        started_at: impl Into<String>,
        source_image: impl Into<String>,
        sequence: &EntrySequence,
    ) -> Self {
        Self {
            schema_version: SUMMARY_SCHEMA_VERSION,
            run_id: run_id.into(),
            started_at: started_at.into(),
            finished_at: now_utc_iso(),
            source_image: source_image.into(),
            entries: sequence.iter().map(sanitize_entry).collect(),
        }
    }

    /// Rebuild the entry sequence this summary recorded, in order.
    pub fn sequence(&self) -> EntrySequence {
        EntrySequence::from_entries(self.entries.iter().cloned())
    }
}

/// Swap an inline `data:` display URL for the artifact path before
/// persisting; everything else passes through untouched.
fn sanitize_entry(entry: &GeneratedEntry) -> GeneratedEntry {
    let mut out = entry.clone();
    if out
        .image_url
        .as_deref()
        .map(|url| url.starts_with("data:"))
        .unwrap_or(false)
    {
        out.image_url = out.artifact_path.clone();
    }
    out
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}

pub fn load_summary(path: &Path) -> anyhow::Result<RunSummary> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("failed reading {}: {err}", path.display()))?;
    let summary: RunSummary = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("invalid summary at {}: {err}", path.display()))?;
    Ok(summary)
}

fn default_schema_version() -> u64 {
    SUMMARY_SCHEMA_VERSION
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use crate::entries::{EntryStatus, ORIGINAL_LABEL};

    use super::*;

    #[test]
    fn summary_round_trips_order_and_statuses() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut sequence =
            EntrySequence::seed("photo.jpg", &["2035".to_string(), "2045".to_string()]);
        sequence.mark_ready(
            "2035",
            "data:image/png;base64,AAAA",
            Some("portrait-2035.png".to_string()),
        );
        sequence.mark_error("2045", "service refused");

        let summary = RunSummary::from_sequence(
            "run-42",
            "2026-08-01T00:00:00+00:00",
            "photo.jpg",
            &sequence,
        );
        write_summary(&path, &summary)?;
        let reloaded = load_summary(&path)?;

        assert_eq!(reloaded.schema_version, SUMMARY_SCHEMA_VERSION);
        assert_eq!(reloaded.run_id, "run-42");
        assert_eq!(reloaded.source_image, "photo.jpg");

        let rebuilt = reloaded.sequence();
        let labels: Vec<&str> = rebuilt.labels().collect();
        assert_eq!(labels, vec![ORIGINAL_LABEL, "2035", "2045"]);
        assert_eq!(rebuilt.get("2035").unwrap().status, EntryStatus::Ready);
        assert_eq!(rebuilt.get("2045").unwrap().status, EntryStatus::Error);
        Ok(())
    }

    #[test]
    fn inline_payloads_are_not_persisted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let mut sequence = EntrySequence::seed("photo.jpg", &["2035".to_string()]);
        sequence.mark_ready(
            "2035",
            "data:image/png;base64,AAAAAAAA",
            Some("portrait-2035.png".to_string()),
        );

        let summary =
            RunSummary::from_sequence("run-42", "2026-08-01T00:00:00+00:00", "photo.jpg", &sequence);
        write_summary(&path, &summary)?;

        let raw = std::fs::read_to_string(&path)?;
        assert!(!raw.contains("base64"));

        let reloaded = load_summary(&path)?;
        assert_eq!(
            reloaded.sequence().get("2035").unwrap().image_url.as_deref(),
            Some("portrait-2035.png")
        );
        Ok(())
    }

    #[test]
    fn loading_a_missing_file_names_the_path() {
        let err = load_summary(Path::new("/nonexistent/summary.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/summary.json"));
    }
}
