use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Label of the sequence entry seeded from the uploaded photo itself.
pub const ORIGINAL_LABEL: &str = "Original";

/// Years a run renders when the caller does not override them.
pub const DEFAULT_FUTURE_YEARS: [&str; 5] = ["2035", "2045", "2055", "2065", "2075"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Loading,
    Ready,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Loading => "loading",
            EntryStatus::Ready => "ready",
            EntryStatus::Error => "error",
        }
    }
}

/// One tracked outcome: the original photo or one target year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedEntry {
    pub label: String,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

impl GeneratedEntry {
    fn loading(label: &str) -> Self {
        Self {
            label: label.to_string(),
            status: EntryStatus::Loading,
            image_url: None,
            error_message: None,
            artifact_path: None,
        }
    }
}

/// The per-run ordered sequence of entries, keyed by label.
///
/// Updates go through the label, never through a position, so settlement
/// order cannot reshuffle the sequence. One entry per label; the Original
/// entry is always first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntrySequence {
    entries: IndexMap<String, GeneratedEntry>,
}

impl EntrySequence {
    /// Build the full sequence for a fresh run: the Original entry already
    /// `ready`, then one `loading` entry per year in the given order.
    /// Blank and duplicate year labels are dropped.
    pub fn seed(original_url: &str, years: &[String]) -> Self {
        let mut entries = IndexMap::new();
        entries.insert(
            ORIGINAL_LABEL.to_string(),
            GeneratedEntry {
                label: ORIGINAL_LABEL.to_string(),
                status: EntryStatus::Ready,
                image_url: Some(original_url.to_string()),
                error_message: None,
                artifact_path: None,
            },
        );
        for year in years {
            let label = year.trim();
            if label.is_empty() || entries.contains_key(label) {
                continue;
            }
            entries.insert(label.to_string(), GeneratedEntry::loading(label));
        }
        Self { entries }
    }

    /// Rebuild a sequence from persisted entries, keeping their order.
    /// Later duplicates of a label overwrite earlier ones.
    pub fn from_entries(entries: impl IntoIterator<Item = GeneratedEntry>) -> Self {
        let mut out = IndexMap::new();
        for entry in entries {
            out.insert(entry.label.clone(), entry);
        }
        Self { entries: out }
    }

    pub fn mark_ready(
        &mut self,
        label: &str,
        image_url: impl Into<String>,
        artifact_path: Option<String>,
    ) -> bool {
        match self.entries.get_mut(label) {
            Some(entry) => {
                entry.status = EntryStatus::Ready;
                entry.image_url = Some(image_url.into());
                entry.error_message = None;
                entry.artifact_path = artifact_path;
                true
            }
            None => false,
        }
    }

    pub fn mark_error(&mut self, label: &str, message: impl Into<String>) -> bool {
        match self.entries.get_mut(label) {
            Some(entry) => {
                entry.status = EntryStatus::Error;
                entry.image_url = None;
                entry.error_message = Some(message.into());
                entry.artifact_path = None;
                true
            }
            None => false,
        }
    }

    /// Roll the sequence back to only the Original entry. Used when the
    /// whole run fails before any per-year call is made.
    pub fn collapse_to_original(&mut self) {
        self.entries.retain(|label, _| label == ORIGINAL_LABEL);
    }

    pub fn get(&self, label: &str) -> Option<&GeneratedEntry> {
        self.entries.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeneratedEntry> {
        self.entries.values()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.iter()
            .filter(|entry| entry.status == EntryStatus::Ready)
            .count()
    }

    /// A sequence is settled once nothing is still `loading`.
    pub fn is_settled(&self) -> bool {
        self.iter()
            .all(|entry| entry.status != EntryStatus::Loading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn years(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|label| label.to_string()).collect()
    }

    #[test]
    fn seed_puts_original_first_then_years_in_order() {
        let sequence = EntrySequence::seed("photo.jpg", &years(&["2035", "2045", "2055"]));

        let labels: Vec<&str> = sequence.labels().collect();
        assert_eq!(labels, vec![ORIGINAL_LABEL, "2035", "2045", "2055"]);

        let original = sequence.get(ORIGINAL_LABEL).unwrap();
        assert_eq!(original.status, EntryStatus::Ready);
        assert_eq!(original.image_url.as_deref(), Some("photo.jpg"));

        for year in ["2035", "2045", "2055"] {
            let entry = sequence.get(year).unwrap();
            assert_eq!(entry.status, EntryStatus::Loading);
            assert!(entry.image_url.is_none());
        }
    }

    #[test]
    fn seed_drops_blank_and_duplicate_labels() {
        let sequence = EntrySequence::seed("photo.jpg", &years(&["2035", " ", "2035", "2045"]));
        let labels: Vec<&str> = sequence.labels().collect();
        assert_eq!(labels, vec![ORIGINAL_LABEL, "2035", "2045"]);
    }

    #[test]
    fn updates_go_by_label_and_preserve_order() {
        let mut sequence = EntrySequence::seed("photo.jpg", &years(&["2035", "2045"]));

        assert!(sequence.mark_error("2045", "service refused"));
        assert!(sequence.mark_ready("2035", "data:image/png;base64,AAAA", None));

        let labels: Vec<&str> = sequence.labels().collect();
        assert_eq!(labels, vec![ORIGINAL_LABEL, "2035", "2045"]);

        let failed = sequence.get("2045").unwrap();
        assert_eq!(failed.status, EntryStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("service refused"));

        let done = sequence.get("2035").unwrap();
        assert_eq!(done.status, EntryStatus::Ready);
        assert!(done.error_message.is_none());
    }

    #[test]
    fn unknown_label_is_rejected() {
        let mut sequence = EntrySequence::seed("photo.jpg", &years(&["2035"]));
        assert!(!sequence.mark_ready("1999", "data:image/png;base64,AAAA", None));
        assert!(!sequence.mark_error("1999", "nope"));
        assert_eq!(sequence.len(), 2);
    }

    #[test]
    fn collapse_keeps_only_original() {
        let mut sequence = EntrySequence::seed("photo.jpg", &years(&["2035", "2045"]));
        sequence.collapse_to_original();

        let labels: Vec<&str> = sequence.labels().collect();
        assert_eq!(labels, vec![ORIGINAL_LABEL]);
        assert_eq!(sequence.get(ORIGINAL_LABEL).unwrap().status, EntryStatus::Ready);
    }

    #[test]
    fn settled_means_no_loading_left() {
        let mut sequence = EntrySequence::seed("photo.jpg", &years(&["2035", "2045"]));
        assert!(!sequence.is_settled());

        sequence.mark_ready("2035", "data:image/png;base64,AAAA", None);
        assert!(!sequence.is_settled());

        sequence.mark_error("2045", "boom");
        assert!(sequence.is_settled());
        assert_eq!(sequence.ready_count(), 2);
    }
}
