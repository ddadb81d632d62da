//! Records returned by backends: state revisions, runs and workspaces.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the body of a revision can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Locator {
    /// Hosted API download URL.
    Url(String),
    /// Local file path.
    Path(PathBuf),
    /// Object store version id of the backend's state key.
    ObjectVersion(String),
    /// No body location is known.
    #[default]
    None,
}

/// One historical snapshot of a state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// Backend-specific identity: state version id, filename or object version id.
    pub id: String,
    /// When the revision was created.
    pub created_at: DateTime<Utc>,
    /// The document's own revision counter.
    pub serial: i64,
    /// Where to fetch the body from.
    pub locator: Locator,
    /// Raw attributes reported by the hosted API, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl RevisionRecord {
    /// A record with no extra detail.
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>, serial: i64, locator: Locator) -> Self {
        Self {
            id: id.into(),
            created_at,
            serial,
            locator,
            detail: None,
        }
    }
}

/// Sort records so index 0 is the most recent.
pub fn sort_newest_first(records: &mut [RevisionRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// One run in the hosted API's run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub id: String,
    /// Run status, e.g. `applied`.
    pub status: String,
    /// When the run was created.
    pub created_at: Option<DateTime<Utc>>,
    /// Run message.
    pub message: String,
    /// Raw attributes reported by the hosted API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// A hosted API workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    /// Workspace id.
    pub id: String,
    /// Workspace name.
    pub name: String,
    /// Id of the workspace's current state version.
    pub current_state_version: Option<String>,
    /// Raw attributes reported by the hosted API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Serial embedded in a state document, or 0 when it has none or does not parse.
pub fn document_serial(body: &[u8]) -> i64 {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default)]
        serial: Option<serde_json::Number>,
    }

    serde_json::from_slice::<Probe>(body)
        .ok()
        .and_then(|p| p.serial)
        .and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_sort_newest_first() {
        let mut records = vec![
            RevisionRecord::new("a", at(10), 1, Locator::None),
            RevisionRecord::new("c", at(30), 3, Locator::None),
            RevisionRecord::new("b", at(20), 2, Locator::None),
        ];
        sort_newest_first(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn test_document_serial() {
        assert_eq!(document_serial(br#"{"version":4,"serial":42}"#), 42);
        assert_eq!(document_serial(br#"{"serial":7.0}"#), 7);
        assert_eq!(document_serial(br#"{"version":4}"#), 0);
        assert_eq!(document_serial(b"not json"), 0);
        assert_eq!(document_serial(b""), 0);
    }

    #[test]
    fn test_locator_serialization() {
        let json = serde_json::to_value(Locator::Url("https://x".to_string())).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "url", "value": "https://x"}));
    }
}
