//! Record types held by the story memory and the deltas that update them.

use crate::parse::{
    lenient_chapter, lenient_object, lenient_string, lenient_strings, strings_from_value,
};
use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One append-only timeline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// Chapter the events belong to; may be absent, repeated or out of order.
    #[serde(default, alias = "chapter", deserialize_with = "lenient_chapter")]
    pub chapter_number: Option<u32>,
    #[serde(default, deserialize_with = "lenient_strings")]
    pub events: Vec<String>,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(chapter_number: Option<u32>, events: Vec<String>) -> Self {
        Self {
            chapter_number,
            events,
            recorded_at: Utc::now(),
        }
    }
}

/// What the story has established about one character.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterState {
    /// Things the character knows, without exact duplicates.
    #[serde(deserialize_with = "lenient_strings")]
    pub knowledge: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub location: Option<String>,
    #[serde(deserialize_with = "lenient_object")]
    pub relationships: Map<String, Value>,
    /// Latest chapter the character appeared in; `None` if never seen.
    #[serde(deserialize_with = "lenient_chapter")]
    pub last_seen: Option<u32>,
    #[serde(deserialize_with = "lenient_strings")]
    pub notes: Vec<String>,
}

/// Changes to a character extracted from new prose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterUpdate {
    #[serde(alias = "newKnowledge", deserialize_with = "lenient_strings")]
    pub knowledge: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub location: Option<String>,
    #[serde(deserialize_with = "lenient_object")]
    pub relationships: Map<String, Value>,
    #[serde(deserialize_with = "lenient_strings")]
    pub notes: Vec<String>,
}

impl CharacterUpdate {
    pub fn knowing(knowledge: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            knowledge: knowledge.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Status of a plot thread. Unknown labels are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ThreadStatus {
    #[default]
    Open,
    Resolved,
    Abandoned,
    Other(String),
}

impl ThreadStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ThreadStatus::Open)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ThreadStatus::Resolved)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ThreadStatus::Open => "open",
            ThreadStatus::Resolved => "resolved",
            ThreadStatus::Abandoned => "abandoned",
            ThreadStatus::Other(label) => label,
        }
    }
}

impl From<&str> for ThreadStatus {
    fn from(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "open" | "active" | "ongoing" => ThreadStatus::Open,
            "resolved" | "closed" | "done" => ThreadStatus::Resolved,
            "abandoned" | "dropped" => ThreadStatus::Abandoned,
            _ => ThreadStatus::Other(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ThreadStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ThreadStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::String(s) if !s.trim().is_empty() => ThreadStatus::from(s.as_str()),
            _ => ThreadStatus::Open,
        })
    }
}

/// A narrative thread and where it stands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlotThread {
    #[serde(deserialize_with = "lenient_chapter")]
    pub introduced: Option<u32>,
    /// Chapter the thread was resolved in; only set on a transition to resolved.
    #[serde(deserialize_with = "lenient_chapter")]
    pub resolved: Option<u32>,
    pub status: ThreadStatus,
    #[serde(deserialize_with = "lenient_string")]
    pub importance: Option<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub notes: Vec<String>,
}

impl PlotThread {
    /// Short human description for prompts.
    pub fn describe(&self, name: &str) -> String {
        match self.notes.last() {
            Some(note) => format!("{name} ({}): {note}", self.status),
            None => format!("{name} ({})", self.status),
        }
    }
}

/// A thread change: either a bare status or a status with a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThreadUpdate {
    Status(String),
    Detailed {
        #[serde(default, alias = "status", deserialize_with = "lenient_string")]
        state: Option<String>,
        #[serde(default, deserialize_with = "lenient_string")]
        note: Option<String>,
        #[serde(default, deserialize_with = "lenient_string")]
        importance: Option<String>,
    },
}

impl ThreadUpdate {
    pub fn status(status: impl Into<String>) -> Self {
        ThreadUpdate::Status(status.into())
    }

    pub fn with_note(state: impl Into<String>, note: impl Into<String>) -> Self {
        ThreadUpdate::Detailed {
            state: Some(state.into()),
            note: Some(note.into()),
            importance: None,
        }
    }
}

/// A setting and the details established about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationRecord {
    #[serde(deserialize_with = "lenient_chapter")]
    pub introduced: Option<u32>,
    #[serde(deserialize_with = "lenient_strings")]
    pub details: Vec<String>,
}

/// New details about a location.
///
/// Accepts a list of strings, a single string, or an object with
/// `details` and/or `description`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationUpdate {
    pub details: Vec<String>,
}

impl LocationUpdate {
    pub fn new(details: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            details: details.into_iter().map(Into::into).collect(),
        }
    }
}

impl<'de> Deserialize<'de> for LocationUpdate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let details = match &value {
            Value::Object(map) => {
                let mut details = map.get("details").map(strings_from_value).unwrap_or_default();
                if let Some(Value::String(description)) = map.get("description") {
                    if !description.trim().is_empty() {
                        details.push(description.clone());
                    }
                }
                details
            }
            other => strings_from_value(other),
        };
        Ok(Self { details })
    }
}

/// Free-form metadata about an object in the story.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemRecord {
    #[serde(deserialize_with = "lenient_object")]
    pub attributes: Map<String, Value>,
    #[serde(deserialize_with = "lenient_chapter")]
    pub last_seen: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_status_labels() {
        assert_eq!(ThreadStatus::from("Resolved"), ThreadStatus::Resolved);
        assert_eq!(ThreadStatus::from(" open "), ThreadStatus::Open);
        assert_eq!(
            ThreadStatus::from("simmering"),
            ThreadStatus::Other("simmering".to_string())
        );
        assert_eq!(ThreadStatus::Other("simmering".into()).to_string(), "simmering");
    }

    #[test]
    fn test_thread_update_shapes() {
        let bare: ThreadUpdate = serde_json::from_str(r#""resolved""#).unwrap();
        assert_eq!(bare, ThreadUpdate::status("resolved"));

        let detailed: ThreadUpdate =
            serde_json::from_str(r#"{"status": "open", "note": "the letter resurfaces"}"#).unwrap();
        assert_eq!(detailed, ThreadUpdate::with_note("open", "the letter resurfaces"));
    }

    #[test]
    fn test_location_update_shapes() {
        let list: LocationUpdate = serde_json::from_str(r#"["cold", "quiet"]"#).unwrap();
        assert_eq!(list.details, vec!["cold", "quiet"]);

        let single: LocationUpdate = serde_json::from_str(r#""smells of salt""#).unwrap();
        assert_eq!(single.details, vec!["smells of salt"]);

        let object: LocationUpdate =
            serde_json::from_str(r#"{"details": ["narrow"], "description": "a fishing town"}"#)
                .unwrap();
        assert_eq!(object.details, vec!["narrow", "a fishing town"]);
    }

    #[test]
    fn test_timeline_entry_accepts_chapter_alias() {
        let entry: TimelineEntry =
            serde_json::from_str(r#"{"chapter": 4, "events": ["storm"]}"#).unwrap();
        assert_eq!(entry.chapter_number, Some(4));
        assert_eq!(entry.events, vec!["storm"]);
    }
}
