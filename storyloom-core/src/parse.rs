//! Decoding of oracle output.
//!
//! Model replies are free-form text that may or may not carry a JSON object.
//! [`decode`] yields either a validated value or an explicit [`ParseFailure`];
//! the `lenient_*` helpers keep one bad field from sinking a whole reply.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Longest excerpt of a bad payload kept for logs.
const EXCERPT_CHARS: usize = 160;

/// The oracle reply could not be decoded into the expected shape.
#[derive(Debug, Clone, Error)]
#[error("{reason} (payload: {excerpt:?})")]
pub struct ParseFailure {
    pub reason: String,
    pub excerpt: String,
}

impl ParseFailure {
    fn new(reason: impl Into<String>, payload: &str) -> Self {
        Self {
            reason: reason.into(),
            excerpt: payload.chars().take(EXCERPT_CHARS).collect(),
        }
    }
}

/// Either a decoded value or the reason it could not be decoded.
pub type ParseResult<T> = Result<T, ParseFailure>;

/// Decode an oracle reply into `T`.
///
/// The reply must contain a JSON object; surrounding prose and markdown
/// fences are ignored.
pub fn decode<T: DeserializeOwned>(text: &str) -> ParseResult<T> {
    let json = extract_json(text);
    if !json.starts_with('{') {
        return Err(ParseFailure::new("no JSON object in reply", text));
    }
    serde_json::from_str(json).map_err(|e| ParseFailure::new(e.to_string(), json))
}

/// Decode an oracle reply into a raw JSON object.
pub fn decode_object(text: &str) -> ParseResult<Map<String, Value>> {
    decode(text)
}

/// Extract JSON from a response that might have markdown code blocks or prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // ```json ... ```
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // ``` ... ``` without a language tag
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Prose around a bare object
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

/// Render a JSON scalar as plain text; strings lose their quotes.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A list of strings. Non-arrays become empty, a bare string becomes one item,
/// non-string items are stringified, blanks are dropped.
pub fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(strings_from_value(&value))
}

/// Like [`lenient_strings`] but for an optional value.
pub fn strings_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(stringify)
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// A JSON object. Anything else becomes empty.
pub fn lenient_object<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// A name-keyed map whose entries decode independently; bad entries are dropped.
pub fn lenient_map<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Object(map) = Value::deserialize(deserializer)? else {
        return Ok(BTreeMap::new());
    };

    Ok(map
        .into_iter()
        .filter(|(name, _)| !name.trim().is_empty())
        .filter_map(|(name, value)| serde_json::from_value(value).ok().map(|v| (name, v)))
        .collect())
}

/// A list whose items decode independently; bad items are dropped.
pub fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };

    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

/// An optional string; numbers are stringified, blanks and other shapes are `None`.
pub fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// An optional chapter number; accepts integers and numeric strings.
pub fn lenient_chapter<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(chapter_from_value(&value))
}

pub(crate) fn chapter_from_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A boolean; anything other than `true` is `false`.
pub fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(matches!(Value::deserialize(deserializer)?, Value::Bool(true)))
}
