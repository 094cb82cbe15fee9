//! Memory extraction and compression.
//!
//! After a chapter is written the updater asks the oracle what the new text
//! established and merges the answer into [`StoryMemory`]. Over a long
//! manuscript it periodically asks for a smaller equivalent of the whole
//! memory. Both operations degrade to no-ops when the oracle fails.

use crate::memory::{
    CharacterState, CharacterUpdate, ItemRecord, LocationRecord, LocationUpdate, MemoryStats,
    PlotThread, StoryMemory, ThreadUpdate, TimelineEntry,
};
use crate::oracle::{ModelTier, OracleClient, OracleOptions};
use crate::parse::{decode, decode_object, lenient_map, lenient_strings};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Timeline entries added since the last compression that trigger another.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 10;

const EXTRACT_MAX_TOKENS: usize = 2000;
const COMPRESS_MAX_TOKENS: usize = 4000;

/// Everything the oracle says a chapter established.
///
/// Each field decodes on its own; a malformed field is empty rather than
/// spoiling the rest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryDelta {
    #[serde(deserialize_with = "lenient_strings")]
    pub new_events: Vec<String>,
    #[serde(deserialize_with = "lenient_map")]
    pub character_updates: BTreeMap<String, CharacterUpdate>,
    #[serde(deserialize_with = "lenient_strings")]
    pub new_facts: Vec<String>,
    #[serde(deserialize_with = "lenient_map")]
    pub plot_thread_updates: BTreeMap<String, ThreadUpdate>,
    #[serde(deserialize_with = "lenient_strings")]
    pub continuity_issues: Vec<String>,
    #[serde(deserialize_with = "lenient_map")]
    pub locations: BTreeMap<String, LocationUpdate>,
    #[serde(deserialize_with = "lenient_map")]
    pub items: BTreeMap<String, Map<String, Value>>,
}

impl MemoryDelta {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Options for [`MemoryUpdater::update_memory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Compress afterwards if enough timeline entries accumulated.
    pub auto_compress: bool,
}

/// What an update changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub chapter: u32,
    /// False when the oracle failed or its reply was unusable.
    pub applied: bool,
    pub events_added: usize,
    pub facts_added: usize,
    pub characters_updated: usize,
    pub threads_updated: usize,
    pub locations_updated: usize,
    pub items_updated: usize,
    /// Problems the extraction noticed in the new text.
    pub continuity_issues: Vec<String>,
    pub compression: Option<CompressionReport>,
    pub error: Option<String>,
}

/// What a compression pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionReport {
    pub success: bool,
    /// Top-level collections that were replaced.
    pub replaced: Vec<String>,
    pub before: MemoryStats,
    pub after: MemoryStats,
    pub error: Option<String>,
}

/// Extracts deltas from new prose and compresses memory.
#[derive(Clone)]
pub struct MemoryUpdater {
    client: OracleClient,
    compress_threshold: usize,
    /// Timeline length right after the last compression attempt.
    compressed_at: usize,
    extraction_tier: ModelTier,
    compression_tier: ModelTier,
}

impl MemoryUpdater {
    pub fn new(client: OracleClient) -> Self {
        Self {
            client,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            compressed_at: 0,
            extraction_tier: ModelTier::Fast,
            compression_tier: ModelTier::Fast,
        }
    }

    /// Route extraction and compression calls to the given tiers.
    pub fn with_tiers(mut self, extraction: ModelTier, compression: ModelTier) -> Self {
        self.extraction_tier = extraction;
        self.compression_tier = compression;
        self
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold.max(1);
        self
    }

    /// Forget the compression marker (used when switching projects).
    pub fn reset(&mut self) {
        self.compressed_at = 0;
    }

    /// Whether enough timeline entries accumulated to compress.
    pub fn needs_compression(&self, memory: &StoryMemory) -> bool {
        memory.timeline().len().saturating_sub(self.compressed_at) >= self.compress_threshold
    }

    /// Extract what `content` established for `chapter` and merge it.
    pub async fn update_memory(
        &mut self,
        memory: &mut StoryMemory,
        chapter: u32,
        content: &str,
        options: UpdateOptions,
    ) -> UpdateReport {
        let prompt = build_extract_prompt(memory, chapter, content);
        let mut report = UpdateReport {
            chapter,
            ..UpdateReport::default()
        };

        let delta = match self
            .client
            .ask(
                &prompt,
                &OracleOptions::structured(EXTRACT_MAX_TOKENS).with_tier(self.extraction_tier),
            )
            .await
        {
            Ok(completion) => match decode::<MemoryDelta>(&completion.text) {
                Ok(delta) => {
                    report.applied = true;
                    delta
                }
                Err(failure) => {
                    warn!(chapter, %failure, "unusable extraction reply; memory left as is");
                    report.error = Some(failure.to_string());
                    MemoryDelta::default()
                }
            },
            Err(e) => {
                warn!(chapter, error = %e, "memory extraction failed; memory left as is");
                report.error = Some(e.to_string());
                MemoryDelta::default()
            }
        };

        apply_delta(memory, chapter, delta, &mut report);
        debug!(
            chapter,
            events = report.events_added,
            facts = report.facts_added,
            characters = report.characters_updated,
            "memory updated"
        );

        if options.auto_compress && self.needs_compression(memory) {
            info!(
                chapter,
                timeline = memory.timeline().len(),
                "compression threshold reached"
            );
            report.compression = Some(self.compress_memory(memory).await);
        }

        report
    }

    /// Replace memory with a smaller oracle-produced equivalent.
    ///
    /// Each top-level collection is replaced only when the reply carries a
    /// well-formed value for it; otherwise it is kept as it was.
    pub async fn compress_memory(&mut self, memory: &mut StoryMemory) -> CompressionReport {
        let before = memory.stats();
        let mut report = CompressionReport {
            before,
            after: before,
            ..CompressionReport::default()
        };

        let prompt = build_compress_prompt(memory);
        let result = self
            .client
            .ask(
                &prompt,
                &OracleOptions::structured(COMPRESS_MAX_TOKENS).with_tier(self.compression_tier),
            )
            .await;
        self.compressed_at = memory.timeline().len();

        let object = match result {
            Ok(completion) => match decode_object(&completion.text) {
                Ok(object) => object,
                Err(failure) => {
                    warn!(%failure, "unusable compression reply; memory unchanged");
                    report.error = Some(failure.to_string());
                    return report;
                }
            },
            Err(e) => {
                warn!(error = %e, "compression failed; memory unchanged");
                report.error = Some(e.to_string());
                return report;
            }
        };

        if let Some(timeline) = field::<Vec<TimelineEntry>>(&object, "timeline") {
            memory.replace_timeline(timeline);
            report.replaced.push("timeline".into());
        }
        if let Some(states) = field::<BTreeMap<String, CharacterState>>(&object, "characterStates")
        {
            memory.replace_character_states(states);
            report.replaced.push("characterStates".into());
        }
        if let Some(facts) = field::<Vec<String>>(&object, "establishedFacts") {
            memory.replace_established_facts(facts);
            report.replaced.push("establishedFacts".into());
        }
        if let Some(threads) = field::<BTreeMap<String, PlotThread>>(&object, "plotThreads") {
            memory.replace_plot_threads(threads);
            report.replaced.push("plotThreads".into());
        }
        if let Some(locations) = field::<BTreeMap<String, LocationRecord>>(&object, "locations") {
            memory.replace_locations(locations);
            report.replaced.push("locations".into());
        }
        if let Some(items) = field::<BTreeMap<String, ItemRecord>>(&object, "items") {
            memory.replace_items(items);
            report.replaced.push("items".into());
        }

        // Compression may shrink the timeline; measure from what is left.
        self.compressed_at = memory.timeline().len();
        report.success = true;
        report.after = memory.stats();
        info!(before = ?report.before, after = ?report.after, "memory compressed");
        report
    }
}

/// Merge a delta through the store's mutators, counting what changed.
fn apply_delta(
    memory: &mut StoryMemory,
    chapter: u32,
    delta: MemoryDelta,
    report: &mut UpdateReport,
) {
    let chapter = Some(chapter);

    let events = delta.new_events.len();
    if memory.append_timeline_events(chapter, delta.new_events) {
        report.events_added = events;
    }

    report.characters_updated = delta.character_updates.len();
    for (name, update) in delta.character_updates {
        memory.upsert_character_state(&name, update, chapter);
    }

    report.facts_added = memory.register_established_facts(delta.new_facts);

    report.threads_updated = delta.plot_thread_updates.len();
    memory.merge_plot_threads(delta.plot_thread_updates, chapter);

    report.locations_updated = delta.locations.len();
    memory.merge_locations(delta.locations, chapter);

    report.items_updated = delta.items.len();
    memory.merge_items(delta.items, chapter);

    report.continuity_issues = delta.continuity_issues;
}

/// Decode one top-level field, or `None` if absent or malformed.
fn field<T: DeserializeOwned>(object: &Map<String, Value>, key: &str) -> Option<T> {
    let value = object.get(key)?;
    match serde_json::from_value(value.clone()) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!(key, error = %e, "compressed field rejected");
            None
        }
    }
}

fn build_extract_prompt(memory: &StoryMemory, chapter: u32, content: &str) -> String {
    let memory_json = serde_json::to_string_pretty(memory).unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"You maintain the continuity record of a novel. Read chapter {chapter} and report what it establishes that the record does not already contain.

## Current Story Memory
{memory_json}

## Chapter {chapter}
{content}

## Instructions
Extract only what the chapter text states or clearly implies. Use existing names for characters, threads and locations when they refer to the same thing.

Respond with ONLY a JSON object (no markdown, no explanation outside the JSON):
{{
  "newEvents": ["what happened, in order"],
  "characterUpdates": {{"Name": {{"knowledge": ["what they learned"], "location": "where they are", "relationships": {{"Other": "how they relate"}}, "notes": ["anything else"]}}}},
  "newFacts": ["facts that must stay true from now on"],
  "plotThreadUpdates": {{"Thread name": {{"state": "open|resolved|abandoned", "note": "what changed"}}}},
  "continuityIssues": ["contradictions with the record"],
  "locations": {{"Place": {{"details": ["what we learned about it"]}}}},
  "items": {{"Object": {{"owner": "who has it"}}}}
}}

Use empty arrays and objects for anything the chapter does not touch."#
    )
}

fn build_compress_prompt(memory: &StoryMemory) -> String {
    let memory_json = serde_json::to_string_pretty(memory).unwrap_or_else(|_| "{}".to_string());

    format!(
        r#"You maintain the continuity record of a long novel. The record below has grown large. Rewrite it as an equivalent but smaller record.

## Current Story Memory
{memory_json}

## Instructions
- Merge timeline entries of the same chapter and summarize minor events, keeping chapterNumber on every entry.
- Drop duplicate or superseded character knowledge; keep current locations and relationships.
- Merge facts that say the same thing. Never drop a fact that is still true.
- Keep every open plot thread.

Respond with ONLY a JSON object with the same keys and shapes as the input (timeline, characterStates, establishedFacts, plotThreads, locations, items). Omit a key to leave that part unchanged."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOracle;
    use std::sync::Arc;

    fn scripted_updater(oracle: ScriptedOracle) -> (MemoryUpdater, Arc<ScriptedOracle>) {
        let oracle = Arc::new(oracle);
        (MemoryUpdater::new(OracleClient::new(oracle.clone())), oracle)
    }

    #[tokio::test]
    async fn test_update_applies_delta() {
        let reply = r#"Here you go:
{
  "newEvents": ["Mara opens the vault"],
  "characterUpdates": {"Mara": {"knowledge": ["the code"], "location": "Vault"}, "Ilya": 5},
  "newFacts": ["The vault is empty"],
  "plotThreadUpdates": {"The heist": "resolved", "The debt": {"state": "open", "note": "interest grows"}},
  "continuityIssues": ["Mara was in the harbor a moment ago"],
  "locations": {"Vault": ["cold"]},
  "items": {"Ledger": {"owner": "Mara"}}
}"#;
        let (mut updater, _) = scripted_updater(ScriptedOracle::new(vec![reply.to_string()]));
        let mut memory = StoryMemory::new();

        let report = updater
            .update_memory(&mut memory, 4, "chapter text", UpdateOptions::default())
            .await;

        assert!(report.applied);
        assert_eq!(report.events_added, 1);
        assert_eq!(report.facts_added, 1);
        assert_eq!(report.characters_updated, 1);
        assert_eq!(report.continuity_issues.len(), 1);

        assert_eq!(memory.timeline()[0].chapter_number, Some(4));
        let mara = memory.character("Mara").unwrap();
        assert_eq!(mara.location.as_deref(), Some("Vault"));
        assert_eq!(mara.last_seen, Some(4));
        assert!(memory.character("Ilya").is_none());
        assert_eq!(memory.plot_threads()["The heist"].resolved, Some(4));
        assert_eq!(memory.plot_threads()["The debt"].notes, vec!["interest grows"]);
        assert_eq!(memory.locations()["Vault"].details, vec!["cold"]);
        assert_eq!(memory.items()["Ledger"].last_seen, Some(4));
    }

    #[tokio::test]
    async fn test_update_with_invalid_reply_is_noop() {
        for oracle in [
            ScriptedOracle::new(vec!["not json at all".to_string()]),
            ScriptedOracle::new(vec![r#"{"newEvents": ["A""#.to_string()]),
            ScriptedOracle::failing(),
        ] {
            let (mut updater, _) = scripted_updater(oracle);
            let mut memory = StoryMemory::new();
            memory.register_established_facts(["known"]);
            let before = memory.clone();

            let report = updater
                .update_memory(&mut memory, 2, "text", UpdateOptions::default())
                .await;

            assert!(!report.applied);
            assert!(report.error.is_some());
            assert_eq!(memory, before);
        }
    }

    #[tokio::test]
    async fn test_compress_replaces_present_well_formed_fields() {
        let reply = r#"{
            "timeline": [{"chapterNumber": 1, "events": ["Everything in chapter one"]}],
            "establishedFacts": ["F", "F", "G"],
            "plotThreads": "garbage"
        }"#;
        let (mut updater, _) = scripted_updater(ScriptedOracle::new(vec![reply.to_string()]));

        let mut memory = StoryMemory::new();
        memory.append_timeline_events(Some(1), vec!["a".into()]);
        memory.append_timeline_events(Some(1), vec!["b".into()]);
        let mut threads = BTreeMap::new();
        threads.insert("Quest".to_string(), ThreadUpdate::status("open"));
        memory.merge_plot_threads(threads, Some(1));
        let threads_before = memory.plot_threads().clone();

        let report = updater.compress_memory(&mut memory).await;

        assert!(report.success);
        assert_eq!(report.replaced, vec!["timeline", "establishedFacts"]);
        assert_eq!(memory.timeline().len(), 1);
        assert_eq!(memory.established_facts(), &["F", "G"]);
        assert_eq!(memory.plot_threads(), &threads_before);
        assert_eq!(report.before.timeline, 2);
        assert_eq!(report.after.timeline, 1);
    }

    #[tokio::test]
    async fn test_compress_with_invalid_reply_keeps_memory() {
        let (mut updater, _) =
            scripted_updater(ScriptedOracle::new(vec!["Sorry, too long.".to_string()]));
        let mut memory = StoryMemory::new();
        memory.append_timeline_events(Some(1), vec!["a".into()]);
        memory.register_established_facts(["F"]);
        let before = memory.clone();

        let report = updater.compress_memory(&mut memory).await;

        assert!(!report.success);
        assert_eq!(memory, before);
    }

    #[tokio::test]
    async fn test_calls_use_routed_tiers() {
        let (updater, oracle) = scripted_updater(ScriptedOracle::default().with_fallback("{}"));
        let mut updater = updater.with_tiers(ModelTier::Creative, ModelTier::Fast);
        let mut memory = StoryMemory::new();

        updater
            .update_memory(&mut memory, 1, "t", UpdateOptions::default())
            .await;
        updater.compress_memory(&mut memory).await;

        let tiers: Vec<_> = oracle.calls().iter().map(|c| c.tier).collect();
        assert_eq!(tiers, vec![ModelTier::Creative, ModelTier::Fast]);
    }

    #[tokio::test]
    async fn test_auto_compress_after_threshold() {
        let oracle = ScriptedOracle::default()
            .with_rule("smaller record", r#"{"timeline": []}"#)
            .with_fallback(r#"{"newEvents": ["something"]}"#);
        let (updater, oracle) = scripted_updater(oracle);
        let mut updater = updater.with_compress_threshold(3);
        let mut memory = StoryMemory::new();
        let options = UpdateOptions { auto_compress: true };

        for chapter in 1..=2 {
            let report = updater.update_memory(&mut memory, chapter, "t", options).await;
            assert!(report.compression.is_none());
        }

        let report = updater.update_memory(&mut memory, 3, "t", options).await;
        let compression = report.compression.unwrap();
        assert!(compression.success);
        assert!(memory.timeline().is_empty());
        assert_eq!(oracle.call_count(), 4);

        // The marker restarts from the compressed size.
        let report = updater.update_memory(&mut memory, 4, "t", options).await;
        assert!(report.compression.is_none());
    }

    #[test]
    fn test_delta_tolerates_wrong_shapes() {
        let delta: MemoryDelta =
            decode(r#"{"newEvents": "one event", "newFacts": {"x": 1}, "locations": []}"#).unwrap();
        assert_eq!(delta.new_events, vec!["one event"]);
        assert!(delta.new_facts.is_empty());
        assert!(delta.locations.is_empty());
        assert!(MemoryDelta::default().is_empty());
    }
}
