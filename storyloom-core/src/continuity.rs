//! Continuity checking of planned text against story memory.
//!
//! Only a window of memory around the target chapter is sent to the oracle,
//! never the full history. The checker reads memory and never mutates it.

use crate::memory::{CharacterState, LocationRecord, PlotThread, StoryMemory, TimelineEntry};
use crate::oracle::{ModelTier, OracleClient, OracleOptions};
use crate::parse::{decode, lenient_bool, lenient_list, lenient_string, lenient_strings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Chapters on either side of the target included in the window.
pub const DEFAULT_WINDOW: u32 = 3;

/// Most recent facts included in a check.
pub const DEFAULT_FACT_LIMIT: usize = 8;

/// Maximum tokens for a check response.
const CHECK_MAX_TOKENS: usize = 1500;

/// Warning attached when the oracle could not be consulted.
const UNAVAILABLE_WARNING: &str = "Continuity check unavailable; proceeding without verification";

/// The slice of memory relevant to one chapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelevantMemory {
    pub chapter: u32,
    pub window: u32,
    pub timeline: Vec<TimelineEntry>,
    pub characters: BTreeMap<String, CharacterState>,
    pub open_threads: BTreeMap<String, PlotThread>,
    pub facts: Vec<String>,
    pub locations: BTreeMap<String, LocationRecord>,
}

/// One inconsistency reported by the oracle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuityIssue {
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub issue_type: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub detail: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub suggestion: Option<String>,
}

impl ContinuityIssue {
    pub fn kind(&self) -> &str {
        self.issue_type.as_deref().unwrap_or("continuity")
    }

    /// `TYPE: suggestion`, falling back to the detail.
    pub fn as_fix_instruction(&self) -> String {
        let advice = self
            .suggestion
            .as_deref()
            .or(self.detail.as_deref())
            .unwrap_or("resolve the inconsistency");
        format!("{}: {}", self.kind().to_uppercase(), advice)
    }
}

/// Outcome of a check. Issues are data for the caller to act on.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuityReport {
    pub chapter: u32,
    pub issues: Vec<ContinuityIssue>,
    pub warnings: Vec<String>,
    /// Never true while issues are present.
    pub cleared: bool,
    /// False when the oracle could not be consulted or its reply was unusable.
    pub checked: bool,
}

impl ContinuityReport {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    fn unavailable(chapter: u32) -> Self {
        Self {
            chapter,
            warnings: vec![UNAVAILABLE_WARNING.to_string()],
            ..Self::default()
        }
    }
}

/// Response format we expect from the oracle.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CheckResponse {
    #[serde(deserialize_with = "lenient_list")]
    issues: Vec<ContinuityIssue>,
    #[serde(deserialize_with = "lenient_strings")]
    warnings: Vec<String>,
    #[serde(deserialize_with = "lenient_bool")]
    cleared: bool,
}

/// Per-call overrides for [`ContinuityChecker::check_before_writing`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckOptions {
    pub window: Option<u32>,
    pub tier: ModelTier,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            window: None,
            tier: ModelTier::Fast,
        }
    }
}

/// Asks the oracle whether planned text fits what is known so far.
#[derive(Clone)]
pub struct ContinuityChecker {
    client: OracleClient,
    window: u32,
    fact_limit: usize,
    temperature: f32,
}

impl ContinuityChecker {
    pub fn new(client: OracleClient) -> Self {
        Self {
            client,
            window: DEFAULT_WINDOW,
            fact_limit: DEFAULT_FACT_LIMIT,
            temperature: 0.0,
        }
    }

    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    pub fn with_fact_limit(mut self, limit: usize) -> Self {
        self.fact_limit = limit;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Windowed memory around `chapter`.
    ///
    /// Timeline rows tagged within `window` chapters (or untagged),
    /// characters seen within `window + 1` chapters (or never seen), open
    /// threads, the most recent facts, and every location.
    pub fn relevant_memory(
        &self,
        memory: &StoryMemory,
        chapter: u32,
        window: u32,
    ) -> RelevantMemory {
        let low = chapter.saturating_sub(window);
        let high = chapter.saturating_add(window);

        let timeline = memory
            .timeline()
            .iter()
            .filter(|entry| entry.chapter_number.map_or(true, |c| (low..=high).contains(&c)))
            .cloned()
            .collect();

        let characters = memory
            .character_states()
            .iter()
            .filter(|(_, state)| {
                state
                    .last_seen
                    .map_or(true, |seen| seen.abs_diff(chapter) <= window.saturating_add(1))
            })
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect();

        let open_threads = memory
            .open_threads()
            .map(|(name, thread)| (name.clone(), thread.clone()))
            .collect();

        let facts = memory.established_facts();
        let facts = facts[facts.len().saturating_sub(self.fact_limit)..].to_vec();

        RelevantMemory {
            chapter,
            window,
            timeline,
            characters,
            open_threads,
            facts,
            locations: memory.locations().clone(),
        }
    }

    /// Check `planned` text for chapter `chapter` against windowed memory.
    ///
    /// Oracle or parse failures produce an unchecked report with a warning.
    pub async fn check_before_writing(
        &self,
        memory: &StoryMemory,
        chapter: u32,
        planned: &str,
        options: &CheckOptions,
    ) -> ContinuityReport {
        let window = options.window.unwrap_or(self.window);
        let relevant = self.relevant_memory(memory, chapter, window);
        let prompt = build_check_prompt(&relevant, planned);

        let call = OracleOptions::structured(CHECK_MAX_TOKENS).with_tier(options.tier);
        let call = OracleOptions {
            temperature: self.temperature,
            ..call
        };

        let completion = match self.client.ask(&prompt, &call).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(chapter, error = %e, "continuity check skipped");
                return ContinuityReport::unavailable(chapter);
            }
        };

        let response: CheckResponse = match decode(&completion.text) {
            Ok(response) => response,
            Err(failure) => {
                warn!(chapter, %failure, "unusable continuity check reply");
                return ContinuityReport::unavailable(chapter);
            }
        };

        let cleared = response.cleared && response.issues.is_empty();
        if response.issues.is_empty() {
            debug!(chapter, cleared, "continuity check passed");
        } else {
            info!(chapter, issues = response.issues.len(), "continuity issues found");
        }

        ContinuityReport {
            chapter,
            issues: response.issues,
            warnings: response.warnings,
            cleared,
            checked: true,
        }
    }
}

fn build_check_prompt(relevant: &RelevantMemory, planned: &str) -> String {
    let memory_json = serde_json::to_string_pretty(relevant).unwrap_or_else(|_| "{}".to_string());
    let chapter = relevant.chapter;

    format!(
        r#"You are a continuity editor for a novel. Compare the planned text for chapter {chapter} with what the story has already established.

## Established Story Memory (chapters near {chapter})
{memory_json}

## Planned Text
{planned}

## Instructions
Look for contradictions with the timeline, character knowledge and whereabouts, established facts, open plot threads and locations. Do not report style problems.

Respond with ONLY a JSON object (no markdown, no explanation outside the JSON):
{{
  "issues": [{{"type": "timeline|character|fact|location", "detail": "what conflicts", "suggestion": "how to fix it"}}],
  "warnings": ["minor concerns"],
  "cleared": true
}}

If nothing conflicts, return empty arrays and "cleared": true."#
    )
}
