//! Cost control for continuity checking.
//!
//! Decides when a check is worth an oracle call, snapshots memory for
//! "what changed since" diffs, routes check types to model tiers, and keeps
//! the running cost ledger.

use crate::memory::{CharacterState, StoryMemory, TimelineEntry};
use crate::oracle::{ModelTier, TokenUsage};
use crate::project::ProjectEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Chapters between routine checks.
pub const DEFAULT_CHECK_INTERVAL: u32 = 5;

/// Accumulated oracle spend for the life of the process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CostLedger {
    pub total_cost: f64,
    pub check_count: u64,
    pub tokens: TokenUsage,
}

impl CostLedger {
    /// Add one call. Negative costs are ignored.
    pub fn record(&mut self, usage: TokenUsage, cost: f64) {
        self.total_cost += cost.max(0.0);
        self.check_count += 1;
        self.tokens.input += usage.input;
        self.tokens.output += usage.output;
    }
}

/// Dollar prices per million tokens for each tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierPricing {
    pub fast_input_per_million: f64,
    pub fast_output_per_million: f64,
    pub creative_input_per_million: f64,
    pub creative_output_per_million: f64,
}

impl Default for TierPricing {
    fn default() -> Self {
        Self {
            fast_input_per_million: 0.80,
            fast_output_per_million: 4.00,
            creative_input_per_million: 3.00,
            creative_output_per_million: 15.00,
        }
    }
}

impl TierPricing {
    pub fn cost_of(&self, tier: ModelTier, usage: TokenUsage) -> f64 {
        let (input, output) = match tier {
            ModelTier::Fast => (self.fast_input_per_million, self.fast_output_per_million),
            ModelTier::Creative => (
                self.creative_input_per_million,
                self.creative_output_per_million,
            ),
        };
        (usage.input as f64 * input + usage.output as f64 * output) / 1_000_000.0
    }
}

/// Value snapshot of memory sizes at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub timeline_length: usize,
    pub facts_length: usize,
    #[serde(rename = "characterLastSeenByName")]
    pub character_last_seen: BTreeMap<String, Option<u32>>,
    pub chapter: u32,
    pub taken_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn of(memory: &StoryMemory, chapter: u32) -> Self {
        Self {
            timeline_length: memory.timeline().len(),
            facts_length: memory.established_facts().len(),
            character_last_seen: memory
                .character_states()
                .iter()
                .map(|(name, state)| (name.clone(), state.last_seen))
                .collect(),
            chapter,
            taken_at: Utc::now(),
        }
    }
}

/// What changed since the last checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffContext {
    pub chapter: u32,
    /// Chapter of the checkpoint the diff is taken against.
    pub since_chapter: Option<u32>,
    pub timeline: Vec<TimelineEntry>,
    pub facts: Vec<String>,
    pub characters: BTreeMap<String, CharacterState>,
}

impl DiffContext {
    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty() && self.facts.is_empty() && self.characters.is_empty()
    }
}

/// Categories of check, for model routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckType {
    FactCheck,
    CharacterConsistency,
    Structural,
    Creative,
    Extraction,
    Compression,
    BatchAnalysis,
}

/// Decides whether an event description signals a plot twist.
pub trait PlotTwistDetector: Send + Sync {
    fn is_plot_twist(&self, description: &str) -> bool;
}

/// Case-insensitive substring match against a keyword list.
#[derive(Debug, Clone)]
pub struct KeywordTwistDetector {
    keywords: Vec<String>,
}

impl KeywordTwistDetector {
    pub fn new(keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// English keyword list.
    pub fn english() -> Self {
        Self::new([
            "twist",
            "reveal",
            "revelation",
            "climax",
            "betray",
            "turning point",
            "secret",
            "unmask",
            "confession",
            "death of",
        ])
    }
}

impl Default for KeywordTwistDetector {
    fn default() -> Self {
        Self::english()
    }
}

impl PlotTwistDetector for KeywordTwistDetector {
    fn is_plot_twist(&self, description: &str) -> bool {
        let lower = description.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

/// Inputs to [`CostOptimizer::estimate_full_novel_cost`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimateOptions {
    pub chapters: u32,
    /// One deep check every `check_interval` chapters.
    pub check_interval: u32,
    pub creative_calls_per_chapter: f64,
    /// Dollars per deep check.
    pub deep_check_cost: f64,
    /// Dollars per generation call.
    pub creative_call_cost: f64,
}

impl Default for CostEstimateOptions {
    fn default() -> Self {
        Self {
            chapters: 30,
            check_interval: DEFAULT_CHECK_INTERVAL,
            creative_calls_per_chapter: 1.0,
            deep_check_cost: 0.02,
            creative_call_cost: 0.12,
        }
    }
}

/// A projected spend for a whole manuscript.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub deep_checks: u64,
    pub creative_calls: u64,
    pub deep_check_total: f64,
    pub creative_total: f64,
    pub total: f64,
}

/// Sampling heuristics, checkpoints and model routing.
pub struct CostOptimizer {
    check_interval: u32,
    detector: Box<dyn PlotTwistDetector>,
    routing: BTreeMap<CheckType, ModelTier>,
    default_tier: ModelTier,
    checkpoint: Option<Checkpoint>,
    last_check_chapter: u32,
}

impl CostOptimizer {
    pub fn new() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            detector: Box::new(KeywordTwistDetector::default()),
            routing: default_routing(),
            default_tier: ModelTier::Fast,
            checkpoint: None,
            last_check_chapter: 0,
        }
    }

    pub fn with_check_interval(mut self, interval: u32) -> Self {
        self.check_interval = interval.max(1);
        self
    }

    /// Swap the plot-twist heuristic.
    pub fn with_detector(mut self, detector: impl PlotTwistDetector + 'static) -> Self {
        self.detector = Box::new(detector);
        self
    }

    /// Override the tier for one check type.
    pub fn with_route(mut self, check_type: CheckType, tier: ModelTier) -> Self {
        self.routing.insert(check_type, tier);
        self
    }

    pub fn last_check_chapter(&self) -> u32 {
        self.last_check_chapter
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Forget checkpoints (used when switching projects).
    pub fn reset(&mut self) {
        self.checkpoint = None;
        self.last_check_chapter = 0;
    }

    /// Whether a continuity check for `chapter` is worth its cost.
    ///
    /// Always true when forced or for the opening chapter. Otherwise true
    /// once `check_interval` chapters have passed since `last_check_chapter`,
    /// or when an event tagged to this chapter is major or reads like a twist.
    pub fn should_check_continuity(
        &self,
        chapter: u32,
        last_check_chapter: u32,
        events: &[ProjectEvent],
        forced: bool,
    ) -> bool {
        if forced || chapter <= 1 {
            return true;
        }

        if chapter.saturating_sub(last_check_chapter) >= self.check_interval {
            return true;
        }

        let significant = events
            .iter()
            .filter(|e| e.chapter == Some(chapter))
            .any(|e| {
                e.is_major()
                    || e
                        .description
                        .as_deref()
                        .is_some_and(|d| self.detector.is_plot_twist(d))
            });

        if !significant {
            debug!(chapter, last_check_chapter, "continuity check skipped by sampling");
        }
        significant
    }

    /// Snapshot memory for later diffs and remember `chapter` as checked.
    pub fn register_checkpoint(&mut self, memory: &StoryMemory, chapter: u32) {
        self.checkpoint = Some(Checkpoint::of(memory, chapter));
        self.last_check_chapter = chapter;
    }

    /// Timeline rows and facts appended since the checkpoint, plus characters
    /// whose `last_seen` moved forward. Without a checkpoint everything is new.
    pub fn diff_context(&self, memory: &StoryMemory, chapter: u32) -> DiffContext {
        let (timeline_start, facts_start) = self
            .checkpoint
            .as_ref()
            .map_or((0, 0), |cp| (cp.timeline_length, cp.facts_length));

        let characters = memory
            .character_states()
            .iter()
            .filter(|(name, state)| {
                let before = self
                    .checkpoint
                    .as_ref()
                    .and_then(|cp| cp.character_last_seen.get(*name).copied())
                    .flatten();
                state.last_seen > before
            })
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect();

        DiffContext {
            chapter,
            since_chapter: self.checkpoint.as_ref().map(|cp| cp.chapter),
            timeline: memory
                .timeline()
                .get(timeline_start..)
                .unwrap_or_default()
                .to_vec(),
            facts: memory
                .established_facts()
                .get(facts_start..)
                .unwrap_or_default()
                .to_vec(),
            characters,
        }
    }

    /// Which tier a check type should use; unknown routes use the fast tier.
    pub fn select_optimal_model(&self, check_type: CheckType) -> ModelTier {
        self.routing
            .get(&check_type)
            .copied()
            .unwrap_or(self.default_tier)
    }

    /// Closed-form projection: deep checks times their unit cost plus
    /// creative calls times theirs.
    pub fn estimate_full_novel_cost(&self, options: &CostEstimateOptions) -> CostEstimate {
        let deep_checks = u64::from(options.chapters.div_ceil(options.check_interval.max(1)));
        let creative_calls = (f64::from(options.chapters)
            * options.creative_calls_per_chapter.max(0.0))
        .ceil() as u64;

        let deep_check_total = deep_checks as f64 * options.deep_check_cost;
        let creative_total = creative_calls as f64 * options.creative_call_cost;

        CostEstimate {
            deep_checks,
            creative_calls,
            deep_check_total,
            creative_total,
            total: deep_check_total + creative_total,
        }
    }
}

impl Default for CostOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn default_routing() -> BTreeMap<CheckType, ModelTier> {
    BTreeMap::from([
        (CheckType::FactCheck, ModelTier::Fast),
        (CheckType::CharacterConsistency, ModelTier::Fast),
        (CheckType::Structural, ModelTier::Fast),
        (CheckType::Creative, ModelTier::Creative),
        (CheckType::Extraction, ModelTier::Fast),
        (CheckType::Compression, ModelTier::Fast),
        (CheckType::BatchAnalysis, ModelTier::Fast),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CharacterUpdate;

    fn event(chapter: u32, description: &str, significance: Option<&str>) -> ProjectEvent {
        ProjectEvent {
            chapter: Some(chapter),
            description: Some(description.to_string()),
            significance: significance.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_chapter_and_forced_always_check() {
        let optimizer = CostOptimizer::new();
        assert!(optimizer.should_check_continuity(1, 1, &[], false));
        assert!(optimizer.should_check_continuity(0, 0, &[], false));
        assert!(optimizer.should_check_continuity(3, 2, &[], true));
    }

    #[test]
    fn test_interval_sampling() {
        let optimizer = CostOptimizer::new();
        for last in 0..20u32 {
            for chapter in 2..30u32 {
                let expected = chapter.saturating_sub(last) >= 5;
                assert_eq!(
                    optimizer.should_check_continuity(chapter, last, &[], false),
                    expected,
                    "chapter {chapter}, last check {last}"
                );
            }
        }
    }

    #[test]
    fn test_major_or_twist_event_triggers_check() {
        let optimizer = CostOptimizer::new();
        let events = vec![
            event(7, "A quiet breakfast", Some("Major")),
            event(8, "The butler's secret is revealed", None),
            event(9, "Rain", Some("minor")),
        ];

        assert!(optimizer.should_check_continuity(7, 6, &events, false));
        assert!(optimizer.should_check_continuity(8, 7, &events, false));
        assert!(!optimizer.should_check_continuity(9, 8, &events, false));
        // Events of other chapters do not count.
        assert!(!optimizer.should_check_continuity(10, 8, &events, false));
    }

    #[test]
    fn test_pluggable_detector() {
        struct Never;
        impl PlotTwistDetector for Never {
            fn is_plot_twist(&self, _description: &str) -> bool {
                false
            }
        }

        let optimizer = CostOptimizer::new().with_detector(Never);
        let events = vec![event(4, "Shocking twist", None)];
        assert!(!optimizer.should_check_continuity(4, 3, &events, false));

        let optimizer = CostOptimizer::new().with_detector(KeywordTwistDetector::new(["umbrella"]));
        let events = vec![event(4, "An UMBRELLA opens", None)];
        assert!(optimizer.should_check_continuity(4, 3, &events, false));
    }

    #[test]
    fn test_checkpoint_then_no_mutation_gives_empty_diff() {
        let mut memory = StoryMemory::new();
        memory.append_timeline_events(Some(1), vec!["A".into()]);
        memory.register_established_facts(["F"]);
        memory.upsert_character_state("Mara", CharacterUpdate::default(), Some(1));

        let mut optimizer = CostOptimizer::new();
        optimizer.register_checkpoint(&memory, 1);

        let diff = optimizer.diff_context(&memory, 1);
        assert!(diff.is_empty());
        assert_eq!(diff.since_chapter, Some(1));
        assert_eq!(optimizer.last_check_chapter(), 1);
    }

    #[test]
    fn test_checkpoint_serialized_shape() {
        let mut memory = StoryMemory::new();
        memory.append_timeline_events(Some(3), vec!["A".into()]);
        memory.upsert_character_state("Mara", CharacterUpdate::default(), Some(3));

        let checkpoint = Checkpoint::of(&memory, 3);
        let value = serde_json::to_value(&checkpoint).unwrap();

        assert_eq!(value["timelineLength"], 1);
        assert_eq!(value["factsLength"], 0);
        assert_eq!(value["characterLastSeenByName"]["Mara"], 3);
        assert!(value.get("characterLastSeen").is_none());
        let back: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(back, checkpoint);
    }

    #[test]
    fn test_diff_reports_only_new_material() {
        let mut memory = StoryMemory::new();
        memory.append_timeline_events(Some(1), vec!["A".into()]);
        memory.register_established_facts(["F1"]);
        memory.upsert_character_state("Mara", CharacterUpdate::default(), Some(1));
        memory.upsert_character_state("Ilya", CharacterUpdate::default(), Some(1));

        let mut optimizer = CostOptimizer::new();
        optimizer.register_checkpoint(&memory, 1);

        memory.append_timeline_events(Some(2), vec!["B".into()]);
        memory.register_established_facts(["F1", "F2"]);
        memory.upsert_character_state("Mara", CharacterUpdate::default(), Some(2));
        memory.upsert_character_state("Ilya", CharacterUpdate::default(), Some(1));
        memory.upsert_character_state("Sen", CharacterUpdate::default(), Some(2));

        let diff = optimizer.diff_context(&memory, 2);
        assert_eq!(diff.timeline.len(), 1);
        assert_eq!(diff.timeline[0].events, vec!["B"]);
        assert_eq!(diff.facts, vec!["F2"]);
        let names: Vec<_> = diff.characters.keys().cloned().collect();
        assert_eq!(names, vec!["Mara", "Sen"]);
    }

    #[test]
    fn test_diff_without_checkpoint_is_everything() {
        let mut memory = StoryMemory::new();
        memory.append_timeline_events(Some(1), vec!["A".into()]);
        let diff = CostOptimizer::new().diff_context(&memory, 1);
        assert_eq!(diff.timeline.len(), 1);
        assert_eq!(diff.since_chapter, None);
    }

    #[test]
    fn test_diff_survives_shrunken_memory() {
        let mut memory = StoryMemory::new();
        memory.append_timeline_events(Some(1), vec!["A".into()]);
        memory.append_timeline_events(Some(2), vec!["B".into()]);

        let mut optimizer = CostOptimizer::new();
        optimizer.register_checkpoint(&memory, 2);
        memory.replace_timeline(Vec::new());

        assert!(optimizer.diff_context(&memory, 2).timeline.is_empty());
    }

    #[test]
    fn test_model_routing() {
        let optimizer = CostOptimizer::new();
        assert_eq!(optimizer.select_optimal_model(CheckType::FactCheck), ModelTier::Fast);
        assert_eq!(optimizer.select_optimal_model(CheckType::Structural), ModelTier::Fast);
        assert_eq!(optimizer.select_optimal_model(CheckType::Creative), ModelTier::Creative);
        assert_eq!(optimizer.select_optimal_model(CheckType::BatchAnalysis), ModelTier::Fast);

        let optimizer = CostOptimizer::new().with_route(CheckType::Structural, ModelTier::Creative);
        assert_eq!(optimizer.select_optimal_model(CheckType::Structural), ModelTier::Creative);
    }

    #[test]
    fn test_estimate_full_novel_cost() {
        let estimate = CostOptimizer::new().estimate_full_novel_cost(&CostEstimateOptions {
            chapters: 50,
            check_interval: 5,
            creative_calls_per_chapter: 2.0,
            deep_check_cost: 0.05,
            creative_call_cost: 0.10,
        });

        assert_eq!(estimate.deep_checks, 10);
        assert_eq!(estimate.creative_calls, 100);
        assert!((estimate.total - (10.0 * 0.05 + 100.0 * 0.10)).abs() < 1e-9);
    }

    #[test]
    fn test_ledger_and_pricing() {
        let pricing = TierPricing::default();
        let usage = TokenUsage {
            input: 2_000_000,
            output: 1_000_000,
        };
        assert!((pricing.cost_of(ModelTier::Fast, usage) - (1.6 + 4.0)).abs() < 1e-9);
        assert!((pricing.cost_of(ModelTier::Creative, usage) - (6.0 + 15.0)).abs() < 1e-9);

        let mut ledger = CostLedger::default();
        ledger.record(usage, 1.5);
        ledger.record(TokenUsage::default(), -3.0);
        assert_eq!(ledger.check_count, 2);
        assert_eq!(ledger.tokens.input, 2_000_000);
        assert!((ledger.total_cost - 1.5).abs() < 1e-9);
    }
}
