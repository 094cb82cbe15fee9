//! Multi-chapter processing.
//!
//! Walks the manuscript in fixed-size batches. Each batch gets one cheap
//! cross-chapter analysis; for rewrite and polish runs every flagged chapter
//! then goes through the [`HybridWritingFlow`] and its new text replaces the
//! old one in a clone of the manuscript. Batches run strictly one after the
//! other.

use crate::continuity::DEFAULT_FACT_LIMIT;
use crate::cost::CheckType;
use crate::flow::{HybridWritingFlow, WriteRequest};
use crate::oracle::OracleOptions;
use crate::parse::{decode, lenient_chapter, lenient_list, lenient_string};
use crate::progress::{ProgressEvent, ProgressSink, ProgressStage};
use crate::project::{ChapterRef, ManuscriptNode};
use crate::session::NovelSession;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Chapters per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Processed chapters between compression passes.
pub const DEFAULT_COMPRESS_EVERY: u32 = 20;

const ANALYSIS_MAX_TOKENS: usize = 2000;

/// Longest chapter excerpt sent for batch analysis.
const ANALYSIS_EXCERPT_CHARS: usize = 6000;

const NO_CHAPTERS: &str = "No chapters to process";

/// What to do with each batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOperation {
    #[default]
    Analyze,
    Rewrite,
    Polish,
}

impl BatchOperation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "analyze" | "analyse" => Some(Self::Analyze),
            "rewrite" => Some(Self::Rewrite),
            "polish" => Some(Self::Polish),
            _ => None,
        }
    }

    fn rewrites(self) -> bool {
        matches!(self, Self::Rewrite | Self::Polish)
    }
}

impl fmt::Display for BatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Analyze => "analyze",
            Self::Rewrite => "rewrite",
            Self::Polish => "polish",
        })
    }
}

/// Cooperative stop signal for long runs.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for [`BatchProcessor::process_full_novel`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    pub operation: BatchOperation,
    /// First chapter, 1-based.
    pub start_chapter: u32,
    /// Last chapter, inclusive; defaults to the end of the manuscript.
    pub end_chapter: Option<u32>,
    /// Overrides the session's batch size.
    pub batch_size: Option<usize>,
    /// Extra guidance passed to every rewrite.
    pub instruction: Option<String>,
}

impl BatchOptions {
    pub fn new(operation: BatchOperation) -> Self {
        Self {
            operation,
            start_chapter: 1,
            end_chapter: None,
            batch_size: None,
            instruction: None,
        }
    }

    pub fn with_range(mut self, start: u32, end: Option<u32>) -> Self {
        self.start_chapter = start.max(1);
        self.end_chapter = end;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::new(BatchOperation::Analyze)
    }
}

/// A problem reported by batch analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchIssue {
    #[serde(deserialize_with = "lenient_chapter")]
    pub chapter: Option<u32>,
    #[serde(rename = "type", deserialize_with = "lenient_string")]
    pub issue_type: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub detail: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub suggestion: Option<String>,
}

impl BatchIssue {
    fn describe(&self) -> String {
        let kind = self.issue_type.as_deref().unwrap_or("issue").to_uppercase();
        match (self.detail.as_deref(), self.suggestion.as_deref()) {
            (Some(detail), Some(suggestion)) => format!("{kind}: {detail} ({suggestion})"),
            (Some(text), None) | (None, Some(text)) => format!("{kind}: {text}"),
            (None, None) => kind,
        }
    }
}

/// Response format we expect from batch analysis.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AnalysisResponse {
    #[serde(deserialize_with = "lenient_list")]
    issues: Vec<BatchIssue>,
    #[serde(deserialize_with = "lenient_chapters")]
    chapters_needing_work: Vec<u32>,
    #[serde(deserialize_with = "lenient_string")]
    summary: Option<String>,
}

fn lenient_chapters<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .iter()
        .filter_map(crate::parse::chapter_from_value)
        .collect())
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub index: usize,
    pub chapters: Vec<u32>,
    /// False when the analysis call failed or was unusable.
    pub analyzed: bool,
    pub summary: Option<String>,
    pub chapters_needing_work: Vec<u32>,
    pub rewritten: Vec<u32>,
    pub failed: Vec<u32>,
}

/// Aggregate result of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub operation: BatchOperation,
    pub processed: u32,
    pub issues: Vec<BatchIssue>,
    /// Dollars spent during this run.
    pub cost: f64,
    pub elapsed_ms: u64,
    pub batches: Vec<BatchResult>,
    pub summary: String,
    pub cancelled: bool,
    /// The manuscript with rewritten chapters, when anything was rewritten.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manuscript: Option<ManuscriptNode>,
}

impl BatchSummary {
    pub fn rewritten(&self) -> impl Iterator<Item = u32> + '_ {
        self.batches.iter().flat_map(|b| b.rewritten.iter().copied())
    }
}

/// Drives batch runs against a session.
pub struct BatchProcessor<'a> {
    session: &'a mut NovelSession,
    progress: &'a mut dyn ProgressSink,
    cancel: CancellationFlag,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(session: &'a mut NovelSession, progress: &'a mut dyn ProgressSink) -> Self {
        Self {
            session,
            progress,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Process chapters `start..=end` of the session's project.
    pub async fn process_full_novel(&mut self, options: BatchOptions) -> BatchSummary {
        let started = Instant::now();
        let cost_before = self.session.client.costs().total_cost;

        let chapters: Vec<ChapterRef> = self
            .session
            .project
            .chapters()
            .into_iter()
            .filter(|c| c.number >= options.start_chapter)
            .filter(|c| options.end_chapter.map_or(true, |end| c.number <= end))
            .collect();

        let mut summary = BatchSummary {
            operation: options.operation,
            ..BatchSummary::default()
        };

        if chapters.is_empty() {
            summary.summary = NO_CHAPTERS.to_string();
            return summary;
        }

        let batch_size = options
            .batch_size
            .unwrap_or(self.session.config.batch_size)
            .max(1);
        let total = chapters.len() as u32;
        let batch_count = chapters.len().div_ceil(batch_size);
        let compress_every = self.session.config.compress_every.max(1);
        let mut manuscript = options
            .operation
            .rewrites()
            .then(|| self.session.project.manuscript.clone());

        info!(
            operation = %options.operation,
            chapters = total,
            batches = batch_count,
            "batch run started"
        );
        self.emit(
            ProgressEvent::new(
                ProgressStage::Started,
                format!("{} {total} chapters in {batch_count} batches", options.operation),
            )
            .with_position(0, total),
        );

        for (index, batch) in chapters.chunks(batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            self.emit(
                ProgressEvent::new(
                    ProgressStage::BatchStarted,
                    format!("Batch {} of {batch_count}", index + 1),
                )
                .with_position(summary.processed, total),
            );

            let mut result = BatchResult {
                index,
                chapters: batch.iter().map(|c| c.number).collect(),
                ..BatchResult::default()
            };

            let analysis = self.analyze_batch(batch).await;
            let batch_issues = match analysis {
                Some(analysis) => {
                    result.analyzed = true;
                    result.summary = analysis.summary;
                    result.chapters_needing_work = analysis
                        .chapters_needing_work
                        .into_iter()
                        .filter(|n| result.chapters.contains(n))
                        .collect();
                    analysis.issues
                }
                None => Vec::new(),
            };

            if let Some(manuscript) = manuscript.as_mut() {
                for (offset, chapter) in batch
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| result.chapters_needing_work.contains(&c.number))
                {
                    if self.cancel.is_cancelled() {
                        summary.cancelled = true;
                        break;
                    }
                    // Position within the selected range, not the chapter number.
                    let position = summary.processed + offset as u32 + 1;
                    self.emit(
                        ProgressEvent::new(
                            ProgressStage::Rewriting,
                            format!("{} chapter {}", options.operation, chapter.number),
                        )
                        .with_position(position, total),
                    );

                    let instruction = rewrite_instruction(
                        options.operation,
                        chapter,
                        &batch_issues,
                        options.instruction.as_deref(),
                    );
                    let request = WriteRequest::new(chapter.number, instruction)
                        .with_auto_fix(true)
                        .with_check_first(true);
                    let outcome = HybridWritingFlow::new(self.session, self.progress)
                        .run(request)
                        .await;

                    if outcome.truncated {
                        warn!(chapter = chapter.number, "rewrite was truncated, keeping original");
                    }
                    match outcome.content {
                        Some(content) if outcome.success && !outcome.truncated => {
                            if manuscript.replace_content(&chapter.path, content) {
                                result.rewritten.push(chapter.number);
                            }
                        }
                        _ => result.failed.push(chapter.number),
                    }
                }
            }

            let before = summary.processed;
            summary.processed += batch.len() as u32;
            summary.issues.extend(batch_issues.iter().cloned());
            let spent = self.session.client.costs().total_cost - cost_before;

            self.emit(
                ProgressEvent::new(
                    ProgressStage::BatchFinished,
                    format!("Batch {} of {batch_count} done", index + 1),
                )
                .with_position(summary.processed, total)
                .with_issues(batch_issues)
                .with_cost(spent),
            );
            summary.batches.push(result);

            if summary.cancelled {
                break;
            }

            if before / compress_every != summary.processed / compress_every {
                self.emit(
                    ProgressEvent::new(ProgressStage::Compressing, "Compressing story memory")
                        .with_position(summary.processed, total),
                );
                let session = &mut *self.session;
                session.updater.compress_memory(&mut session.memory).await;
            }
        }

        summary.cost = self.session.client.costs().total_cost - cost_before;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        if summary.rewritten().next().is_some() {
            summary.manuscript = manuscript;
        }
        summary.summary = format!(
            "{} {} of {total} chapters in {} batches; {} issues; {} rewritten",
            options.operation,
            summary.processed,
            summary.batches.len(),
            summary.issues.len(),
            summary.rewritten().count(),
        );

        let (stage, message) = if summary.cancelled {
            warn!(processed = summary.processed, "batch run cancelled");
            (ProgressStage::Cancelled, "Cancelled".to_string())
        } else {
            info!(
                processed = summary.processed,
                issues = summary.issues.len(),
                cost = summary.cost,
                "batch run completed"
            );
            (ProgressStage::Completed, summary.summary.clone())
        };
        self.emit(
            ProgressEvent::new(stage, message)
                .with_position(summary.processed, total)
                .with_cost(summary.cost),
        );

        summary
    }

    fn emit(&mut self, event: ProgressEvent) {
        self.progress.report(event);
    }

    /// One cheap cross-chapter analysis call. `None` when it fails.
    async fn analyze_batch(&self, batch: &[ChapterRef]) -> Option<AnalysisResponse> {
        let first = batch.first()?.number;
        let relevant = self.session.checker.relevant_memory(
            &self.session.memory,
            first,
            self.session.checker.window(),
        );
        let prompt = build_analysis_prompt(batch, &relevant.facts);
        let tier = self.session.optimizer.select_optimal_model(CheckType::BatchAnalysis);
        let options = OracleOptions::structured(ANALYSIS_MAX_TOKENS).with_tier(tier);

        let completion = match self.session.client.ask(&prompt, &options).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(first_chapter = first, error = %e, "batch analysis failed");
                return None;
            }
        };

        match decode::<AnalysisResponse>(&completion.text) {
            Ok(analysis) => {
                debug!(
                    first_chapter = first,
                    issues = analysis.issues.len(),
                    flagged = analysis.chapters_needing_work.len(),
                    "batch analyzed"
                );
                Some(analysis)
            }
            Err(failure) => {
                warn!(first_chapter = first, %failure, "unusable batch analysis reply");
                None
            }
        }
    }
}

fn build_analysis_prompt(batch: &[ChapterRef], facts: &[String]) -> String {
    let chapters: Vec<String> = batch
        .iter()
        .map(|c| {
            let excerpt: String = c.content.chars().take(ANALYSIS_EXCERPT_CHARS).collect();
            format!("### Chapter {}: {}\n{}", c.number, c.title, excerpt)
        })
        .collect();
    let facts: Vec<String> = facts
        .iter()
        .take(DEFAULT_FACT_LIMIT)
        .map(|f| format!("- {f}"))
        .collect();
    let facts = if facts.is_empty() {
        "(none)".to_string()
    } else {
        facts.join("\n")
    };

    format!(
        r#"You are reviewing consecutive chapters of a novel for cross-chapter problems.

## Established Facts
{facts}

## Chapters
{chapters}

## Instructions
Find contradictions between these chapters or with the facts, pacing problems, and dropped threads. Flag the chapters that need rework.

Respond with ONLY a JSON object (no markdown, no explanation outside the JSON):
{{
  "issues": [{{"chapter": 3, "type": "timeline|character|fact|pacing", "detail": "what is wrong", "suggestion": "how to fix it"}}],
  "chaptersNeedingWork": [3],
  "summary": "one paragraph overview"
}}"#,
        chapters = chapters.join("\n\n"),
    )
}

fn rewrite_instruction(
    operation: BatchOperation,
    chapter: &ChapterRef,
    issues: &[BatchIssue],
    extra: Option<&str>,
) -> String {
    let mut instruction = match operation {
        BatchOperation::Polish => format!(
            "Polish the prose of chapter {} (\"{}\") without changing what happens.",
            chapter.number, chapter.title
        ),
        _ => format!(
            "Rewrite chapter {} (\"{}\"), keeping its events but fixing the problems below.",
            chapter.number, chapter.title
        ),
    };

    let problems: Vec<String> = issues
        .iter()
        .filter(|i| i.chapter == Some(chapter.number))
        .map(|i| format!("- {}", i.describe()))
        .collect();
    if !problems.is_empty() {
        instruction.push_str("\n\nProblems:\n");
        instruction.push_str(&problems.join("\n"));
    }

    if let Some(extra) = extra.filter(|e| !e.trim().is_empty()) {
        instruction.push_str("\n\n");
        instruction.push_str(extra);
    }

    instruction.push_str("\n\nCurrent text:\n");
    instruction.push_str(&chapter.content);
    instruction
}

impl NovelSession {
    /// Run a batch over the loaded project.
    pub async fn process_full_novel(
        &mut self,
        options: BatchOptions,
        progress: &mut dyn ProgressSink,
        cancel: Option<CancellationFlag>,
    ) -> BatchSummary {
        let mut processor = BatchProcessor::new(self, progress);
        if let Some(cancel) = cancel {
            processor = processor.with_cancellation(cancel);
        }
        processor.process_full_novel(options).await
    }
}
