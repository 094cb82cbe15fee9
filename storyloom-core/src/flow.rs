//! The hybrid writing flow: check, write, remember, audit.
//!
//! ```text
//! planning ──► issues? ──► writing ──► updating ──► validating ──► done
//!                 │            │
//!                 │            └─ generation failed ──► done (success = false)
//!                 └─ reviewer declined ──► done (cancelled = true)
//! ```
//!
//! Every stage runs once. The only branch back to the caller is the
//! reviewer's decision after issues are found.

use crate::continuity::{CheckOptions, ContinuityIssue, ContinuityReport};
use crate::cost::CheckType;
use crate::oracle::OracleOptions;
use crate::progress::{NullProgress, ProgressEvent, ProgressSink, ProgressStage};
use crate::session::NovelSession;
use crate::updater::{UpdateOptions, UpdateReport};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

/// Timeline entries quoted as "story so far".
const RECENT_TIMELINE_ENTRIES: usize = 3;

/// Decides whether to write despite continuity issues.
#[async_trait]
pub trait IssueReviewer: Send + Sync {
    /// Return false to abort before anything is generated.
    async fn approve(&self, chapter: u32, issues: &[ContinuityIssue]) -> bool;
}

/// A request to write one chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub chapter: u32,
    /// What the chapter should do.
    pub instruction: String,
    /// Check continuity before writing.
    pub check_first: bool,
    /// Let the cost optimizer skip the check when nothing warrants it.
    pub sampled: bool,
    /// Fold issue suggestions into the instruction instead of asking the reviewer.
    pub auto_fix: bool,
    /// Audit the generated text afterwards.
    pub double_check: bool,
    pub target_words: Option<u32>,
}

impl WriteRequest {
    pub fn new(chapter: u32, instruction: impl Into<String>) -> Self {
        Self {
            chapter,
            instruction: instruction.into(),
            check_first: true,
            sampled: false,
            auto_fix: false,
            double_check: false,
            target_words: None,
        }
    }

    pub fn with_check_first(mut self, check_first: bool) -> Self {
        self.check_first = check_first;
        self
    }

    pub fn with_sampling(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = auto_fix;
        self
    }

    pub fn with_double_check(mut self, double_check: bool) -> Self {
        self.double_check = double_check;
        self
    }

    pub fn with_target_words(mut self, words: u32) -> Self {
        self.target_words = Some(words);
        self
    }
}

/// Result of one pass through the flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub chapter: u32,
    pub success: bool,
    pub cancelled: bool,
    pub content: Option<String>,
    /// Issues found before writing.
    pub issues: Vec<ContinuityIssue>,
    pub warnings: Vec<String>,
    /// The generated text stopped at the token limit.
    pub truncated: bool,
    pub update: Option<UpdateReport>,
    /// Post-hoc check of the generated text; informational only.
    pub audit: Option<ContinuityReport>,
    pub error: Option<String>,
}

/// One run of the writing flow against a session.
pub struct HybridWritingFlow<'a> {
    session: &'a mut NovelSession,
    reviewer: Option<&'a dyn IssueReviewer>,
    progress: &'a mut dyn ProgressSink,
}

impl<'a> HybridWritingFlow<'a> {
    pub fn new(session: &'a mut NovelSession, progress: &'a mut dyn ProgressSink) -> Self {
        Self {
            session,
            reviewer: None,
            progress,
        }
    }

    pub fn with_reviewer(mut self, reviewer: &'a dyn IssueReviewer) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub async fn run(&mut self, request: WriteRequest) -> WriteOutcome {
        let chapter = request.chapter;
        let mut outcome = WriteOutcome {
            chapter,
            ..WriteOutcome::default()
        };
        let mut instruction = request.instruction.clone();

        // Planning
        self.emit(ProgressEvent::new(
            ProgressStage::Planning,
            format!("Planning chapter {chapter}"),
        ));

        let wants_check = request.check_first
            && (!request.sampled || self.session.should_check_continuity(chapter, false));

        if wants_check {
            let report = self
                .session
                .checker
                .check_before_writing(
                    &self.session.memory,
                    chapter,
                    &request.instruction,
                    &CheckOptions::default(),
                )
                .await;
            outcome.warnings = report.warnings;
            outcome.issues = report.issues;
        }

        if !outcome.issues.is_empty() {
            self.emit(ProgressEvent::new(
                ProgressStage::Issues,
                format!(
                    "{} continuity issue(s) in chapter {chapter}",
                    outcome.issues.len()
                ),
            ));

            if request.auto_fix {
                instruction = with_fixes(&instruction, &outcome.issues);
            } else if let Some(reviewer) = self.reviewer {
                if !reviewer.approve(chapter, &outcome.issues).await {
                    info!(chapter, "writing cancelled after continuity review");
                    outcome.cancelled = true;
                    self.emit(ProgressEvent::new(ProgressStage::Done, "Cancelled"));
                    return outcome;
                }
            }
        }

        // Writing
        self.emit(ProgressEvent::new(
            ProgressStage::Writing,
            format!("Writing chapter {chapter}"),
        ));
        let prompt = self.build_generation_prompt(chapter, &instruction, request.target_words);
        let config = &self.session.config;
        let options = OracleOptions::creative(
            config.generation_max_tokens,
            config.generation_temperature,
        )
        .with_tier(self.session.optimizer.select_optimal_model(CheckType::Creative));

        let content = match self.session.client.ask(&prompt, &options).await {
            Ok(completion) => {
                if completion.truncated {
                    warn!(chapter, "chapter generation hit the token limit");
                    outcome.truncated = true;
                    outcome.warnings.push(format!(
                        "Chapter {chapter} was cut off at {} tokens and may end mid-scene",
                        config.generation_max_tokens
                    ));
                }
                completion.text
            }
            Err(e) => {
                warn!(chapter, error = %e, "chapter generation failed");
                outcome.error = Some(e.to_string());
                self.emit(ProgressEvent::new(ProgressStage::Done, "Generation failed"));
                return outcome;
            }
        };

        // Updating
        self.emit(ProgressEvent::new(
            ProgressStage::Updating,
            format!("Updating story memory for chapter {chapter}"),
        ));
        let session = &mut *self.session;
        let update = session
            .updater
            .update_memory(
                &mut session.memory,
                chapter,
                &content,
                UpdateOptions { auto_compress: true },
            )
            .await;
        session.optimizer.register_checkpoint(&session.memory, chapter);
        outcome.update = Some(update);

        // Validating
        if request.double_check {
            self.emit(ProgressEvent::new(
                ProgressStage::Validating,
                format!("Auditing chapter {chapter}"),
            ));
            let audit = self
                .session
                .checker
                .check_before_writing(
                    &self.session.memory,
                    chapter,
                    &content,
                    &CheckOptions {
                        tier: self.session.optimizer.select_optimal_model(
                            CheckType::CharacterConsistency,
                        ),
                        ..CheckOptions::default()
                    },
                )
                .await;
            outcome.audit = Some(audit);
        }

        outcome.success = true;
        outcome.content = Some(content);
        self.emit(
            ProgressEvent::new(ProgressStage::Done, format!("Chapter {chapter} written"))
                .with_cost(self.session.client.costs().total_cost),
        );
        outcome
    }

    fn emit(&mut self, event: ProgressEvent) {
        self.progress.report(event);
    }

    /// Assemble the generation prompt from windowed memory and the instruction.
    fn build_generation_prompt(
        &self,
        chapter: u32,
        instruction: &str,
        target_words: Option<u32>,
    ) -> String {
        let memory = &self.session.memory;
        let relevant = self
            .session
            .checker
            .relevant_memory(memory, chapter, self.session.checker.window());

        let timeline = memory.timeline();
        let recent: Vec<String> = timeline[timeline.len().saturating_sub(RECENT_TIMELINE_ENTRIES)..]
            .iter()
            .flat_map(|entry| entry.events.iter())
            .map(|event| format!("- {event}"))
            .collect();

        let characters: Vec<&str> = relevant.characters.keys().map(String::as_str).collect();
        let threads: Vec<String> = relevant
            .open_threads
            .iter()
            .map(|(name, thread)| format!("- {}", thread.describe(name)))
            .collect();
        let facts: Vec<String> = relevant.facts.iter().map(|f| format!("- {f}")).collect();

        let project = &self.session.project;
        let genre = project.genre.as_deref().unwrap_or("unspecified");
        let tone = project.tone.as_deref().unwrap_or("unspecified");
        let length = target_words
            .map(|w| format!("about {w} words"))
            .unwrap_or_else(|| "a full chapter".to_string());

        format!(
            r#"You are writing chapter {chapter} of a novel.

## Story So Far
{recent}

## Characters In Play
{characters}

## Open Plot Threads
{threads}

## Established Facts (never contradict these)
{facts}

## Style
Genre: {genre}
Tone: {tone}
Length: {length}

## Instruction
{instruction}

Write the chapter prose only, with no headings or commentary."#,
            recent = or_none(recent.join("\n")),
            characters = or_none(characters.join(", ")),
            threads = or_none(threads.join("\n")),
            facts = or_none(facts.join("\n")),
        )
    }
}

/// Append one `TYPE: suggestion` bullet per issue.
fn with_fixes(instruction: &str, issues: &[ContinuityIssue]) -> String {
    let bullets: Vec<String> = issues
        .iter()
        .map(|issue| format!("- {}", issue.as_fix_instruction()))
        .collect();
    format!(
        "{instruction}\n\nAddress these continuity problems:\n{}",
        bullets.join("\n")
    )
}

fn or_none(text: String) -> String {
    if text.is_empty() {
        "(none)".to_string()
    } else {
        text
    }
}

/// Reviewer that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProceedAnyway;

#[async_trait]
impl IssueReviewer for ProceedAnyway {
    async fn approve(&self, _chapter: u32, _issues: &[ContinuityIssue]) -> bool {
        true
    }
}

impl NovelSession {
    /// Run the writing flow for one chapter.
    pub async fn write_chapter(
        &mut self,
        request: WriteRequest,
        progress: &mut dyn ProgressSink,
    ) -> WriteOutcome {
        HybridWritingFlow::new(self, progress).run(request).await
    }

    /// Run the writing flow, asking `reviewer` before writing over issues.
    pub async fn write_chapter_reviewed(
        &mut self,
        request: WriteRequest,
        reviewer: &dyn IssueReviewer,
        progress: &mut dyn ProgressSink,
    ) -> WriteOutcome {
        HybridWritingFlow::new(self, progress)
            .with_reviewer(reviewer)
            .run(request)
            .await
    }

    /// Run the writing flow without progress reporting.
    pub async fn write_chapter_quietly(&mut self, request: WriteRequest) -> WriteOutcome {
        self.write_chapter(request, &mut NullProgress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CharacterUpdate, ThreadUpdate};
    use crate::oracle::{ModelTier, OracleClient};
    use crate::session::SessionConfig;
    use crate::testing::ScriptedOracle;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const ISSUE_REPLY: &str = r#"{"issues": [{"type": "timeline", "detail": "Ilya is dead", "suggestion": "Use his brother instead"}], "cleared": false}"#;
    const CLEAR_REPLY: &str = r#"{"issues": [], "warnings": [], "cleared": true}"#;
    const DELTA_REPLY: &str = r#"{"newEvents": ["Mara reaches the coast"], "newFacts": ["The coast road is closed"]}"#;

    fn session_with(oracle: Arc<ScriptedOracle>) -> NovelSession {
        NovelSession::new(OracleClient::new(oracle), SessionConfig::default())
    }

    struct Decline;

    #[async_trait]
    impl IssueReviewer for Decline {
        async fn approve(&self, _chapter: u32, _issues: &[ContinuityIssue]) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_flow_writes_and_updates_memory() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            CLEAR_REPLY.to_string(),
            "Mara walked until the sea.".to_string(),
            DELTA_REPLY.to_string(),
        ]));
        let mut session = session_with(oracle.clone());
        let mut stages = Vec::new();
        let mut sink = |event: ProgressEvent| stages.push(event.stage);

        let outcome = session
            .write_chapter(WriteRequest::new(2, "Mara travels to the coast"), &mut sink)
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.content.as_deref(), Some("Mara walked until the sea."));
        assert_eq!(session.memory().established_facts(), &["The coast road is closed"]);
        assert_eq!(session.optimizer().last_check_chapter(), 2);
        assert!(session.diff_context(2).is_empty());
        assert_eq!(
            stages,
            vec![
                ProgressStage::Planning,
                ProgressStage::Writing,
                ProgressStage::Updating,
                ProgressStage::Done
            ]
        );

        let calls = oracle.calls();
        assert_eq!(calls[1].tier, ModelTier::Creative);
        assert!(calls[1].prompt.contains("Mara travels to the coast"));
    }

    #[tokio::test]
    async fn test_auto_fix_adds_bullets() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            ISSUE_REPLY.to_string(),
            "Prose.".to_string(),
            "{}".to_string(),
        ]));
        let mut session = session_with(oracle.clone());

        let outcome = session
            .write_chapter_quietly(WriteRequest::new(5, "Ilya returns").with_auto_fix(true))
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.issues.len(), 1);
        assert!(oracle.prompts()[1].contains("- TIMELINE: Use his brother instead"));
    }

    #[tokio::test]
    async fn test_reviewer_can_cancel() {
        let oracle = Arc::new(ScriptedOracle::new(vec![ISSUE_REPLY.to_string()]));
        let mut session = session_with(oracle.clone());

        let outcome = session
            .write_chapter_reviewed(
                WriteRequest::new(5, "Ilya returns"),
                &Decline,
                &mut NullProgress,
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.cancelled);
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(oracle.call_count(), 1);
    }

    #[tokio::test]
    async fn test_generation_failure_short_circuits() {
        let oracle = Arc::new(ScriptedOracle::new(vec![CLEAR_REPLY.to_string()]));
        let mut session = session_with(oracle.clone());

        let outcome = session
            .write_chapter_quietly(WriteRequest::new(1, "Begin"))
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert!(session.memory().is_empty());
        assert_eq!(oracle.call_count(), 2);
    }

    #[tokio::test]
    async fn test_generation_prompt_uses_recent_memory_and_style() {
        let oracle = Arc::new(ScriptedOracle::new(vec!["Prose.".to_string(), "{}".to_string()]));
        let mut session = session_with(oracle.clone());
        session.project.genre = Some("Maritime fantasy".to_string());
        session.project.tone = Some("Brooding".to_string());

        let memory = &mut session.memory;
        let events = ["Event one", "Event two", "Event three", "Event four", "Event five"];
        for (chapter, event) in (1..).zip(events) {
            memory.append_timeline_events(Some(chapter), vec![event.to_string()]);
        }
        memory.merge_plot_threads(
            BTreeMap::from([
                ("The stolen ledger".to_string(), ThreadUpdate::status("open")),
                ("The missing heir".to_string(), ThreadUpdate::status("resolved")),
            ]),
            Some(4),
        );
        memory.upsert_character_state("Mara", CharacterUpdate::default(), Some(9));
        memory.upsert_character_state("Old Tobin", CharacterUpdate::default(), Some(2));

        let outcome = session
            .write_chapter_quietly(
                WriteRequest::new(10, "Mara burns the ledger")
                    .with_check_first(false)
                    .with_target_words(2500),
            )
            .await;
        assert!(outcome.success);

        let prompt = &oracle.prompts()[0];
        assert!(prompt.starts_with("You are writing chapter 10 of a novel."));
        assert!(prompt.contains("## Story So Far\n- Event three\n- Event four\n- Event five\n"));
        assert!(!prompt.contains("Event one"));
        assert!(!prompt.contains("Event two"));
        assert!(prompt.contains("## Characters In Play\nMara\n"));
        assert!(!prompt.contains("Old Tobin"));
        assert!(prompt.contains("## Open Plot Threads\n- The stolen ledger (open)\n"));
        assert!(!prompt.contains("The missing heir"));
        assert!(
            prompt.contains("Genre: Maritime fantasy\nTone: Brooding\nLength: about 2500 words")
        );
        assert!(prompt.contains("## Instruction\nMara burns the ledger"));
    }

    #[tokio::test]
    async fn test_truncated_generation_is_flagged() {
        let oracle = Arc::new(
            ScriptedOracle::new(vec!["The tide rose and".to_string(), "{}".to_string()])
                .truncating(),
        );
        let mut session = session_with(oracle);

        let outcome = session
            .write_chapter_quietly(WriteRequest::new(1, "Begin").with_check_first(false))
            .await;

        assert!(outcome.success);
        assert!(outcome.truncated);
        assert!(outcome.warnings.iter().any(|w| w.contains("cut off")));
    }

    #[tokio::test]
    async fn test_double_check_audits_generated_text() {
        let oracle = Arc::new(ScriptedOracle::new(vec![
            "The chapter text.".to_string(),
            DELTA_REPLY.to_string(),
            ISSUE_REPLY.to_string(),
        ]));
        let mut session = session_with(oracle.clone());

        let outcome = session
            .write_chapter_quietly(
                WriteRequest::new(3, "Go on")
                    .with_check_first(false)
                    .with_double_check(true),
            )
            .await;

        assert!(outcome.success);
        let audit = outcome.audit.unwrap();
        assert!(audit.has_issues());
        assert!(oracle.prompts()[2].contains("The chapter text."));
    }

    #[tokio::test]
    async fn test_sampled_check_skips_quiet_chapters() {
        let oracle = Arc::new(ScriptedOracle::new(vec!["Prose.".to_string(), "{}".to_string()]));
        let mut session = session_with(oracle.clone());
        session.register_checkpoint(2);

        let outcome = session
            .write_chapter_quietly(WriteRequest::new(3, "Quiet day").with_sampling(true))
            .await;

        assert!(outcome.success);
        assert_eq!(oracle.call_count(), 2);
    }
}
