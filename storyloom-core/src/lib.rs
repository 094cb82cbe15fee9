//! Continuity-aware chapter generation for long-form fiction.
//!
//! This crate provides:
//! - A story memory of timeline, characters, facts, threads, locations and items
//! - Windowed continuity checks before text is written
//! - Extraction of new facts from written chapters, with periodic compression
//! - Cost control: sampled checks, checkpoint diffs and model routing
//! - A single-chapter writing flow and a multi-chapter batch processor
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────── NovelSession ────────────────────────────────┐
//! │                                                                              │
//! │  HybridWritingFlow ─┐        BatchProcessor ─┐                               │
//! │                     ▼                        ▼                               │
//! │  ContinuityChecker  MemoryUpdater  CostOptimizer     ◄── reads/writes ──┐    │
//! │         │                 │              │                              │    │
//! │         └────────┬────────┘              │                      StoryMemory  │
//! │                  ▼                       │                                   │
//! │            OracleClient ── CostLedger ◄──┘                                   │
//! │                  │                                                           │
//! └──────────────────┼───────────────────────────────────────────────────────────┘
//!                    ▼
//!          Oracle (Claude / scripted)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use storyloom_core::{NovelSession, Project, SessionConfig, WriteRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = NovelSession::from_env(SessionConfig::new());
//!     session.load_project(Project::load("novel.json").await?);
//!
//!     let outcome = session
//!         .write_chapter_quietly(WriteRequest::new(4, "Mara confronts Ilya at the docks"))
//!         .await;
//!     println!("{}", outcome.content.unwrap_or_default());
//!
//!     session.save_memory("memory.json").await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod continuity;
pub mod cost;
pub mod export;
pub mod flow;
pub mod memory;
pub mod oracle;
pub mod parse;
pub mod progress;
pub mod project;
pub mod session;
pub mod testing;
pub mod updater;

// Primary public API
pub use batch::{
    BatchIssue, BatchOperation, BatchOptions, BatchProcessor, BatchResult, BatchSummary,
    CancellationFlag,
};
pub use continuity::{
    CheckOptions, ContinuityChecker, ContinuityIssue, ContinuityReport, RelevantMemory,
};
pub use cost::{
    CheckType, Checkpoint, CostEstimate, CostEstimateOptions, CostLedger, CostOptimizer,
    DiffContext, KeywordTwistDetector, PlotTwistDetector, TierPricing,
};
pub use export::MemoryExport;
pub use flow::{HybridWritingFlow, IssueReviewer, ProceedAnyway, WriteOutcome, WriteRequest};
pub use memory::{
    CharacterState, CharacterUpdate, ItemRecord, LocationRecord, LocationUpdate, MemoryStats,
    PlotThread, StoryMemory, ThreadStatus, ThreadUpdate, TimelineEntry,
};
pub use oracle::{
    ClaudeOracle, Completion, ModelTier, Oracle, OracleClient, OracleError, OracleOptions,
    TokenUsage, UnconfiguredOracle,
};
pub use parse::{ParseFailure, ParseResult};
pub use progress::{NullProgress, ProgressEvent, ProgressSink, ProgressStage};
pub use project::{ChapterRef, ManuscriptNode, NodeKind, Project};
pub use session::{NovelSession, SessionConfig, SessionError, SharedSession};
pub use testing::ScriptedOracle;
pub use updater::{CompressionReport, MemoryDelta, MemoryUpdater, UpdateOptions, UpdateReport};
