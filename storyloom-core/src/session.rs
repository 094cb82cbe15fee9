//! NovelSession - the primary public API.
//!
//! A session owns one project's story memory together with the components
//! that read and write it. Every mutating operation takes `&mut self`, so
//! two memory updates can never interleave on the same store. Use
//! [`NovelSession::into_shared`] to hand one session to several tasks.

use crate::batch::{DEFAULT_BATCH_SIZE, DEFAULT_COMPRESS_EVERY};
use crate::continuity::{
    CheckOptions, ContinuityChecker, ContinuityReport, RelevantMemory, DEFAULT_FACT_LIMIT,
    DEFAULT_WINDOW,
};
use crate::cost::{
    CheckType, CostEstimate, CostEstimateOptions, CostLedger, CostOptimizer, DiffContext,
    TierPricing, DEFAULT_CHECK_INTERVAL,
};
use crate::export::MemoryExport;
use crate::memory::StoryMemory;
use crate::oracle::{ClaudeOracle, OracleClient, UnconfiguredOracle};
use crate::project::Project;
use crate::updater::{
    CompressionReport, MemoryUpdater, UpdateOptions, UpdateReport, DEFAULT_COMPRESS_THRESHOLD,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Errors from NovelSession operations.
///
/// Only persistence can fail; oracle trouble degrades inside the components.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A session shared between tasks; the mutex serializes all writers.
pub type SharedSession = Arc<Mutex<NovelSession>>;

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Chapters on either side of the target sent to continuity checks.
    pub window: u32,

    /// Most recent facts sent to continuity checks.
    pub fact_limit: usize,

    /// Chapters between sampled continuity checks.
    pub check_interval: u32,

    /// Timeline entries between automatic compressions.
    pub compress_threshold: usize,

    /// Chapters per batch.
    pub batch_size: usize,

    /// Processed chapters between compressions in batch runs.
    pub compress_every: u32,

    pub generation_temperature: f32,
    pub check_temperature: f32,
    pub generation_max_tokens: usize,

    /// Override for the fast (checking) model.
    pub fast_model: Option<String>,

    /// Override for the creative (writing) model.
    pub creative_model: Option<String>,

    pub pricing: TierPricing,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            fact_limit: DEFAULT_FACT_LIMIT,
            check_interval: DEFAULT_CHECK_INTERVAL,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            compress_every: DEFAULT_COMPRESS_EVERY,
            generation_temperature: 0.8,
            check_temperature: 0.0,
            generation_max_tokens: 4096,
            fast_model: None,
            creative_model: None,
            pricing: TierPricing::default(),
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

    pub fn with_check_interval(mut self, interval: u32) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_compress_threshold(mut self, threshold: usize) -> Self {
        self.compress_threshold = threshold;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_compress_every(mut self, chapters: u32) -> Self {
        self.compress_every = chapters;
        self
    }

    /// Set temperature for prose generation.
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.generation_temperature = temp;
        self
    }

    pub fn with_check_temperature(mut self, temp: f32) -> Self {
        self.check_temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.generation_max_tokens = tokens;
        self
    }

    pub fn with_fast_model(mut self, model: impl Into<String>) -> Self {
        self.fast_model = Some(model.into());
        self
    }

    pub fn with_creative_model(mut self, model: impl Into<String>) -> Self {
        self.creative_model = Some(model.into());
        self
    }

    pub fn with_pricing(mut self, pricing: TierPricing) -> Self {
        self.pricing = pricing;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A novel-writing session over one project.
pub struct NovelSession {
    pub(crate) config: SessionConfig,
    pub(crate) client: OracleClient,
    pub(crate) project: Project,
    pub(crate) memory: StoryMemory,
    pub(crate) checker: ContinuityChecker,
    pub(crate) updater: MemoryUpdater,
    pub(crate) optimizer: CostOptimizer,
}

impl NovelSession {
    /// Create a session around an existing oracle client.
    pub fn new(client: OracleClient, config: SessionConfig) -> Self {
        let client = client.with_pricing(config.pricing);
        let checker = ContinuityChecker::new(client.clone())
            .with_window(config.window)
            .with_fact_limit(config.fact_limit)
            .with_temperature(config.check_temperature);
        let optimizer = CostOptimizer::new().with_check_interval(config.check_interval);
        let updater = MemoryUpdater::new(client.clone())
            .with_compress_threshold(config.compress_threshold)
            .with_tiers(
                optimizer.select_optimal_model(CheckType::Extraction),
                optimizer.select_optimal_model(CheckType::Compression),
            );

        Self {
            config,
            client,
            project: Project::default(),
            memory: StoryMemory::new(),
            checker,
            updater,
            optimizer,
        }
    }

    /// Create a session backed by Claude when `ANTHROPIC_API_KEY` is set.
    ///
    /// Without a key the session still works; every oracle call degrades to
    /// its fallback.
    pub fn from_env(config: SessionConfig) -> Self {
        let client = match ClaudeOracle::from_env() {
            Ok(mut oracle) => {
                if let Some(model) = &config.fast_model {
                    oracle = oracle.with_fast_model(model);
                }
                if let Some(model) = &config.creative_model {
                    oracle = oracle.with_creative_model(model);
                }
                OracleClient::new(Arc::new(oracle))
            }
            Err(e) => {
                warn!(error = %e, "no language model configured; oracle calls will degrade");
                OracleClient::new(Arc::new(UnconfiguredOracle))
            }
        };
        Self::new(client, config)
    }

    /// Wrap in a per-project mutex for use from several tasks.
    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn memory(&self) -> &StoryMemory {
        &self.memory
    }

    pub fn optimizer(&self) -> &CostOptimizer {
        &self.optimizer
    }

    /// Name of the oracle provider in use.
    pub fn provider(&self) -> &str {
        self.client.provider()
    }

    /// Spend so far.
    pub fn costs(&self) -> CostLedger {
        self.client.costs()
    }

    // =========================================================================
    // Project lifecycle
    // =========================================================================

    /// Switch to `project`: reset everything and seed memory from it.
    pub fn load_project(&mut self, project: Project) {
        self.reset_memory();
        self.memory.initialize_from_project(&project);
        info!(
            title = project.title.as_deref().unwrap_or("untitled"),
            chapters = project.chapters().len(),
            memory = ?self.memory.stats(),
            "project loaded"
        );
        self.project = project;
    }

    /// Clear memory and checkpoints, keeping the project.
    pub fn reset_memory(&mut self) {
        self.memory.reset();
        self.optimizer.reset();
        self.updater.reset();
    }

    // =========================================================================
    // Component operations
    // =========================================================================

    pub fn relevant_memory(&self, chapter: u32) -> RelevantMemory {
        self.checker
            .relevant_memory(&self.memory, chapter, self.checker.window())
    }

    pub async fn check_continuity(
        &self,
        chapter: u32,
        planned: &str,
        options: &CheckOptions,
    ) -> ContinuityReport {
        self.checker
            .check_before_writing(&self.memory, chapter, planned, options)
            .await
    }

    pub async fn update_memory(
        &mut self,
        chapter: u32,
        content: &str,
        options: UpdateOptions,
    ) -> UpdateReport {
        self.updater
            .update_memory(&mut self.memory, chapter, content, options)
            .await
    }

    pub async fn compress_memory(&mut self) -> CompressionReport {
        self.updater.compress_memory(&mut self.memory).await
    }

    /// Whether `chapter` warrants a check, given the last checkpoint and
    /// the project's events.
    pub fn should_check_continuity(&self, chapter: u32, forced: bool) -> bool {
        self.optimizer.should_check_continuity(
            chapter,
            self.optimizer.last_check_chapter(),
            &self.project.events,
            forced,
        )
    }

    pub fn register_checkpoint(&mut self, chapter: u32) {
        self.optimizer.register_checkpoint(&self.memory, chapter);
    }

    pub fn diff_context(&self, chapter: u32) -> DiffContext {
        self.optimizer.diff_context(&self.memory, chapter)
    }

    pub fn estimate_cost(&self, options: &CostEstimateOptions) -> CostEstimate {
        self.optimizer.estimate_full_novel_cost(options)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Memory plus costs, stamped with the current time.
    pub fn export_memory(&self) -> MemoryExport {
        MemoryExport::new(self.memory.clone(), self.client.costs())
    }

    /// Save the memory export as pretty JSON.
    pub async fn save_memory(&self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let content = serde_json::to_string_pretty(&self.export_memory())?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Restore memory and costs from a saved export.
    pub async fn load_memory(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        let content = fs::read_to_string(path).await?;
        let export: MemoryExport = serde_json::from_str(&content)?;

        self.memory = export.memory.normalized();
        self.client.restore_costs(export.costs);
        self.optimizer.reset();
        self.updater.reset();
        info!(memory = ?self.memory.stats(), "memory restored");
        Ok(())
    }
}
