//! The language-model oracle seam.
//!
//! Everything the orchestrator learns from the model goes through the
//! [`Oracle`] trait. The production implementation is [`ClaudeOracle`];
//! tests use [`crate::testing::ScriptedOracle`]. Output is untrusted text and
//! is decoded separately by [`crate::parse`].

use crate::cost::{CostLedger, TierPricing};
use async_trait::async_trait;
use claude::{Claude, Request, StopReason};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default model for checks, extraction and compression (fast and cheap).
pub const FAST_MODEL: &str = "claude-3-5-haiku-20241022";

/// Default model for prose generation.
pub const CREATIVE_MODEL: &str = "claude-sonnet-4-20250514";

/// Extra attempts after a transient failure.
pub const DEFAULT_RETRIES: u32 = 2;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Errors from an oracle call.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("No oracle configured - set ANTHROPIC_API_KEY")]
    NotConfigured,

    #[error("Claude API error: {0}")]
    Claude(#[from] claude::Error),

    #[error("Oracle returned an empty response")]
    Empty,

    #[error("Oracle failure: {0}")]
    Other(String),
}

impl OracleError {
    /// Whether the same call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            OracleError::Claude(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Which class of model a call should be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelTier {
    /// Cheap, fast model for structured checks.
    Fast,
    /// Higher-capability model for prose.
    Creative,
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct OracleOptions {
    pub tier: ModelTier,
    pub temperature: f32,
    pub max_tokens: usize,
    pub system: Option<String>,
}

impl OracleOptions {
    /// Options for a deterministic structured-output call.
    pub fn structured(max_tokens: usize) -> Self {
        Self {
            tier: ModelTier::Fast,
            temperature: 0.0,
            max_tokens,
            system: None,
        }
    }

    /// Options for a prose generation call.
    pub fn creative(max_tokens: usize, temperature: f32) -> Self {
        Self {
            tier: ModelTier::Creative,
            temperature,
            max_tokens,
            system: None,
        }
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Token counts reported for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: usize,
    pub output: usize,
}

impl From<claude::Usage> for TokenUsage {
    fn from(usage: claude::Usage) -> Self {
        Self {
            input: usage.input_tokens,
            output: usage.output_tokens,
        }
    }
}

/// A successful oracle reply.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    /// The reply stopped at the token limit.
    pub truncated: bool,
}

/// An external text oracle.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Send one prompt and return the raw text reply.
    async fn complete(&self, prompt: &str, options: &OracleOptions)
        -> Result<Completion, OracleError>;

    /// Short provider name for logs.
    fn name(&self) -> &str;
}

/// Oracle backed by the Anthropic Messages API.
pub struct ClaudeOracle {
    client: Claude,
    fast_model: String,
    creative_model: String,
}

impl ClaudeOracle {
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            fast_model: FAST_MODEL.to_string(),
            creative_model: CREATIVE_MODEL.to_string(),
        }
    }

    /// Create from environment (ANTHROPIC_API_KEY).
    pub fn from_env() -> Result<Self, OracleError> {
        Ok(Self::new(Claude::from_env()?))
    }

    pub fn with_fast_model(mut self, model: impl Into<String>) -> Self {
        self.fast_model = model.into();
        self
    }

    pub fn with_creative_model(mut self, model: impl Into<String>) -> Self {
        self.creative_model = model.into();
        self
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Creative => &self.creative_model,
        }
    }
}

#[async_trait]
impl Oracle for ClaudeOracle {
    async fn complete(
        &self,
        prompt: &str,
        options: &OracleOptions,
    ) -> Result<Completion, OracleError> {
        let mut request = Request::prompt(prompt)
            .with_model(self.model_for(options.tier))
            .with_max_tokens(options.max_tokens)
            .with_temperature(options.temperature);

        if let Some(ref system) = options.system {
            request = request.with_system(system);
        }

        let response = self.client.complete(request).await?;
        if response.text.trim().is_empty() {
            return Err(OracleError::Empty);
        }

        let truncated = response.stop_reason == StopReason::MaxTokens;
        if truncated {
            warn!(
                model = %response.model,
                max_tokens = options.max_tokens,
                "reply cut off at the token limit"
            );
        }

        Ok(Completion {
            text: response.text,
            model: response.model,
            usage: Some(response.usage.into()),
            truncated,
        })
    }

    fn name(&self) -> &str {
        "claude"
    }
}

/// Stand-in used when no provider is configured. Every call fails softly.
#[derive(Debug, Default)]
pub struct UnconfiguredOracle;

#[async_trait]
impl Oracle for UnconfiguredOracle {
    async fn complete(
        &self,
        _prompt: &str,
        options: &OracleOptions,
    ) -> Result<Completion, OracleError> {
        warn!(tier = ?options.tier, "oracle call skipped: no provider configured");
        Err(OracleError::NotConfigured)
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}

/// Shared handle to an oracle that meters every call into a cost ledger.
#[derive(Clone)]
pub struct OracleClient {
    oracle: Arc<dyn Oracle>,
    ledger: Arc<Mutex<CostLedger>>,
    pricing: TierPricing,
    retries: u32,
    retry_delay: Duration,
}

impl OracleClient {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            ledger: Arc::new(Mutex::new(CostLedger::default())),
            pricing: TierPricing::default(),
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_pricing(mut self, pricing: TierPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Retry transient failures up to `retries` times, doubling `delay` each time.
    pub fn with_retry(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn provider(&self) -> &str {
        self.oracle.name()
    }

    /// Call the oracle, recording usage and cost on success.
    ///
    /// Transient failures (network errors, rate limits, overload) are
    /// retried with backoff; anything else is returned at once.
    pub async fn ask(
        &self,
        prompt: &str,
        options: &OracleOptions,
    ) -> Result<Completion, OracleError> {
        debug!(
            provider = self.oracle.name(),
            tier = ?options.tier,
            prompt_chars = prompt.len(),
            "oracle call"
        );

        let mut attempt = 0;
        let mut delay = self.retry_delay;
        let result = loop {
            match self.oracle.complete(prompt, options).await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "transient oracle failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                result => break result,
            }
        };

        match result {
            Ok(completion) => {
                let usage = completion.usage.unwrap_or_default();
                let cost = self.pricing.cost_of(options.tier, usage);
                self.ledger().record(usage, cost);
                debug!(
                    model = %completion.model,
                    input_tokens = usage.input,
                    output_tokens = usage.output,
                    cost,
                    "oracle reply"
                );
                Ok(completion)
            }
            Err(e) => {
                warn!(provider = self.oracle.name(), error = %e, "oracle call failed");
                Err(e)
            }
        }
    }

    /// Snapshot of the accumulated costs.
    pub fn costs(&self) -> CostLedger {
        self.ledger().clone()
    }

    /// Replace the ledger, e.g. when restoring a saved export.
    pub fn restore_costs(&self, ledger: CostLedger) {
        *self.ledger() = ledger;
    }

    fn ledger(&self) -> MutexGuard<'_, CostLedger> {
        // The ledger holds plain counters; a poisoned lock still has usable data.
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedOracle;

    #[tokio::test]
    async fn test_unconfigured_oracle_fails_softly() {
        let client = OracleClient::new(Arc::new(UnconfiguredOracle));
        let result = client.ask("hello", &OracleOptions::structured(10)).await;
        assert!(matches!(result, Err(OracleError::NotConfigured)));
        assert_eq!(client.costs().check_count, 0);
    }

    #[tokio::test]
    async fn test_client_meters_usage() {
        let oracle = ScriptedOracle::new(vec!["{}".to_string()])
            .with_usage(TokenUsage {
                input: 1_000_000,
                output: 0,
            });
        let client = OracleClient::new(Arc::new(oracle)).with_pricing(TierPricing {
            fast_input_per_million: 2.0,
            ..TierPricing::default()
        });

        client.ask("p", &OracleOptions::structured(10)).await.unwrap();

        let costs = client.costs();
        assert_eq!(costs.check_count, 1);
        assert_eq!(costs.tokens.input, 1_000_000);
        assert!((costs.total_cost - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let oracle = Arc::new(
            ScriptedOracle::new(vec!["{}".to_string()]).with_transient_failures(2),
        );
        let client = OracleClient::new(oracle.clone()).with_retry(2, Duration::ZERO);

        let completion = client.ask("p", &OracleOptions::structured(10)).await.unwrap();

        assert_eq!(completion.text, "{}");
        assert_eq!(oracle.call_count(), 3);
        assert_eq!(client.costs().check_count, 1);
    }

    #[tokio::test]
    async fn test_retries_give_up() {
        let oracle = Arc::new(ScriptedOracle::default().with_transient_failures(5));
        let client = OracleClient::new(oracle.clone()).with_retry(1, Duration::ZERO);

        let result = client.ask("p", &OracleOptions::structured(10)).await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(oracle.call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let oracle = Arc::new(ScriptedOracle::failing());
        let client = OracleClient::new(oracle.clone()).with_retry(3, Duration::ZERO);

        assert!(client.ask("p", &OracleOptions::structured(10)).await.is_err());
        assert_eq!(oracle.call_count(), 1);
    }

    #[test]
    fn test_tier_model_routing() {
        let oracle = ClaudeOracle::new(Claude::new("k").unwrap()).with_fast_model("tiny");
        assert_eq!(oracle.model_for(ModelTier::Fast), "tiny");
        assert_eq!(oracle.model_for(ModelTier::Creative), CREATIVE_MODEL);
    }
}
