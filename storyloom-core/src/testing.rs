//! Testing utilities.
//!
//! - `ScriptedOracle` for deterministic tests without API calls
//! - Helpers for building small manuscripts

use crate::oracle::{Completion, ModelTier, Oracle, OracleError, OracleOptions, TokenUsage};
use crate::project::{ManuscriptNode, Project};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// A prompt the oracle received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub prompt: String,
    pub tier: ModelTier,
    pub temperature: f32,
}

#[derive(Default)]
struct ScriptState {
    queue: VecDeque<String>,
    calls: Vec<RecordedCall>,
    transient_failures: u32,
}

/// An oracle that returns scripted responses.
///
/// Replies come from, in order of precedence: the first rule whose needle
/// appears in the prompt, the queue, then the fallback. With none of those
/// the call fails, as does every call of a [`ScriptedOracle::failing`] oracle.
#[derive(Default)]
pub struct ScriptedOracle {
    state: Mutex<ScriptState>,
    rules: Vec<(String, String)>,
    fallback: Option<String>,
    usage: Option<TokenUsage>,
    fail: bool,
    truncate: bool,
}

impl ScriptedOracle {
    /// Create an oracle that returns `responses` in order.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                queue: responses.into(),
                ..ScriptState::default()
            }),
            ..Self::default()
        }
    }

    /// An oracle whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Reply with `response` whenever the prompt contains `needle`.
    pub fn with_rule(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((needle.into(), response.into()));
        self
    }

    /// Reply used once the queue is exhausted.
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Token usage reported with every reply.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Fail the next `count` calls with a network error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.state().transient_failures = count;
        self
    }

    /// Mark every reply as cut off at the token limit.
    pub fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state().calls.iter().map(|c| c.prompt.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(
        &self,
        prompt: &str,
        options: &OracleOptions,
    ) -> Result<Completion, OracleError> {
        let mut state = self.state();
        state.calls.push(RecordedCall {
            prompt: prompt.to_string(),
            tier: options.tier,
            temperature: options.temperature,
        });

        if self.fail {
            return Err(OracleError::Other("scripted failure".to_string()));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            let error = claude::Error::Network("connection reset".to_string());
            return Err(OracleError::Claude(error));
        }

        let text = self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .or_else(|| state.queue.pop_front())
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| OracleError::Other("no scripted response left".to_string()))?;

        Ok(Completion {
            text,
            model: "scripted".to_string(),
            usage: self.usage,
            truncated: self.truncate,
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A project whose manuscript holds `count` chapters in one part.
pub fn project_with_chapters(count: u32) -> Project {
    let chapters = (1..=count)
        .map(|n| ManuscriptNode::chapter(format!("Chapter {n}"), format!("Text of chapter {n}.")))
        .collect();
    Project {
        title: Some("Test Novel".to_string()),
        manuscript: ManuscriptNode::part("Book", chapters),
        ..Project::default()
    }
}
