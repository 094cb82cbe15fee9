//! Progress events for the host UI.

use crate::batch::BatchIssue;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// Where a long-running operation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    // Batch runs
    Started,
    BatchStarted,
    BatchFinished,
    Rewriting,
    Compressing,
    Completed,
    Cancelled,

    // Writing flow
    Planning,
    Issues,
    Writing,
    Updating,
    Validating,
    Done,
}

/// One progress update, shaped for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: ProgressStage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<BatchIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl ProgressEvent {
    pub fn new(stage: ProgressStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            current: None,
            total: None,
            issues: Vec::new(),
            cost: None,
        }
    }

    pub fn with_position(mut self, current: u32, total: u32) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        self
    }

    pub fn with_issues(mut self, issues: Vec<BatchIssue>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Receives progress events.
pub trait ProgressSink: Send {
    fn report(&mut self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(ProgressEvent) + Send,
{
    fn report(&mut self, event: ProgressEvent) {
        self(event)
    }
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn report(&mut self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&mut self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_sink_collects() {
        let mut seen = Vec::new();
        {
            let mut sink = |event: ProgressEvent| seen.push(event.stage);
            sink.report(ProgressEvent::new(ProgressStage::Started, "go"));
            sink.report(ProgressEvent::new(ProgressStage::Completed, "done"));
        }
        assert_eq!(seen, vec![ProgressStage::Started, ProgressStage::Completed]);
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut sink = tx;
        sink.report(ProgressEvent::new(ProgressStage::Writing, "drafting").with_position(2, 5));
        drop(sink);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.current, Some(2));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_event_shape() {
        let event = ProgressEvent::new(ProgressStage::BatchStarted, "x").with_cost(0.5);
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["stage"], "batch_started");
        assert_eq!(json["cost"], 0.5);
        assert!(json.get("current").is_none());
    }
}
