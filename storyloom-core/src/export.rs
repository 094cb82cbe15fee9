//! JSON export of story memory.

use crate::cost::CostLedger;
use crate::memory::StoryMemory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `{generatedAt, ...storyMemory, costs}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryExport {
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub memory: StoryMemory,
    #[serde(default)]
    pub costs: CostLedger,
}

impl MemoryExport {
    pub fn new(memory: StoryMemory, costs: CostLedger) -> Self {
        Self {
            generated_at: Utc::now(),
            memory,
            costs,
        }
    }
}
