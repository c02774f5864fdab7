use serde::{Deserialize, Serialize};

use crate::artifacts::{Artifact, ArtifactSlot};

pub const REPORT_FILE_NAME: &str = "report.json";

/// Coarse failure class reported to clients for a single batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ContentRejected,
    UpstreamUnavailable,
    MalformedContent,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Success {
        artifact: Artifact,
    },
    Failed {
        error_kind: FailureClass,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub index: usize,
    pub slot: ArtifactSlot,
    pub attempts: u32,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub results: Vec<ItemResult>,
    pub success_count: usize,
    pub error_count: usize,
}

impl BatchReport {
    pub fn new(
        session_id: impl Into<String>,
        started_at: impl Into<String>,
        finished_at: impl Into<String>,
        results: Vec<ItemResult>,
    ) -> Self {
        let success_count = results.iter().filter(|row| row.is_success()).count();
        let error_count = results.len() - success_count;
        Self {
            session_id: session_id.into(),
            started_at: started_at.into(),
            finished_at: finished_at.into(),
            results,
            success_count,
            error_count,
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }
}

/// Live progress record emitted after every batch item, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub session_id: String,
    pub index: usize,
    pub slot: ArtifactSlot,
    pub completed: usize,
    pub total: usize,
    pub ok: bool,
    pub file_name: Option<String>,
    pub message: Option<String>,
}
