use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::batch::{BatchProgress, BatchReport};

pub type EventPayload = Map<String, Value>;

/// Records streamed back while a storyboard script is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptEvent {
    Progress { message: String },
    Chunk { content: String },
    Complete { script_data: Value, file_path: String },
    Error { message: String },
}

impl ScriptEvent {
    pub fn progress(message: impl Into<String>) -> Self {
        Self::Progress {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Records streamed back while a batch of panels is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Progress(BatchProgress),
    Complete { report: BatchReport },
    Error { message: String },
}

/// One compact JSON object terminated by `\n`.
pub fn encode_ndjson<T: Serialize>(event: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    Ok(line)
}
