use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use panelforge_contracts::events::ScriptEvent;
use panelforge_contracts::naming::{file_timestamp, sanitize_title};
use panelforge_contracts::script::StoryboardScript;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::ForgeError;
use crate::normalize::normalize_text;
use crate::providers::{ChatMessage, ScriptWriter};

pub const MIN_CONCEPT_CHARS: usize = 10;

const STORYBOARD_SYSTEM_PROMPT: &str = "You are a comic storyboard writer. Turn the user's story \
concept into a storyboard. Answer with a single JSON object and nothing else, shaped as \
{\"story_title\": string, \"storyboard\": [{\"scene_number\": integer starting at 1, \
\"description\": string, \"visual_elements\": string}]}. Write 4 to 8 scenes. Each description \
says what happens; each visual_elements lists characters, setting, camera framing and mood.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavedScript {
    pub script_data: Value,
    pub file_path: String,
}

/// Storyboard generation from a free-form story concept.
#[derive(Clone)]
pub struct ScriptService {
    writer: Arc<dyn ScriptWriter>,
    scripts_dir: PathBuf,
}

impl ScriptService {
    pub fn new(writer: Arc<dyn ScriptWriter>, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            writer,
            scripts_dir: scripts_dir.into(),
        }
    }

    pub async fn generate(&self, concept: &str) -> Result<SavedScript, ForgeError> {
        let concept = validate_concept(concept)?;
        let raw = self.writer.complete(&storyboard_messages(concept)).await?;
        let script = normalize_text(&raw)?;
        self.save(&script).await
    }

    /// Same as [`generate`](Self::generate) but reports progress and every
    /// upstream delta through `on_event`. The last event is always
    /// `complete` or `error`.
    pub async fn generate_streaming(
        &self,
        concept: &str,
        on_event: &mut (dyn FnMut(ScriptEvent) + Send),
    ) -> Result<SavedScript, ForgeError> {
        let result = self.stream_inner(concept, on_event).await;
        match &result {
            Ok(saved) => on_event(ScriptEvent::Complete {
                script_data: saved.script_data.clone(),
                file_path: saved.file_path.clone(),
            }),
            Err(err) => {
                warn!(error = %err, "script generation failed");
                on_event(ScriptEvent::Error {
                    message: err.user_message(),
                });
            }
        }
        result
    }

    async fn stream_inner(
        &self,
        concept: &str,
        on_event: &mut (dyn FnMut(ScriptEvent) + Send),
    ) -> Result<SavedScript, ForgeError> {
        let concept = validate_concept(concept)?;
        on_event(ScriptEvent::progress("Generating storyboard..."));
        let content = self
            .writer
            .stream(&storyboard_messages(concept), &mut |delta: &str| {
                on_event(ScriptEvent::Chunk {
                    content: delta.to_string(),
                })
            })
            .await?;
        on_event(ScriptEvent::progress("Parsing storyboard..."));
        let script = normalize_text(&content)?;
        on_event(ScriptEvent::progress(format!(
            "Saving storyboard with {} scenes...",
            script.len()
        )));
        self.save(&script).await
    }

    async fn save(&self, script: &StoryboardScript) -> Result<SavedScript, ForgeError> {
        tokio::fs::create_dir_all(&self.scripts_dir)
            .await
            .map_err(|err| ForgeError::io(format!("create {}", self.scripts_dir.display()), err))?;
        let stem = format!(
            "{}_{}",
            sanitize_title(&script.title, "storyboard"),
            file_timestamp(Utc::now())
        );
        let script_data = serde_json::to_value(script)
            .map_err(|err| ForgeError::MalformedContent(format!("storyboard: {err}")))?;
        let body = serde_json::to_string_pretty(&script_data)
            .map_err(|err| ForgeError::MalformedContent(format!("storyboard: {err}")))?;
        let (path, mut file) = claim_script_file(&self.scripts_dir, &stem).await?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|err| ForgeError::io(format!("write {}", path.display()), err))?;
        file.flush()
            .await
            .map_err(|err| ForgeError::io(format!("write {}", path.display()), err))?;
        info!(path = %path.display(), scenes = script.len(), "storyboard saved");
        Ok(SavedScript {
            script_data,
            file_path: path.display().to_string(),
        })
    }
}

// Two storyboards with the same title in the same second get `-1`, `-2`, ...
// suffixes. `create_new` makes the claim atomic across concurrent saves.
async fn claim_script_file(dir: &Path, stem: &str) -> Result<(PathBuf, File), ForgeError> {
    let mut counter = 0u32;
    loop {
        let file_name = if counter == 0 {
            format!("{stem}.json")
        } else {
            format!("{stem}-{counter}.json")
        };
        let path = dir.join(file_name);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => counter += 1,
            Err(err) => return Err(ForgeError::io(format!("create {}", path.display()), err)),
        }
    }
}

pub fn validate_concept(raw: &str) -> Result<&str, ForgeError> {
    let concept = raw.trim();
    if concept.chars().count() < MIN_CONCEPT_CHARS {
        return Err(ForgeError::InvalidInput(format!(
            "The story concept must be at least {MIN_CONCEPT_CHARS} characters long."
        )));
    }
    Ok(concept)
}

fn storyboard_messages(concept: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(STORYBOARD_SYSTEM_PROMPT),
        ChatMessage::user(concept),
    ]
}
