use std::sync::Arc;

use async_trait::async_trait;
use panelforge_contracts::artifacts::ArtifactSlot;
use serde::Serialize;
use serde_json::Value;

use crate::config::{EngineConfig, ProviderKind};
use crate::error::ForgeError;
use crate::upstream::{UpstreamClient, UpstreamError};

mod ark;
mod dryrun;

pub use ark::{ArkImageProvider, ArkScriptWriter, SseDecoder, SseEvent};
pub use dryrun::{DryrunImageProvider, DryrunScriptWriter};

pub const DEFAULT_SIZE: &str = "2048x2048";

// Recommended Seedream pixel sizes per aspect ratio.
const SIZE_CANDIDATES: &[(&str, u32, u32)] = &[
    ("1:1", 2048, 2048),
    ("4:3", 2304, 1728),
    ("3:4", 1728, 2304),
    ("16:9", 2560, 1440),
    ("9:16", 1440, 2560),
    ("3:2", 2496, 1664),
    ("2:3", 1664, 2496),
    ("21:9", 3024, 1296),
];

const MIN_EDGE: u32 = 512;
const MAX_EDGE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    pub prompt: String,
    pub size: String,
    pub slot: ArtifactSlot,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub extension: String,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, job: &ImageJob) -> Result<GeneratedImage, ForgeError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait ScriptWriter: Send + Sync {
    fn name(&self) -> &str;

    /// Raw response text; usually a chat completion envelope.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ForgeError>;

    /// Streams content deltas into `on_chunk` and returns the accumulated
    /// content.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String, ForgeError>;
}

pub fn build_image_generator(
    config: &EngineConfig,
    client: Arc<UpstreamClient>,
) -> Arc<dyn ImageGenerator> {
    match config.image_provider {
        ProviderKind::Ark => Arc::new(ArkImageProvider::new(config, client)),
        ProviderKind::Dryrun => Arc::new(DryrunImageProvider),
    }
}

pub fn build_script_writer(
    config: &EngineConfig,
    client: Arc<UpstreamClient>,
) -> Arc<dyn ScriptWriter> {
    match config.text_provider {
        ProviderKind::Ark => Arc::new(ArkScriptWriter::new(config, client)),
        ProviderKind::Dryrun => Arc::new(DryrunScriptWriter),
    }
}

/// Splits exhausted upstream failures into policy rejections and plain
/// unavailability, based on the structured error code in the body.
pub fn classify_upstream_failure(err: UpstreamError) -> ForgeError {
    match content_policy_message(&err.body) {
        Some(message) => ForgeError::ContentRejected {
            message,
            status: err.status,
        },
        None => ForgeError::UpstreamUnavailable(err),
    }
}

pub fn content_policy_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body.trim()).ok()?;
    let error = parsed.get("error").unwrap_or(&parsed);
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(Value::as_str)?;
    if !is_content_policy_code(code) {
        return None;
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .unwrap_or(code);
    Some(message.to_string())
}

fn is_content_policy_code(code: &str) -> bool {
    let lowered = code.to_ascii_lowercase();
    lowered.contains("sensitivecontent")
        || lowered.contains("content_policy")
        || lowered.contains("content_filter")
}

/// Maps free-form size requests onto sizes the image endpoint accepts.
pub fn normalize_image_size(raw: &str, warnings: &mut Vec<String>) -> String {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return DEFAULT_SIZE.to_string();
    }
    if matches!(normalized.as_str(), "1k" | "2k" | "4k") {
        return normalized.to_ascii_uppercase();
    }
    match normalized.as_str() {
        "square" => return DEFAULT_SIZE.to_string(),
        "portrait" | "tall" => return "1728x2304".to_string(),
        "landscape" | "wide" => return "2304x1728".to_string(),
        _ => {}
    }
    if let Some((_, width, height)) = SIZE_CANDIDATES
        .iter()
        .find(|(ratio, _, _)| *ratio == normalized)
    {
        return format!("{width}x{height}");
    }
    if let Some((width, height)) = parse_dims(&normalized) {
        let clamped = (width.clamp(MIN_EDGE, MAX_EDGE), height.clamp(MIN_EDGE, MAX_EDGE));
        if clamped != (width, height) {
            warnings.push(format!(
                "Size {width}x{height} out of range; using {}x{}.",
                clamped.0, clamped.1
            ));
        }
        return format!("{}x{}", clamped.0, clamped.1);
    }
    if let Some((left, right)) = parse_ratio(&normalized) {
        let target = left as f64 / right as f64;
        let nearest = SIZE_CANDIDATES.iter().min_by(|a, b| {
            let da = (a.1 as f64 / a.2 as f64 - target).abs();
            let db = (b.1 as f64 / b.2 as f64 - target).abs();
            da.total_cmp(&db)
        });
        if let Some((ratio, width, height)) = nearest {
            warnings.push(format!("Aspect ratio {left}:{right} unsupported; using {ratio}."));
            return format!("{width}x{height}");
        }
    }
    warnings.push(format!("Size '{}' unsupported; using {DEFAULT_SIZE}.", raw.trim()));
    DEFAULT_SIZE.to_string()
}

pub fn parse_dims(size: &str) -> Option<(u32, u32)> {
    let raw = size.trim().to_ascii_lowercase();
    let (w, h) = raw
        .split_once('x')
        .or_else(|| raw.split_once('*'))
        .or_else(|| raw.split_once('×'))?;
    let width = w.trim().parse::<u32>().ok()?;
    let height = h.trim().parse::<u32>().ok()?;
    (width > 0 && height > 0).then_some((width, height))
}

fn parse_ratio(raw: &str) -> Option<(u32, u32)> {
    let (left, right) = raw.split_once(':')?;
    let left = left.trim().parse::<u32>().ok()?;
    let right = right.trim().parse::<u32>().ok()?;
    (left > 0 && right > 0).then_some((left, right))
}
