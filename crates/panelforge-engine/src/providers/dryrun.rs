use std::io::Cursor;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{
    normalize_image_size, parse_dims, ChatMessage, GeneratedImage, ImageGenerator, ImageJob,
    ScriptWriter,
};
use crate::error::{truncate_text, ForgeError};

const PREVIEW_EDGE: u32 = 256;
const STREAM_CHUNK_CHARS: usize = 48;
const BEATS: &[(&str, &str)] = &[
    ("The setting is introduced", "wide establishing shot"),
    ("The hero faces the problem", "close-up, tense expression"),
    ("The conflict peaks", "dynamic angle, motion lines"),
    ("The resolution", "warm light, calm composition"),
];

/// Offline image source: a solid colour derived from the prompt, at a
/// reduced resolution with the requested aspect ratio.
pub struct DryrunImageProvider;

#[async_trait]
impl ImageGenerator for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(&self, job: &ImageJob) -> Result<GeneratedImage, ForgeError> {
        let mut warnings = Vec::new();
        let size = normalize_image_size(&job.size, &mut warnings);
        let (width, height) = preview_dims(&size);
        let (r, g, b) = color_from_prompt(&job.prompt);
        let mut image = RgbImage::new(width, height);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| ForgeError::MalformedContent(format!("dryrun encode failed: {err}")))?;
        Ok(GeneratedImage {
            bytes,
            extension: "png".to_string(),
            warnings,
        })
    }
}

fn preview_dims(size: &str) -> (u32, u32) {
    let (width, height) = parse_dims(size).unwrap_or((PREVIEW_EDGE, PREVIEW_EDGE));
    let longest = width.max(height).max(1);
    let scale = |edge: u32| ((edge as u64 * PREVIEW_EDGE as u64) / longest as u64).max(1) as u32;
    (scale(width), scale(height))
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

/// Offline storyboard writer: four fixed beats around the user's concept.
pub struct DryrunScriptWriter;

impl DryrunScriptWriter {
    fn storyboard(messages: &[ChatMessage]) -> Value {
        let concept = messages
            .iter()
            .rev()
            .find(|message| message.role == "user")
            .map(|message| message.content.trim())
            .unwrap_or_default();
        let title = concept
            .split(|ch: char| matches!(ch, '.' | '!' | '?' | '\n' | '。'))
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| truncate_text(line, 40))
            .unwrap_or_else(|| "Untitled".to_string());
        let storyboard: Vec<Value> = BEATS
            .iter()
            .enumerate()
            .map(|(idx, (beat, framing))| {
                json!({
                    "scene_number": idx + 1,
                    "description": format!("{beat}: {}", truncate_text(concept, 120)),
                    "visual_elements": framing,
                })
            })
            .collect();
        json!({"story_title": title, "storyboard": storyboard})
    }

    fn content(messages: &[ChatMessage]) -> String {
        let pretty = serde_json::to_string_pretty(&Self::storyboard(messages))
            .unwrap_or_else(|_| "{}".to_string());
        format!("```json\n{pretty}\n```")
    }
}

#[async_trait]
impl ScriptWriter for DryrunScriptWriter {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ForgeError> {
        let envelope = json!({
            "id": "dryrun",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": Self::content(messages)},
                "finish_reason": "stop",
            }],
        });
        Ok(envelope.to_string())
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String, ForgeError> {
        let content = Self::content(messages);
        let chars: Vec<char> = content.chars().collect();
        for piece in chars.chunks(STREAM_CHUNK_CHARS) {
            let piece: String = piece.iter().collect();
            on_chunk(&piece);
            tokio::task::yield_now().await;
        }
        Ok(content)
    }
}
