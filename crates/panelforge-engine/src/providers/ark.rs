use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    classify_upstream_failure, content_policy_message, normalize_image_size, ChatMessage,
    GeneratedImage, ImageGenerator, ImageJob, ScriptWriter,
};
use crate::config::EngineConfig;
use crate::error::{truncate_text, ForgeError};
use crate::upstream::{TransportCause, UpstreamClient, UpstreamError};

const SCRIPT_MAX_TOKENS: u32 = 8192;
const SCRIPT_TEMPERATURE: f64 = 0.7;

pub struct ArkImageProvider {
    client: Arc<UpstreamClient>,
    endpoint: String,
    model: String,
    attempts: u32,
    timeout: Duration,
    download_timeout: Duration,
}

impl ArkImageProvider {
    pub fn new(config: &EngineConfig, client: Arc<UpstreamClient>) -> Self {
        Self {
            client,
            endpoint: config.images_endpoint(),
            model: config.image_model.clone(),
            attempts: config.upstream_retries,
            timeout: config.image_timeout,
            download_timeout: config.download_timeout,
        }
    }

    async fn image_bytes(&self, item: &Value) -> Result<Vec<u8>, ForgeError> {
        if let Some(encoded) = item.get("b64_json").and_then(Value::as_str) {
            return base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|err| {
                    ForgeError::MalformedContent(format!("image payload is not base64: {err}"))
                });
        }
        let url = item
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                ForgeError::MalformedContent("image result carries neither url nor b64_json".to_string())
            })?;
        self.client
            .fetch_bytes(url, self.attempts, self.download_timeout)
            .await
            .map_err(ForgeError::from)
    }
}

#[async_trait]
impl ImageGenerator for ArkImageProvider {
    fn name(&self) -> &str {
        "ark"
    }

    async fn generate(&self, job: &ImageJob) -> Result<GeneratedImage, ForgeError> {
        let mut warnings = Vec::new();
        let size = normalize_image_size(&job.size, &mut warnings);
        let payload = json!({
            "model": self.model,
            "prompt": job.prompt,
            "size": size,
            "n": 1,
            "response_format": "url",
            "watermark": false,
        });
        debug!(slot = %job.slot, size = %size, model = %self.model, "requesting image");

        let body = self
            .client
            .call(&self.endpoint, &payload, self.attempts, self.timeout)
            .await
            .map_err(classify_upstream_failure)?;
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            ForgeError::MalformedContent(format!(
                "image response is not JSON ({err}): {}",
                truncate_text(&body, 200)
            ))
        })?;
        if let Some(message) = content_policy_message(&body) {
            return Err(ForgeError::ContentRejected {
                message,
                status: None,
            });
        }
        let item = parsed
            .get("data")
            .and_then(|data| data.get(0))
            .ok_or_else(|| ForgeError::MalformedContent("image response has no data".to_string()))?;

        let bytes = self.image_bytes(item).await?;
        let extension = image::guess_format(&bytes)
            .ok()
            .and_then(|format| format.extensions_str().first().copied())
            .unwrap_or("png")
            .to_string();
        info!(slot = %job.slot, bytes = bytes.len(), extension = %extension, "image generated");
        Ok(GeneratedImage {
            bytes,
            extension,
            warnings,
        })
    }
}

pub struct ArkScriptWriter {
    client: Arc<UpstreamClient>,
    endpoint: String,
    model: String,
    attempts: u32,
    timeout: Duration,
}

impl ArkScriptWriter {
    pub fn new(config: &EngineConfig, client: Arc<UpstreamClient>) -> Self {
        Self {
            client,
            endpoint: config.chat_endpoint(),
            model: config.text_model.clone(),
            attempts: config.upstream_retries,
            timeout: config.text_timeout,
        }
    }

    fn payload(&self, messages: &[ChatMessage], stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
            "max_tokens": SCRIPT_MAX_TOKENS,
            "temperature": SCRIPT_TEMPERATURE,
        })
    }

    fn interrupted(&self, cause: TransportCause) -> ForgeError {
        ForgeError::UpstreamUnavailable(UpstreamError::stream_interrupted(&self.endpoint, cause))
    }
}

#[async_trait]
impl ScriptWriter for ArkScriptWriter {
    fn name(&self) -> &str {
        "ark"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ForgeError> {
        self.client
            .call(&self.endpoint, &self.payload(messages, false), self.attempts, self.timeout)
            .await
            .map_err(classify_upstream_failure)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'s> FnMut(&'s str) + Send),
    ) -> Result<String, ForgeError> {
        let response = self
            .client
            .open_stream(&self.endpoint, &self.payload(messages, true), self.attempts, self.timeout)
            .await
            .map_err(classify_upstream_failure)?;
        // The body gets the same budget as a non-streamed answer, however
        // often the upstream sends bytes.
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut content = String::new();

        while !decoder.is_done() {
            let next = tokio::time::timeout_at(deadline, body.next())
                .await
                .map_err(|_| self.interrupted(TransportCause::Timeout(self.timeout)))?;
            let events = match next {
                Some(chunk) => {
                    let chunk = chunk
                        .map_err(|err| self.interrupted(TransportCause::Stream(err.to_string())))?;
                    decoder.push(&chunk)
                }
                None => decoder.finish(),
            };
            for event in &events {
                if let Some(delta) = stream_delta(event)? {
                    content.push_str(&delta);
                    on_chunk(&delta);
                }
            }
        }
        Ok(content)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Done,
}

/// Incremental `text/event-stream` decoder for chat completion chunks.
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across network chunks decode intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    done: bool,
    finished: bool,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(event) = self.decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        self.finished = true;
        let rest = std::mem::take(&mut self.pending);
        self.decode_line(&rest).into_iter().collect()
    }

    pub fn is_done(&self) -> bool {
        self.done || self.finished
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if self.done {
            return None;
        }
        let text = String::from_utf8_lossy(line);
        let data = text.trim().strip_prefix("data:")?.trim();
        if data.is_empty() {
            return None;
        }
        if data == "[DONE]" {
            self.done = true;
            return Some(SseEvent::Done);
        }
        serde_json::from_str::<Value>(data).ok().map(SseEvent::Data)
    }
}

fn stream_delta(event: &SseEvent) -> Result<Option<String>, ForgeError> {
    let SseEvent::Data(value) = event else {
        return Ok(None);
    };
    if value.get("error").is_some() {
        let raw = value.to_string();
        return Err(match content_policy_message(&raw) {
            Some(message) => ForgeError::ContentRejected {
                message,
                status: None,
            },
            None => ForgeError::MalformedContent(format!(
                "stream reported an error: {}",
                truncate_text(&raw, 200)
            )),
        });
    }
    Ok(value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|delta| !delta.is_empty())
        .map(str::to_string))
}
