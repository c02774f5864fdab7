use std::path::{Path, PathBuf};
use std::sync::Arc;

use panelforge_contracts::artifacts::now_utc_iso;
use panelforge_contracts::events::EventPayload;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ForgeError;

pub const JOURNAL_FILE_NAME: &str = "events.jsonl";

/// Append-only JSONL log of what happened inside one session.
#[derive(Debug, Clone)]
pub struct SessionJournal {
    inner: Arc<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl SessionJournal {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub async fn emit(&self, event_type: &str, payload: EventPayload) -> Result<Value, ForgeError> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let mut line = serde_json::to_string(&event)
            .map_err(|err| ForgeError::MalformedContent(format!("journal event: {err}")))?;
        line.push('\n');

        let _guard = self.inner.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .await
            .map_err(|err| {
                ForgeError::io(format!("open {}", self.inner.path.display()), err)
            })?;
        file.write_all(line.as_bytes()).await.map_err(|err| {
            ForgeError::io(format!("append {}", self.inner.path.display()), err)
        })?;
        file.flush().await.map_err(|err| {
            ForgeError::io(format!("flush {}", self.inner.path.display()), err)
        })?;
        Ok(Value::Object(event))
    }

    /// Journal writes never fail the operation they describe.
    pub async fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload).await {
            warn!(
                session_id = %self.inner.session_id,
                event_type,
                error = %err,
                "journal write failed"
            );
        }
    }
}
