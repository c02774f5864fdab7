use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MANIFEST_SCHEMA_VERSION: u64 = 1;
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "webp"];

/// Logical position of an artifact inside a comic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ArtifactSlot {
    Cover,
    Panel(u32),
    Single,
}

impl ArtifactSlot {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        match trimmed {
            "cover" => return Some(Self::Cover),
            "single" => return Some(Self::Single),
            _ => {}
        }
        trimmed
            .strip_prefix("panel:")
            .and_then(|index| index.trim().parse::<u32>().ok())
            .filter(|index| *index > 0)
            .map(Self::Panel)
    }

    // Zero padded so a plain name sort yields cover, panel 1, panel 2, ...
    pub fn file_prefix(&self) -> String {
        match self {
            Self::Cover => "000-cover".to_string(),
            Self::Panel(index) => format!("{index:03}-panel"),
            Self::Single => "image".to_string(),
        }
    }
}

impl fmt::Display for ArtifactSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cover => write!(f, "cover"),
            Self::Panel(index) => write!(f, "panel:{index}"),
            Self::Single => write!(f, "single"),
        }
    }
}

impl From<ArtifactSlot> for String {
    fn from(slot: ArtifactSlot) -> Self {
        slot.to_string()
    }
}

impl TryFrom<String> for ArtifactSlot {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("unknown artifact slot '{raw}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub file_name: String,
    pub slot: ArtifactSlot,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub size_bytes: u64,
}

pub fn is_image_file_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lowered = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lowered.as_str())
        })
        .unwrap_or(false)
}

/// Per-session record of everything written into the session directory.
///
/// The directory stays the source of truth for which files exist; the manifest
/// only carries the metadata (slot, description) a bare file cannot.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactManifest {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub artifacts: Vec<Artifact>,
}

impl ArtifactManifest {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            schema_version: MANIFEST_SCHEMA_VERSION,
            session_id: session_id.into(),
            created_at: now_utc_iso(),
            artifacts: Vec::new(),
        }
    }

    /// Rebuilds a manifest from its on-disk text, keeping whatever entries still
    /// decode. A corrupt file yields an empty manifest rather than an error.
    pub fn parse(path: impl Into<PathBuf>, session_id: impl Into<String>, raw: &str) -> Self {
        let mut manifest = Self::new(path, session_id);
        let payload: Value = serde_json::from_str(raw).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return manifest;
        };

        manifest.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(manifest.schema_version);
        manifest.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(manifest.created_at);

        if let Some(rows) = obj.get("artifacts").and_then(Value::as_array) {
            for row in rows {
                if let Ok(parsed) = serde_json::from_value::<Artifact>(row.clone()) {
                    manifest.artifacts.push(parsed);
                }
            }
        }
        manifest
    }

    pub fn record(&mut self, artifact: Artifact) {
        if let Some(existing) = self
            .artifacts
            .iter_mut()
            .find(|row| row.file_name == artifact.file_name)
        {
            *existing = artifact;
            return;
        }
        self.artifacts.push(artifact);
    }

    pub fn get(&self, file_name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|row| row.file_name == file_name)
    }

    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        root.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        root.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        root.insert(
            "artifacts".to_string(),
            serde_json::to_value(&self.artifacts).unwrap_or(Value::Array(Vec::new())),
        );
        Value::Object(root)
    }

    pub fn to_pretty_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
