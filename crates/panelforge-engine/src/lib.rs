use std::path::Path;
use std::sync::Arc;

use panelforge_contracts::artifacts::{Artifact, ArtifactSlot};
use panelforge_contracts::batch::BatchReport;
use panelforge_contracts::events::{BatchEvent, ScriptEvent};
use panelforge_contracts::styles::{ComicStyle, StyleRegistry, StyleSelector};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod batch;
pub mod config;
pub mod error;
pub mod normalize;
pub mod packaging;
pub mod plan;
pub mod providers;
pub mod recovery;
pub mod scripts;
pub mod sessions;
pub mod upstream;

use batch::BatchDriver;
use config::EngineConfig;
use error::ForgeError;
use packaging::PackagedFile;
use plan::{BatchItem, BatchPlan};
use providers::{build_image_generator, build_script_writer, DEFAULT_SIZE};
use scripts::{SavedScript, ScriptService};
use sessions::{SessionStore, SweepReport};
use upstream::{RetryPolicy, UpstreamClient};

/// Result of a single-image request.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub session_id: String,
    pub artifact: Artifact,
}

/// Everything the HTTP layer needs, wired from one [`EngineConfig`].
#[derive(Clone)]
pub struct ComicEngine {
    config: Arc<EngineConfig>,
    store: Arc<SessionStore>,
    driver: BatchDriver,
    scripts: ScriptService,
    styles: StyleSelector,
}

impl ComicEngine {
    pub async fn new(config: EngineConfig) -> Result<Self, ForgeError> {
        config.validate()?;
        let client = Arc::new(UpstreamClient::new(
            config.api_key.clone(),
            RetryPolicy::default(),
        ));
        let store = Arc::new(SessionStore::open(&config.temp_dir).await?);
        let driver = BatchDriver::new(build_image_generator(&config, client.clone()), store.clone());
        let scripts = ScriptService::new(build_script_writer(&config, client), &config.scripts_dir);
        let styles = StyleSelector::new(Some(load_styles(&config.styles_dir).await));
        info!(
            image_provider = config.image_provider.as_str(),
            text_provider = config.text_provider.as_str(),
            temp_dir = %config.temp_dir.display(),
            styles = styles.registry.names().len(),
            "engine ready"
        );
        Ok(Self {
            config: Arc::new(config),
            store,
            driver,
            scripts,
            styles,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    pub fn styles(&self) -> &StyleRegistry {
        &self.styles.registry
    }

    /// Generates one image into `session_id`, or into a fresh session when
    /// none is given. Unknown but well-formed ids are adopted.
    pub async fn generate_single(
        &self,
        prompt: &str,
        size: Option<&str>,
        style: Option<&str>,
        session_id: Option<&str>,
        slot: ArtifactSlot,
    ) -> Result<StoredImage, ForgeError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ForgeError::InvalidInput("A prompt is required.".to_string()));
        }
        let style = self.select_style(style)?;
        let session_id = match session_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self.store.create_session().await?,
        };
        let journal = self.store.open_session(&session_id).await?;
        let item = BatchItem {
            index: 0,
            slot,
            prompt: prompt.to_string(),
            description: prompt.to_string(),
        };
        let run = self
            .driver
            .generate_item(&session_id, &journal, &item, resolve_size(size), &style)
            .await;
        let artifact = run.outcome?;
        Ok(StoredImage {
            session_id,
            artifact,
        })
    }

    /// Runs a whole storyboard or panels document as one batch. Plan errors
    /// fail the call before any item is generated.
    pub async fn run_batch(
        &self,
        document: &Value,
        size: Option<&str>,
        style: Option<&str>,
        session_id: Option<&str>,
        include_cover: bool,
        on_event: &mut (dyn FnMut(BatchEvent) + Send),
    ) -> Result<BatchReport, ForgeError> {
        let plan = BatchPlan::from_document(document, include_cover)?;
        let style = self.select_style(style)?;
        let session_id = match session_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self.store.create_session().await?,
        };
        self.driver
            .run(&session_id, &plan, resolve_size(size), &style, on_event)
            .await
    }

    pub async fn generate_script(&self, concept: &str) -> Result<SavedScript, ForgeError> {
        self.scripts.generate(concept).await
    }

    pub async fn generate_script_streaming(
        &self,
        concept: &str,
        on_event: &mut (dyn FnMut(ScriptEvent) + Send),
    ) -> Result<SavedScript, ForgeError> {
        self.scripts.generate_streaming(concept, on_event).await
    }

    pub async fn session_files(&self, session_id: &str) -> Result<Vec<String>, ForgeError> {
        Ok(self
            .store
            .list_artifacts(session_id)
            .await?
            .into_iter()
            .map(|artifact| artifact.file_name)
            .collect())
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<(), ForgeError> {
        self.store.remove_session(session_id).await
    }

    pub async fn archive(&self, session_id: &str) -> Result<PackagedFile, ForgeError> {
        packaging::package_archive(&self.store, session_id).await
    }

    pub async fn document(
        &self,
        session_id: &str,
        title: Option<&str>,
    ) -> Result<PackagedFile, ForgeError> {
        packaging::package_document(&self.store, session_id, title).await
    }

    pub async fn purge_expired(&self) -> Result<SweepReport, ForgeError> {
        self.store.purge_expired(self.config.retention).await
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        sessions::spawn_reaper(
            self.store.clone(),
            self.config.retention,
            self.config.sweep_interval,
        )
    }

    fn select_style(&self, requested: Option<&str>) -> Result<ComicStyle, ForgeError> {
        let selection = self
            .styles
            .select(requested)
            .map_err(ForgeError::Configuration)?;
        if let Some(reason) = selection.fallback_reason.as_deref() {
            if selection.requested.is_some() {
                warn!(style = %selection.style.name, "{reason}");
            } else {
                debug!(style = %selection.style.name, "{reason}");
            }
        }
        Ok(selection.style)
    }
}

fn resolve_size(size: Option<&str>) -> &str {
    size.map(str::trim)
        .filter(|size| !size.is_empty())
        .unwrap_or(DEFAULT_SIZE)
}

/// Builtin styles plus one style per `<name>.md` prompt file in `dir`.
/// A missing directory leaves the builtins alone.
async fn load_styles(dir: &Path) -> StyleRegistry {
    let mut overrides = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return StyleRegistry::with_prompt_overrides(overrides);
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(prompt) => overrides.push((name.to_string(), prompt)),
            Err(err) => warn!(path = %path.display(), error = %err, "style prompt unreadable"),
        }
    }
    overrides.sort();
    StyleRegistry::with_prompt_overrides(overrides)
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
