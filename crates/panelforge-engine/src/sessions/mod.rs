use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use panelforge_contracts::artifacts::{
    is_image_file_name, now_utc_iso, Artifact, ArtifactManifest, ArtifactSlot, MANIFEST_FILE_NAME,
};
use panelforge_contracts::batch::{BatchReport, REPORT_FILE_NAME};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ForgeError;
use crate::map_object;

mod journal;
mod reaper;

pub use journal::{SessionJournal, JOURNAL_FILE_NAME};
pub use reaper::{spawn_reaper, sweep_expired, SweepReport};

#[derive(Debug)]
struct SessionRecord {
    dir: PathBuf,
    manifest: tokio::sync::Mutex<ArtifactManifest>,
    journal: SessionJournal,
}

/// Session directories under one temp root plus their in-memory records.
///
/// The map lock is held only for lookups; everything that touches disk for a
/// session serializes on that session's own async mutex.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    sessions: Mutex<HashMap<String, Arc<SessionRecord>>>,
}

impl SessionStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ForgeError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|err| ForgeError::io(format!("create {}", root.display()), err))?;
        Ok(Self {
            root,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn create_session(&self) -> Result<String, ForgeError> {
        let session_id = Uuid::new_v4().to_string();
        self.open_session(&session_id).await?;
        info!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    /// Returns the record for `session_id`, adopting a directory left by an
    /// earlier process or creating a new one for an unseen id.
    pub async fn open_session(&self, session_id: &str) -> Result<SessionJournal, ForgeError> {
        let record = self.record(session_id, true).await?;
        Ok(record.journal.clone())
    }

    pub async fn journal(&self, session_id: &str) -> Result<SessionJournal, ForgeError> {
        Ok(self.record(session_id, false).await?.journal.clone())
    }

    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf, ForgeError> {
        if !is_session_id(session_id) {
            return Err(ForgeError::NotFound(format!("session '{session_id}'")));
        }
        Ok(self.root.join(session_id))
    }

    pub async fn write_artifact(
        &self,
        session_id: &str,
        bytes: &[u8],
        suggested_name: &str,
        slot: ArtifactSlot,
        description: &str,
    ) -> Result<Artifact, ForgeError> {
        let record = self.record(session_id, false).await?;
        let mut manifest = record.manifest.lock().await;

        let file_name = unique_file_name(&record.dir, &sanitize_file_name(suggested_name)).await;
        let path = record.dir.join(&file_name);
        let staging = record.dir.join(format!(".{file_name}.partial"));
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|err| ForgeError::io(format!("write {}", staging.display()), err))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|err| ForgeError::io(format!("rename {}", path.display()), err))?;

        let artifact = Artifact {
            file_name: file_name.clone(),
            slot,
            description: description.to_string(),
            created_at: now_utc_iso(),
            size_bytes: bytes.len() as u64,
        };
        manifest.record(artifact.clone());
        save_manifest(&manifest).await?;
        drop(manifest);

        record
            .journal
            .record(
                "artifact_written",
                map_object(json!({
                    "file_name": file_name,
                    "slot": slot,
                    "size_bytes": artifact.size_bytes,
                })),
            )
            .await;
        debug!(session_id, file_name = %artifact.file_name, "artifact written");
        Ok(artifact)
    }

    /// Image files in the session, sorted by name, with manifest metadata
    /// where it exists.
    pub async fn list_artifacts(&self, session_id: &str) -> Result<Vec<Artifact>, ForgeError> {
        let record = self.record(session_id, false).await?;
        let manifest = record.manifest.lock().await;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&record.dir)
            .await
            .map_err(|err| missing_or_io(err, session_id, &record.dir))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ForgeError::io(format!("scan {}", record.dir.display()), err))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !is_image_file_name(&name) {
                continue;
            }
            let size_bytes = entry.metadata().await.map(|meta| meta.len()).unwrap_or(0);
            names.push((name, size_bytes));
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|(name, size_bytes)| match manifest.get(&name) {
                Some(known) => known.clone(),
                None => Artifact {
                    file_name: name,
                    slot: ArtifactSlot::Single,
                    description: String::new(),
                    created_at: String::new(),
                    size_bytes,
                },
            })
            .collect())
    }

    pub async fn read_artifact(&self, session_id: &str, file_name: &str) -> Result<Vec<u8>, ForgeError> {
        let dir = self.existing_dir(session_id).await?;
        if sanitize_file_name(file_name) != file_name || !is_image_file_name(file_name) {
            return Err(ForgeError::NotFound(format!("artifact '{file_name}'")));
        }
        let path = dir.join(file_name);
        tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ForgeError::NotFound(format!("artifact '{file_name}'"))
            } else {
                ForgeError::io(format!("read {}", path.display()), err)
            }
        })
    }

    pub async fn write_report(&self, session_id: &str, report: &BatchReport) -> Result<PathBuf, ForgeError> {
        let record = self.record(session_id, false).await?;
        let _guard = record.manifest.lock().await;
        let path = record.dir.join(REPORT_FILE_NAME);
        let body = serde_json::to_string_pretty(report)
            .map_err(|err| ForgeError::MalformedContent(format!("batch report: {err}")))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|err| ForgeError::io(format!("write {}", path.display()), err))?;
        Ok(path)
    }

    pub async fn remove_session(&self, session_id: &str) -> Result<(), ForgeError> {
        let dir = self.existing_dir(session_id).await?;
        let record = self.forget(session_id);
        // Wait out any writer still holding the session.
        let _guard = match &record {
            Some(record) => Some(record.manifest.lock().await),
            None => None,
        };
        tokio::fs::remove_dir_all(&dir)
            .await
            .map_err(|err| missing_or_io(err, session_id, &dir))?;
        info!(session_id, "session removed");
        Ok(())
    }

    pub async fn purge_expired(&self, retention: Duration) -> Result<SweepReport, ForgeError> {
        let root = self.root.clone();
        let report = tokio::task::spawn_blocking(move || {
            sweep_expired(&root, SystemTime::now(), retention, |path| {
                std::fs::remove_dir_all(path)
            })
        })
        .await
        .map_err(|err| ForgeError::io("session sweep task", io::Error::other(err.to_string())))?;
        for session_id in &report.removed {
            self.forget(session_id);
        }
        Ok(report)
    }

    async fn existing_dir(&self, session_id: &str) -> Result<PathBuf, ForgeError> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(ForgeError::NotFound(format!("session '{session_id}'"))),
            Err(err) => Err(missing_or_io(err, session_id, &dir)),
        }
    }

    async fn record(&self, session_id: &str, create: bool) -> Result<Arc<SessionRecord>, ForgeError> {
        let dir = self.session_dir(session_id)?;
        let cached = self.lock_sessions().get(session_id).cloned();
        if let Some(record) = cached {
            if tokio::fs::metadata(&record.dir).await.is_ok() {
                return Ok(record);
            }
            // Swept from under us.
            self.forget(session_id);
            if !create {
                return Err(ForgeError::NotFound(format!("session '{session_id}'")));
            }
        }

        let exists = tokio::fs::metadata(&dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !exists {
            if !create {
                return Err(ForgeError::NotFound(format!("session '{session_id}'")));
            }
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|err| ForgeError::io(format!("create {}", dir.display()), err))?;
        }

        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let manifest = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(raw) => ArtifactManifest::parse(&manifest_path, session_id, &raw),
            Err(_) => ArtifactManifest::new(&manifest_path, session_id),
        };
        let record = Arc::new(SessionRecord {
            journal: SessionJournal::new(dir.join(JOURNAL_FILE_NAME), session_id),
            dir,
            manifest: tokio::sync::Mutex::new(manifest),
        });
        let mut sessions = self.lock_sessions();
        Ok(sessions
            .entry(session_id.to_string())
            .or_insert(record)
            .clone())
    }

    fn forget(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        self.lock_sessions().remove(session_id)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionRecord>>> {
        // A panic while holding the map lock leaves the map itself intact.
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Only canonical hyphenated UUIDs name sessions, so an id can never
/// address anything outside the temp root.
pub fn is_session_id(raw: &str) -> bool {
    Uuid::parse_str(raw)
        .map(|parsed| parsed.hyphenated().to_string() == raw)
        .unwrap_or(false)
}

pub fn sanitize_file_name(raw: &str) -> String {
    let base = Path::new(raw.trim())
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        return "artifact.png".to_string();
    }
    cleaned
}

async fn unique_file_name(dir: &Path, candidate: &str) -> String {
    if tokio::fs::metadata(dir.join(candidate)).await.is_err() {
        return candidate.to_string();
    }
    let (stem, ext) = match candidate.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), format!(".{ext}")),
        None => (candidate.to_string(), String::new()),
    };
    let mut counter = 1;
    loop {
        let name = format!("{stem}-{counter}{ext}");
        if tokio::fs::metadata(dir.join(&name)).await.is_err() {
            return name;
        }
        counter += 1;
    }
}

async fn save_manifest(manifest: &ArtifactManifest) -> Result<(), ForgeError> {
    let body = manifest
        .to_pretty_json()
        .map_err(|err| ForgeError::MalformedContent(format!("manifest: {err}")))?;
    tokio::fs::write(&manifest.path, body)
        .await
        .map_err(|err| ForgeError::io(format!("write {}", manifest.path.display()), err))
}

fn missing_or_io(err: io::Error, session_id: &str, dir: &Path) -> ForgeError {
    if err.kind() == io::ErrorKind::NotFound {
        ForgeError::NotFound(format!("session '{session_id}'"))
    } else {
        ForgeError::io(format!("access {}", dir.display()), err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    use panelforge_contracts::artifacts::{ArtifactSlot, MANIFEST_FILE_NAME};
    use panelforge_contracts::batch::BatchReport;

    use super::{is_session_id, sanitize_file_name, SessionStore};
    use crate::error::ForgeError;

    #[test]
    fn session_ids_must_be_canonical_uuids() {
        assert!(is_session_id("6f1c1f0e-8f43-4c39-9d7a-0b9d3f0f6e21"));
        assert!(!is_session_id("6F1C1F0E-8F43-4C39-9D7A-0B9D3F0F6E21"));
        assert!(!is_session_id("6f1c1f0e8f434c399d7a0b9d3f0f6e21"));
        assert!(!is_session_id("../etc"));
        assert!(!is_session_id(""));
    }

    #[test]
    fn file_names_are_reduced_to_one_safe_component() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("001-panel 1.png"), "001-panel_1.png");
        assert_eq!(sanitize_file_name(".hidden.png"), "hidden.png");
        assert_eq!(sanitize_file_name(""), "artifact.png");
    }

    #[tokio::test]
    async fn artifacts_are_listed_in_name_order_with_metadata() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = SessionStore::open(root.path()).await?;
        let session_id = store.create_session().await?;

        store
            .write_artifact(&session_id, b"b", "002-panel-1.png", ArtifactSlot::Panel(2), "second")
            .await?;
        store
            .write_artifact(&session_id, b"c", "000-cover-1.png", ArtifactSlot::Cover, "cover")
            .await?;
        store
            .write_artifact(&session_id, b"a", "001-panel-1.jpg", ArtifactSlot::Panel(1), "first")
            .await?;
        std::fs::write(root.path().join(&session_id).join("notes.txt"), b"x")?;

        let listed = store.list_artifacts(&session_id).await?;
        let names: Vec<&str> = listed.iter().map(|row| row.file_name.as_str()).collect();
        assert_eq!(names, vec!["000-cover-1.png", "001-panel-1.jpg", "002-panel-1.png"]);
        assert_eq!(listed[0].slot, ArtifactSlot::Cover);
        assert_eq!(listed[2].description, "second");
        assert!(root.path().join(&session_id).join(MANIFEST_FILE_NAME).exists());
        assert_eq!(store.read_artifact(&session_id, "001-panel-1.jpg").await?, b"a");
        Ok(())
    }

    #[tokio::test]
    async fn written_artifacts_are_never_overwritten() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = SessionStore::open(root.path()).await?;
        let session_id = store.create_session().await?;

        let first = store
            .write_artifact(&session_id, b"one", "image.png", ArtifactSlot::Single, "")
            .await?;
        let second = store
            .write_artifact(&session_id, b"two", "image.png", ArtifactSlot::Single, "")
            .await?;
        assert_eq!(first.file_name, "image.png");
        assert_eq!(second.file_name, "image-1.png");
        assert_eq!(store.read_artifact(&session_id, "image.png").await?, b"one");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_malformed_sessions_are_not_found() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = SessionStore::open(root.path()).await?;

        let unseen = "6f1c1f0e-8f43-4c39-9d7a-0b9d3f0f6e21";
        assert!(matches!(store.list_artifacts(unseen).await, Err(ForgeError::NotFound(_))));
        assert!(matches!(store.list_artifacts("../x").await, Err(ForgeError::NotFound(_))));
        assert!(matches!(store.remove_session(unseen).await, Err(ForgeError::NotFound(_))));
        assert!(matches!(store.open_session("nope").await, Err(ForgeError::NotFound(_))));

        let session_id = store.create_session().await?;
        assert!(matches!(
            store.read_artifact(&session_id, "../manifest.json").await,
            Err(ForgeError::NotFound(_))
        ));
        assert!(matches!(
            store.read_artifact(&session_id, "missing.png").await,
            Err(ForgeError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn client_supplied_ids_are_adopted_across_restarts() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let session_id = "0b3d3c52-5f1e-4d8e-8a63-0f0e2b0d9c11";
        {
            let store = SessionStore::open(root.path()).await?;
            store.open_session(session_id).await?;
            store
                .write_artifact(session_id, b"x", "000-cover.png", ArtifactSlot::Cover, "cover")
                .await?;
        }
        let restarted = SessionStore::open(root.path()).await?;
        let listed = restarted.list_artifacts(session_id).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].slot, ArtifactSlot::Cover);
        Ok(())
    }

    #[tokio::test]
    async fn remove_and_report() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = SessionStore::open(root.path()).await?;
        let session_id = store.create_session().await?;

        let report = BatchReport::new(&session_id, "a", "b", Vec::new());
        let path = store.write_report(&session_id, &report).await?;
        assert!(path.exists());

        store.remove_session(&session_id).await?;
        assert!(!root.path().join(&session_id).exists());
        assert!(matches!(
            store.list_artifacts(&session_id).await,
            Err(ForgeError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn purge_removes_only_expired_sessions() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(SessionStore::open(root.path()).await?);
        let old = store.create_session().await?;
        let fresh = store.create_session().await?;
        std::fs::File::open(root.path().join(&old))?
            .set_modified(SystemTime::now() - Duration::from_secs(48 * 3600))?;

        let report = store.purge_expired(Duration::from_secs(24 * 3600)).await?;
        assert_eq!(report.removed, vec![old.clone()]);
        assert!(matches!(store.list_artifacts(&old).await, Err(ForgeError::NotFound(_))));
        assert!(store.list_artifacts(&fresh).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn reaper_sweeps_immediately_on_start() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let store = Arc::new(SessionStore::open(root.path()).await?);
        let old = store.create_session().await?;
        std::fs::File::open(root.path().join(&old))?
            .set_modified(SystemTime::now() - Duration::from_secs(3 * 3600))?;

        let handle = super::spawn_reaper(
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        let mut removed = false;
        for _ in 0..100 {
            if !root.path().join(&old).exists() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(removed);
        Ok(())
    }
}
