use std::io;

use panelforge_contracts::naming::{compact_timestamp, sanitize_title};
use tracing::info;

use crate::error::ForgeError;
use crate::sessions::SessionStore;

mod archive;
mod document;

pub use archive::build_archive;
pub use document::{build_document, PAGE_DPI};

#[derive(Debug, Clone)]
pub struct PackagedFile {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

pub async fn package_archive(store: &SessionStore, session_id: &str) -> Result<PackagedFile, ForgeError> {
    let images = session_images(store, session_id).await?;
    let count = images.len();
    let bytes = blocking(move || build_archive(&images)).await?;
    let prefix: String = session_id.chars().take(8).collect();
    let file_name = format!("comic_{prefix}_{}.zip", compact_timestamp());
    info!(session_id, images = count, bytes = bytes.len(), "archive packaged");
    Ok(PackagedFile {
        file_name,
        content_type: "application/zip",
        bytes,
    })
}

pub async fn package_document(
    store: &SessionStore,
    session_id: &str,
    title: Option<&str>,
) -> Result<PackagedFile, ForgeError> {
    let images = session_images(store, session_id).await?;
    let count = images.len();
    let bytes = blocking(move || build_document(&images)).await?;
    let file_name = format!("{}.pdf", sanitize_title(title.unwrap_or_default(), "comic"));
    info!(session_id, images = count, bytes = bytes.len(), "document packaged");
    Ok(PackagedFile {
        file_name,
        content_type: "application/pdf",
        bytes,
    })
}

// Listing order: cover first, then panels.
async fn session_images(
    store: &SessionStore,
    session_id: &str,
) -> Result<Vec<(String, Vec<u8>)>, ForgeError> {
    let artifacts = store.list_artifacts(session_id).await?;
    if artifacts.is_empty() {
        return Err(ForgeError::NotFound(format!(
            "no images in session '{session_id}'"
        )));
    }
    let mut images = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let bytes = store.read_artifact(session_id, &artifact.file_name).await?;
        images.push((artifact.file_name, bytes));
    }
    Ok(images)
}

async fn blocking<T, F>(work: F) -> Result<T, ForgeError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ForgeError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ForgeError::io("packaging task", io::Error::other(err.to_string())))?
}
