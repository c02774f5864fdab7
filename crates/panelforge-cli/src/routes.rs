use std::convert::Infallible;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use panelforge_contracts::artifacts::{is_image_file_name, ArtifactSlot};
use panelforge_contracts::events::{encode_ndjson, BatchEvent, ScriptEvent};
use panelforge_contracts::naming::attachment_disposition;
use panelforge_engine::error::ForgeError;
use panelforge_engine::packaging::PackagedFile;
use panelforge_engine::{ComicEngine, StoredImage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

const NDJSON: &str = "application/x-ndjson";

pub fn router(engine: ComicEngine) -> Router {
    let temp_dir = engine.config().temp_dir.clone();
    Router::new()
        .route("/generate-image", post(generate_image))
        .route("/generate-batch-item", post(generate_batch_item))
        .route("/generate-batch", post(generate_batch))
        .route("/generate-script-stream", post(generate_script_stream))
        .route("/generate-script", post(generate_script))
        .route("/session-files/:session_id", get(session_files))
        .route("/session/:session_id", delete(remove_session))
        .route("/download-zip/:session_id", get(download_zip))
        .route("/download-pdf/:session_id", get(download_pdf))
        .merge(image_files(temp_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

// Session directories also hold the manifest, reports and in-flight
// `.partial` files; only finished images are published under `/temp`.
fn image_files<S>(temp_dir: PathBuf) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .nest_service("/temp", ServeDir::new(temp_dir))
        .layer(middleware::from_fn(images_only))
}

async fn images_only(request: Request, next: Next) -> Response {
    let published = request
        .uri()
        .path()
        .rsplit('/')
        .next()
        .is_some_and(|name| !name.starts_with('.') && is_image_file_name(name));
    if !published {
        return ApiError(ForgeError::NotFound("file".to_string())).into_response();
    }
    next.run(request).await
}

/// Engine failures rendered as `{error}` with a status per failure kind.
pub struct ApiError(ForgeError);

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ForgeError::NotFound(_) => StatusCode::NOT_FOUND,
            ForgeError::InvalidInput(_)
            | ForgeError::InvalidScene(_)
            | ForgeError::UnrecognizedSchema(_) => StatusCode::BAD_REQUEST,
            ForgeError::ContentRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ForgeError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, "request rejected");
        }
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageRequest {
    #[serde(default)]
    prompt: String,
    size: Option<String>,
    style: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchItemRequest {
    #[serde(default)]
    prompt: String,
    size: Option<String>,
    style: Option<String>,
    session_id: Option<String>,
    #[serde(default, alias = "iscover")]
    is_cover: bool,
    panel_number: Option<u32>,
}

/// The storyboard may come wrapped in `script` or inline next to the
/// options.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    script: Option<Value>,
    size: Option<String>,
    style: Option<String>,
    session_id: Option<String>,
    include_cover: Option<bool>,
    #[serde(flatten)]
    document: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ScriptRequest {
    #[serde(default)]
    story_concept: String,
}

#[derive(Debug, Deserialize)]
struct TitleQuery {
    title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    image_path: String,
    session_id: String,
    file_name: String,
}

impl From<StoredImage> for ImageResponse {
    fn from(stored: StoredImage) -> Self {
        Self {
            image_path: format!("/temp/{}/{}", stored.session_id, stored.artifact.file_name),
            session_id: stored.session_id,
            file_name: stored.artifact.file_name,
        }
    }
}

async fn generate_image(
    State(engine): State<ComicEngine>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<ImageResponse>, ApiError> {
    let stored = engine
        .generate_single(
            &req.prompt,
            req.size.as_deref(),
            req.style.as_deref(),
            None,
            ArtifactSlot::Single,
        )
        .await?;
    Ok(Json(stored.into()))
}

async fn generate_batch_item(
    State(engine): State<ComicEngine>,
    Json(req): Json<BatchItemRequest>,
) -> Result<Json<ImageResponse>, ApiError> {
    // Clients that only send the cover flag still get a stored image.
    let slot = match (req.is_cover, req.panel_number) {
        (true, _) => ArtifactSlot::Cover,
        (false, Some(number)) if number > 0 => ArtifactSlot::Panel(number),
        _ => ArtifactSlot::Single,
    };
    let stored = engine
        .generate_single(
            &req.prompt,
            req.size.as_deref(),
            req.style.as_deref(),
            req.session_id.as_deref(),
            slot,
        )
        .await?;
    Ok(Json(stored.into()))
}

async fn generate_batch(
    State(engine): State<ComicEngine>,
    Json(req): Json<BatchRequest>,
) -> Response {
    let BatchRequest {
        script,
        size,
        style,
        session_id,
        include_cover,
        document,
    } = req;
    let document = script.unwrap_or(Value::Object(document));
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut send = |event: BatchEvent| send_line(&tx, &event);
        let result = engine
            .run_batch(
                &document,
                size.as_deref(),
                style.as_deref(),
                session_id.as_deref(),
                include_cover.unwrap_or(true),
                &mut send,
            )
            .await;
        if let Err(err) = result {
            warn!(error = %err, "batch request failed");
            send(BatchEvent::Error {
                message: err.user_message(),
            });
        }
    });
    ndjson_response(rx)
}

async fn generate_script_stream(
    State(engine): State<ComicEngine>,
    Json(req): Json<ScriptRequest>,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut send = |event: ScriptEvent| send_line(&tx, &event);
        // The terminal record has already been sent when this returns.
        let _ = engine
            .generate_script_streaming(&req.story_concept, &mut send)
            .await;
    });
    ndjson_response(rx)
}

async fn generate_script(
    State(engine): State<ComicEngine>,
    Json(req): Json<ScriptRequest>,
) -> Result<Json<Value>, ApiError> {
    let saved = engine.generate_script(&req.story_concept).await?;
    Ok(Json(json!({
        "script_data": saved.script_data,
        "file_path": saved.file_path,
    })))
}

async fn session_files(
    State(engine): State<ComicEngine>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let files = engine.session_files(&session_id).await?;
    Ok(Json(json!({ "files": files })))
}

async fn remove_session(
    State(engine): State<ComicEngine>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine.remove_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_zip(
    State(engine): State<ComicEngine>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(attachment(engine.archive(&session_id).await?))
}

async fn download_pdf(
    State(engine): State<ComicEngine>,
    Path(session_id): Path<String>,
    Query(query): Query<TitleQuery>,
) -> Result<Response, ApiError> {
    Ok(attachment(
        engine.document(&session_id, query.title.as_deref()).await?,
    ))
}

fn attachment(file: PackagedFile) -> Response {
    (
        [
            (CONTENT_TYPE, file.content_type.to_string()),
            (CONTENT_DISPOSITION, attachment_disposition(&file.file_name)),
        ],
        file.bytes,
    )
        .into_response()
}

fn send_line<T: Serialize>(tx: &mpsc::UnboundedSender<String>, event: &T) {
    match encode_ndjson(event) {
        // A closed receiver means the client went away; the job still finishes.
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(err) => error!(error = %err, "stream record not encodable"),
    }
}

fn ndjson_response(rx: mpsc::UnboundedReceiver<String>) -> Response {
    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>));
    ([(CONTENT_TYPE, NDJSON)], body).into_response()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use panelforge_engine::config::EngineConfig;
    use panelforge_engine::ComicEngine;
    use reqwest::StatusCode;
    use serde_json::{json, Value};

    use super::router;

    async fn start(root: &std::path::Path) -> anyhow::Result<SocketAddr> {
        let engine = ComicEngine::new(EngineConfig::dryrun(root)).await?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(engine)).await;
        });
        Ok(addr)
    }

    fn ndjson(body: &str) -> anyhow::Result<Vec<Value>> {
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    #[tokio::test]
    async fn single_image_lifecycle() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let addr = start(root.path()).await?;
        let client = reqwest::Client::new();
        let base = format!("http://{addr}");

        let created: Value = client
            .post(format!("{base}/generate-image"))
            .json(&json!({"prompt": "a fox on a rooftop", "size": "16:9"}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let session_id = created["sessionId"].as_str().unwrap_or_default().to_string();
        let image_path = created["imagePath"].as_str().unwrap_or_default().to_string();
        assert_eq!(
            image_path,
            format!("/temp/{session_id}/{}", created["fileName"].as_str().unwrap_or_default())
        );

        let image = client.get(format!("{base}{image_path}")).send().await?;
        assert_eq!(image.status(), StatusCode::OK);
        assert!(image.bytes().await?.starts_with(b"\x89PNG"));

        let files: Value = client
            .get(format!("{base}/session-files/{session_id}"))
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(files["files"].as_array().map(Vec::len), Some(1));

        let zip = client.get(format!("{base}/download-zip/{session_id}")).send().await?;
        assert_eq!(zip.status(), StatusCode::OK);
        let disposition = zip
            .headers()
            .get("content-disposition")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(disposition.starts_with("attachment; filename=\"comic_"));

        let pdf = client
            .get(format!("{base}/download-pdf/{session_id}?title=Fox%20Tales"))
            .send()
            .await?;
        assert_eq!(
            pdf.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("application/pdf")
        );
        assert!(pdf.bytes().await?.starts_with(b"%PDF"));

        let removed = client.delete(format!("{base}/session/{session_id}")).send().await?;
        assert_eq!(removed.status(), StatusCode::NO_CONTENT);

        let gone = client.get(format!("{base}/session-files/{session_id}")).send().await?;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
        let body: Value = gone.json().await?;
        assert!(body["error"].as_str().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn temp_serves_images_but_not_session_bookkeeping() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let addr = start(root.path()).await?;
        let client = reqwest::Client::new();
        let base = format!("http://{addr}");

        let created: Value = client
            .post(format!("{base}/generate-image"))
            .json(&json!({"prompt": "a fox on a rooftop"}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let session_id = created["sessionId"].as_str().unwrap_or_default().to_string();
        let session_dir = root.path().join("temp").join(&session_id);
        assert!(session_dir.join("manifest.json").exists());
        std::fs::write(session_dir.join(".draft.png.partial"), b"half")?;
        std::fs::write(session_dir.join(".hidden.png"), b"half")?;

        let image_path = created["imagePath"].as_str().unwrap_or_default();
        let image = client.get(format!("{base}{image_path}")).send().await?;
        assert_eq!(image.status(), StatusCode::OK);
        for name in ["manifest.json", ".draft.png.partial", ".hidden.png", ""] {
            let res = client.get(format!("{base}/temp/{session_id}/{name}")).send().await?;
            assert_eq!(res.status(), StatusCode::NOT_FOUND, "{name}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn batch_items_join_the_given_session() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let addr = start(root.path()).await?;
        let client = reqwest::Client::new();
        let base = format!("http://{addr}");
        let session_id = "0f8e7c2a-4d1b-4c3e-9a5f-6b7c8d9e0f12";

        for body in [
            json!({"prompt": "title page", "sessionId": session_id, "isCover": true}),
            json!({"prompt": "first beat", "sessionId": session_id, "panelNumber": 1}),
        ] {
            let res = client.post(format!("{base}/generate-batch-item")).json(&body).send().await?;
            assert_eq!(res.status(), StatusCode::OK);
        }
        let files: Value = client
            .get(format!("{base}/session-files/{session_id}"))
            .send()
            .await?
            .json()
            .await?;
        let names: Vec<&str> = files["files"]
            .as_array()
            .map(|rows| rows.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("000-cover-"));
        assert!(names[1].starts_with("001-panel-"));

        let unnumbered = client
            .post(format!("{base}/generate-batch-item"))
            .json(&json!({"prompt": "x", "sessionId": session_id, "isCover": false}))
            .send()
            .await?;
        assert_eq!(unnumbered.status(), StatusCode::OK);
        let stored: Value = unnumbered.json().await?;
        assert_eq!(stored["sessionId"], session_id);
        assert!(stored["fileName"].as_str().is_some_and(|name| name.starts_with("image-")));
        Ok(())
    }

    #[tokio::test]
    async fn lowercase_cover_flag_is_accepted() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let addr = start(root.path()).await?;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("http://{addr}/generate-batch-item"))
            .json(&json!({"prompt": "title page", "iscover": true}))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        let stored: Value = res.json().await?;
        assert!(stored["fileName"].as_str().is_some_and(|name| name.starts_with("000-cover-")));
        assert!(stored["sessionId"].as_str().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn batch_streams_progress_then_complete() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let addr = start(root.path()).await?;
        let client = reqwest::Client::new();

        let res = client
            .post(format!("http://{addr}/generate-batch"))
            .json(&json!({
                "panels": [
                    {"panel_number": 1, "frames": [{"visual_description": "hero jumps"}]},
                    {"panel_number": 2, "frames": [{"visual_description": "hero lands", "dialogue": "Made it!"}]}
                ],
                "includeCover": false,
                "style": "comic_webtoon"
            }))
            .send()
            .await?;
        assert_eq!(
            res.headers().get("content-type").and_then(|v| v.to_str().ok()),
            Some("application/x-ndjson")
        );
        let records = ndjson(&res.text().await?)?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["type"], json!("progress"));
        assert_eq!(records[1]["completed"], json!(2));
        assert_eq!(records[2]["type"], json!("complete"));
        assert_eq!(records[2]["report"]["success_count"], json!(2));
        Ok(())
    }

    #[tokio::test]
    async fn unrecognized_batch_ends_with_error_record() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let addr = start(root.path()).await?;
        let res = reqwest::Client::new()
            .post(format!("http://{addr}/generate-batch"))
            .json(&json!({"script": {"chapters": []}}))
            .send()
            .await?;
        let records = ndjson(&res.text().await?)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["type"], json!("error"));
        Ok(())
    }

    #[tokio::test]
    async fn script_endpoints() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let addr = start(root.path()).await?;
        let client = reqwest::Client::new();
        let base = format!("http://{addr}");
        let concept = json!({"story_concept": "A tired knight opens a bakery. The dragon becomes a regular."});

        let streamed = client
            .post(format!("{base}/generate-script-stream"))
            .json(&concept)
            .send()
            .await?;
        let records = ndjson(&streamed.text().await?)?;
        assert_eq!(records.first().map(|r| r["type"].clone()), Some(json!("progress")));
        assert!(records.iter().any(|r| r["type"] == json!("chunk")));
        let last = records.last().cloned().unwrap_or_default();
        assert_eq!(last["type"], json!("complete"));
        assert!(last["script_data"]["storyboard"].is_array());

        let saved: Value = client
            .post(format!("{base}/generate-script"))
            .json(&concept)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert!(saved["file_path"].as_str().is_some_and(|path| path.ends_with(".json")));

        let short = client
            .post(format!("{base}/generate-script"))
            .json(&json!({"story_concept": "too short"}))
            .send()
            .await?;
        assert_eq!(short.status(), StatusCode::BAD_REQUEST);

        let short_stream = client
            .post(format!("{base}/generate-script-stream"))
            .json(&json!({"story_concept": "tiny"}))
            .send()
            .await?;
        let records = ndjson(&short_stream.text().await?)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["type"], json!("error"));
        Ok(())
    }
}
