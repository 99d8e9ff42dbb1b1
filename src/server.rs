use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path as RoutePath, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::ApiError;
use crate::resolver::ShareLinkResolver;
use crate::ytdlp::Downloader;

/// Job directories older than this are removed by the startup sweep.
pub const STALE_JOB_AGE: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone)]
pub struct AppState {
    resolver: Arc<ShareLinkResolver>,
    downloader: Arc<Downloader>,
    download_dir: PathBuf,
}

impl AppState {
    pub async fn new(config: &Config) -> Result<Self, ApiError> {
        tokio::fs::create_dir_all(&config.download_dir)
            .await
            .map_err(|error| {
                ApiError::internal(format!("could not create download directory: {error}"))
            })?;
        // Canonical so containment checks on predicted paths are exact.
        let download_dir = tokio::fs::canonicalize(&config.download_dir)
            .await
            .map_err(|error| {
                ApiError::internal(format!("could not resolve download directory: {error}"))
            })?;
        let resolver = ShareLinkResolver::new()
            .map_err(|error| ApiError::internal(format!("could not build HTTP client: {error}")))?;

        Ok(Self {
            resolver: Arc::new(resolver),
            downloader: Arc::new(Downloader::new(config)),
            download_dir,
        })
    }
}

/// Routes for the standalone server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route("/api/download", get(api_download))
        .route("/downloads/{*filename}", get(serve_artifact))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Single-route variant for function hosts that forward every path to one
/// handler. Semantics match `/api/download` exactly.
pub fn fallback_router(state: AppState) -> Router {
    Router::new()
        .fallback_service(get(api_download).with_state(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    url: Option<String>,
}

async fn api_download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Result<Response, ApiError> {
    let Some(video_url) = params
        .url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Err(ApiError::bad_request("URL parameter is missing."));
    };

    let resolved_url = state.resolver.resolve(video_url).await;

    // Fresh directory per request, so concurrent downloads never see each
    // other's files. The guard removes it on every exit path.
    let job_dir = state.download_dir.join(Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&job_dir).await.map_err(|error| {
        ApiError::internal(format!("could not create job directory: {error}"))
    })?;
    let cleanup = JobDirGuard {
        dir: job_dir.clone(),
    };

    let artifact = state.downloader.download(&resolved_url, &job_dir).await?;

    stream_artifact(&artifact, cleanup).await
}

/// Removes the per-request job directory when dropped. The guard travels
/// inside the response body, so the directory lives exactly as long as the
/// response: handler errors, fully sent bodies and client aborts all end in
/// the same place.
#[derive(Debug)]
struct JobDirGuard {
    dir: PathBuf,
}

impl Drop for JobDirGuard {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => info!("Successfully deleted {}", self.dir.display()),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => error!("Error deleting {}: {error}", self.dir.display()),
        }
    }
}

/// File reader that keeps the cleanup guard alive until the response body
/// is dropped.
struct ArtifactReader {
    file: File,
    _cleanup: JobDirGuard,
}

impl AsyncRead for ArtifactReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

async fn stream_artifact(path: &Path, cleanup: JobDirGuard) -> Result<Response, ApiError> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    let file = File::open(path)
        .await
        .map_err(|error| ApiError::internal(format!("could not open downloaded file: {error}")))?;
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("could not read downloaded file metadata: {error}"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("could not build download headers"))?,
    );

    let stream = ReaderStream::new(ArtifactReader {
        file,
        _cleanup: cleanup,
    });
    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Directly serves files still sitting under the download directory. No
/// cleanup is attached here.
async fn serve_artifact(
    State(state): State<AppState>,
    RoutePath(filename): RoutePath<String>,
) -> Result<Response, ApiError> {
    ensure_safe_filename(&filename)?;
    let path = state.download_dir.join(&filename);

    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    Ok(response)
}

/// Rejects anything that could escape the download directory: absolute
/// paths, `..` segments, drive prefixes. Wildcard captures arrive already
/// percent-decoded.
fn ensure_safe_filename(name: &str) -> Result<(), ApiError> {
    let safe = !name.is_empty()
        && Path::new(name)
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(())
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" | "opus" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// RFC 5987 pair: a plain-ASCII fallback filename plus the UTF-8 original.
fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());
    for character in value.chars() {
        if character.is_ascii_alphanumeric()
            || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
        {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

/// Removes leftover job directories from earlier runs. Guards handle the
/// normal path; this catches whatever a crash or kill left behind. A zero
/// age disables the sweep.
pub async fn sweep_stale_jobs(download_dir: &Path, older_than: Duration) {
    if older_than.is_zero() {
        return;
    }

    let mut entries = match tokio::fs::read_dir(download_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open download directory for sweeping: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate download directory: {error}");
                break;
            }
        };

        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => info!("Swept stale download job {}", path.display()),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not sweep {}: {error}", path.display()),
        }
    }
}
