use std::path::PathBuf;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Ways a download can fail. `Display` is the exact message surfaced to the
/// caller, so variants carry everything the caller is allowed to see.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Could not download. The video may be private or requires a login to view.")]
    AccessDenied,
    #[error("yt-dlp failed. Please check the URL and try again.")]
    ToolFailure,
    #[error("yt-dlp reported success, but output file is missing: {}", .path.display())]
    OutputMissing { path: PathBuf },
    #[error("yt-dlp did not finish within {seconds} seconds. Please try again later.")]
    TimedOut { seconds: u64 },
    #[error("An unexpected server error occurred: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        Self::internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
        });
        (self.status, body).into_response()
    }
}
