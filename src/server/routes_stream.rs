//! Streaming and preview HTTP handlers.
//!
//! The playlist is served with a short cache window (it is immutable per
//! session, but sessions come and go); segments are immutable forever and
//! marked as such.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::library::resolve_media_path;
use crate::preview::extract_preview_from_file;
use crate::server::AppContext;
use crate::streaming::manifest::parse_segment_name;
use crate::streaming::{QualityTier, SegmentFetch, TranscodeSession};

/// Non-standard but conventional status for "client went away mid-wait";
/// kept distinct from 404 so timeouts stay unambiguous.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Streaming engine router, nested under `/api/stream`.
pub fn stream_router() -> Router<AppContext> {
    Router::new()
        .route("/start", get(start_stream))
        .route("/:session_id/status", get(session_status))
        .route("/:session_id/playlist.m3u8", get(playlist))
        .route("/:session_id/:segment", get(segment))
        .route("/:session_id", delete(stop_stream))
}

#[derive(Debug, Deserialize)]
pub struct StartParams {
    /// Path relative to the media root.
    pub path: String,
    /// Quality tier name; anything unrecognized means auto.
    pub quality: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub session: String,
    pub ready: bool,
    pub complete: bool,
    pub error: Option<String>,
    pub duration_secs: Option<f64>,
    pub segments_cached: usize,
    pub started_at: DateTime<Utc>,
}

impl SessionStatus {
    fn from_session(session: &TranscodeSession) -> Self {
        Self {
            session: session.id(),
            ready: session.is_ready(),
            complete: session.is_complete(),
            error: session.error(),
            duration_secs: session.duration_secs(),
            segments_cached: session.segments_cached(),
            started_at: session.started_at(),
        }
    }
}

/// Start (or resume) a transcode for a media file.
pub async fn start_stream(
    State(ctx): State<AppContext>,
    Query(params): Query<StartParams>,
) -> Result<Json<SessionStatus>, StatusCode> {
    let tier = params
        .quality
        .as_deref()
        .map(QualityTier::parse)
        .unwrap_or(QualityTier::Auto);

    let root = ctx.config.media.root_path();
    let source = resolve_media_path(&root, &params.path).ok_or(StatusCode::NOT_FOUND)?;

    let session = ctx
        .manager
        .get_or_start(&params.path, source, tier)
        .await
        .map_err(|e| {
            tracing::error!(path = %params.path, error = %e, "failed to start session");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(SessionStatus::from_session(&session)))
}

/// Poll a session's status.
pub async fn session_status(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, StatusCode> {
    let session = ctx
        .manager
        .get(&session_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(SessionStatus::from_session(&session)))
}

/// Serve the session's playlist.
pub async fn playlist(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> Result<Response, StatusCode> {
    let session = ctx
        .manager
        .get(&session_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    let manifest = session.manifest().ok_or(StatusCode::NOT_FOUND)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")
        .header(header::CACHE_CONTROL, "max-age=60")
        .body(Body::from(manifest))
        .unwrap())
}

/// Serve one media segment, waiting (bounded) for it to be produced.
pub async fn segment(
    State(ctx): State<AppContext>,
    Path((session_id, segment_name)): Path<(String, String)>,
) -> Result<Response, StatusCode> {
    let index = parse_segment_name(&segment_name).ok_or(StatusCode::BAD_REQUEST)?;
    let session = ctx
        .manager
        .get(&session_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    // Dropping this handler (client disconnect) cancels the wait.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match session.segment(index, &cancel).await {
        SegmentFetch::Data(data) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "video/mp2t")
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CACHE_CONTROL, "max-age=31536000, immutable")
            .body(Body::from(data))
            .unwrap()),
        SegmentFetch::Cancelled => {
            Err(StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST))
        }
        SegmentFetch::Missing => Err(StatusCode::NOT_FOUND),
    }
}

/// Dispose a session immediately.
pub async fn stop_stream(
    State(ctx): State<AppContext>,
    Path(session_id): Path<String>,
) -> StatusCode {
    if ctx.manager.stop(&session_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
pub struct PreviewParams {
    /// Path relative to the media root.
    pub path: String,
}

/// Serve the embedded preview image from a RAW camera container.
pub async fn preview(
    State(ctx): State<AppContext>,
    Query(params): Query<PreviewParams>,
) -> Result<Response, StatusCode> {
    let root = ctx.config.media.root_path();
    let source = resolve_media_path(&root, &params.path).ok_or(StatusCode::NOT_FOUND)?;

    let extension = source.extension().and_then(|e| e.to_str()).unwrap_or("");
    if !ctx.config.media.is_raw_extension(extension) {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Whole-file read plus a byte scan; keep it off the async workers.
    let data = tokio::task::spawn_blocking(move || extract_preview_from_file(&source))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header(header::CONTENT_LENGTH, data.len().to_string())
        .header(header::CACHE_CONTROL, "max-age=3600")
        .body(Body::from(data))
        .unwrap())
}
