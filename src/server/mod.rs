use crate::config::Config;
use crate::streaming::{start_reaper, EncoderSelector, EngineTools, SessionManager, WaitPolicy};
use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod routes_stream;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Streaming engine + preview extraction
        .nest("/api/stream", routes_stream::stream_router())
        .route("/api/preview", get(routes_stream::preview))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Build the session manager and its collaborators from config.
pub fn build_manager(config: &Config) -> Arc<SessionManager> {
    let tools = EngineTools {
        ffmpeg: lanreel_av::get_tool_path("ffmpeg", config.streaming.ffmpeg.as_deref()).ok(),
        ffprobe: lanreel_av::get_tool_path("ffprobe", config.streaming.ffprobe.as_deref()).ok(),
    };
    if tools.ffmpeg.is_none() {
        tracing::warn!("ffmpeg not found; non-native containers cannot be streamed");
    }

    let encoder = Arc::new(EncoderSelector::new(tools.ffmpeg.clone()));
    let policy = WaitPolicy {
        lookahead_segments: config.streaming.lookahead_segments,
        segment_wait: Duration::from_secs(config.streaming.segment_wait_secs),
        ..WaitPolicy::default()
    };

    Arc::new(SessionManager::new(
        tools,
        encoder,
        policy,
        Duration::from_secs(config.streaming.idle_timeout_secs),
    ))
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let media_root = config.media.root_path();
    if !media_root.is_dir() {
        tracing::warn!(root = %media_root.display(), "media root does not exist");
    }

    let manager = build_manager(&config);
    start_reaper(
        Arc::clone(&manager),
        Duration::from_secs(config.streaming.reap_interval_secs),
    );

    let ctx = AppContext {
        config: Arc::new(config),
        manager,
    };
    let app = create_router(ctx);

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
