use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{info, warn};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10);

/// Upper bound on the payload file; exports are a few KiB.
pub const MAX_PAYLOAD_BYTES: u64 = 1024 * 1024;

#[derive(Debug)]
struct CachedBody {
    body: String,
    loaded_at: Instant,
}

#[derive(Debug)]
struct FeedState {
    payload_path: PathBuf,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedBody>>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<FeedState>,
}

impl AppState {
    #[must_use]
    pub fn new(payload_path: PathBuf, cache_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(FeedState {
                payload_path,
                cache_ttl,
                cache: RwLock::new(None),
            }),
        }
    }

    /// Returns the payload text, re-reading the file once the cached copy is older than the TTL.
    pub async fn payload(&self) -> Result<String, String> {
        let ttl = self.inner.cache_ttl;
        if !ttl.is_zero() {
            let cache = self.inner.cache.read().await;
            if let Some(cached) = cache.as_ref()
                && cached.loaded_at.elapsed() < ttl
            {
                return Ok(cached.body.clone());
            }
        }

        let body = load_payload(&self.inner.payload_path).await?;
        if !ttl.is_zero() {
            let mut cache = self.inner.cache.write().await;
            *cache = Some(CachedBody {
                body: body.clone(),
                loaded_at: Instant::now(),
            });
        }
        Ok(body)
    }
}

async fn load_payload(path: &Path) -> Result<String, String> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|err| format!("failed to stat {}: {err}", path.display()))?;
    if meta.len() > MAX_PAYLOAD_BYTES {
        return Err(format!(
            "payload file too large: {} bytes (max {MAX_PAYLOAD_BYTES})",
            meta.len()
        ));
    }

    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    serde_json::from_str::<serde_json::Value>(&body)
        .map_err(|err| format!("payload is not valid JSON: {err}"))?;
    Ok(body)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/json", get(json_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "feed listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn json_handler(State(state): State<AppState>) -> Response {
    match state.payload().await {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json; charset=utf-8"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!("serving /json failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                format!("Error: {err}"),
            )
                .into_response()
        }
    }
}
