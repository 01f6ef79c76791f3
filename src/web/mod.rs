// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! HTTP surface: upload, query, stats, reconcile and the move log

use axum::{
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::history::MoveEntry;
use crate::reconcile::ReconcileOutcome;
use crate::search::SearchHit;
use crate::service::{ArchiveService, ServiceStats};
use crate::{ArchivistError, Result};

const OLLAMA_STATUS_TTL: Duration = Duration::from_secs(30);
const UPLOAD_LIMIT_BYTES: usize = 512 * 1024 * 1024;
const MAX_RESULTS: usize = 50;

/// Shared application state
pub struct AppState {
    pub service: Arc<ArchiveService>,
    ollama: Mutex<Option<(Instant, bool)>>,
}

impl AppState {
    pub fn new(service: Arc<ArchiveService>) -> Self {
        Self {
            service,
            ollama: Mutex::new(None),
        }
    }

    /// Ollama reachability, checked at most every 30 seconds
    async fn ollama_available(&self) -> bool {
        if let Ok(cache) = self.ollama.lock() {
            if let Some((checked, available)) = *cache {
                if checked.elapsed() < OLLAMA_STATUS_TTL {
                    return available;
                }
            }
        }
        let available = self.service.ollama_available().await;
        if let Ok(mut cache) = self.ollama.lock() {
            *cache = Some((Instant::now(), available));
        }
        available
    }
}

/// JSON error body: `{ "ok": false, "error": { "code", "message" } }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorResponse,
}

#[derive(Debug, Serialize)]
struct ApiErrorResponse {
    ok: bool,
    error: ApiErrorBody,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorResponse {
                ok: false,
                error: ApiErrorBody {
                    code,
                    message: message.into(),
                },
            },
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<ArchivistError> for ApiError {
    fn from(err: ArchivistError) -> Self {
        match err {
            ArchivistError::Placement(msg) => Self::bad_request(msg),
            ArchivistError::UnsupportedFileType(msg) => Self::bad_request(msg),
            ArchivistError::OllamaUnavailable(msg) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg)
            }
            ArchivistError::Timeout(secs) => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                format!("Timed out after {}s", secs),
            ),
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", other.to_string()),
        }
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Create the web application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/query", get(query))
        .route("/stats", get(stats))
        .route("/reconcile", post(reconcile))
        .route("/moves", get(moves))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === API Handlers ===

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    archive_dir_exists: bool,
    input_dir_exists: bool,
    watching: bool,
    ollama: &'static str,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let config = state.service.config();
    let ollama = if state.ollama_available().await {
        "available"
    } else {
        "unavailable"
    };
    Json(HealthResponse {
        status: "ok",
        archive_dir_exists: config.archive_dir.is_dir(),
        input_dir_exists: config.input_dir.is_dir(),
        watching: state.service.is_running(),
        ollama,
    })
}

#[derive(Serialize)]
struct UploadResponse {
    status: &'static str,
    path: String,
    absolute_path: String,
    folder: String,
    reason: crate::placement::PlacementReason,
    summary: String,
}

async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<UploadResponse> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {}", e)))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {}", e)))?;

        let outcome = state.service.ingest_upload(&filename, &bytes).await?;
        let absolute = state.service.archive().absolute(&outcome.relative_path);
        return Ok(Json(UploadResponse {
            status: "success",
            absolute_path: absolute.to_string_lossy().to_string(),
            path: outcome.relative_path,
            folder: outcome.folder,
            reason: outcome.reason,
            summary: outcome.summary,
        }));
    }
    Err(ApiError::bad_request("No file field in upload"))
}

#[derive(Deserialize)]
struct SearchQuery {
    query_text: String,
    n_results: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    /// Absolute paths, best first
    results: Vec<String>,
    hits: Vec<SearchHit>,
}

async fn query(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchQuery>,
) -> ApiResult<SearchResponse> {
    let limit = params.n_results.unwrap_or(5).clamp(1, MAX_RESULTS);
    let hits = state.service.search(&params.query_text, limit).await?;
    Ok(Json(SearchResponse {
        query: params.query_text,
        results: hits
            .iter()
            .map(|h| h.absolute_path.to_string_lossy().to_string())
            .collect(),
        hits,
    }))
}

async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<ServiceStats> {
    Ok(Json(state.service.stats().await?))
}

async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult<ReconcileOutcome> {
    Ok(Json(state.service.reconcile().await?))
}

#[derive(Deserialize)]
struct MovesQuery {
    hours: Option<i64>,
    limit: Option<usize>,
}

async fn moves(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MovesQuery>,
) -> ApiResult<Vec<MoveEntry>> {
    let entries = state
        .service
        .moves(params.hours.unwrap_or(24), params.limit.unwrap_or(100))?;
    Ok(Json(entries))
}

// === Page Handlers ===

async fn index_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let stats = state.service.stats().await.ok();
    let recent = state.service.moves(24, 20).unwrap_or_default();
    Html(render_index(stats.as_ref(), &recent))
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_index(stats: Option<&ServiceStats>, moves: &[MoveEntry]) -> String {
    let (files, dirs, indexed) = stats
        .map(|s| (s.archive.files, s.archive.directories, s.indexed))
        .unwrap_or_default();

    let rows: String = moves
        .iter()
        .map(|m| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                m.created_at.format("%Y-%m-%d %H:%M"),
                escape(&m.source_path),
                escape(m.destination_path.as_deref().unwrap_or("-")),
                m.status.as_str(),
            )
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Archivist</title>
    <style>
        body {{ font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; background: #1a1a2e; color: #e8e8e8; }}
        .container {{ max-width: 1100px; margin: 0 auto; padding: 20px; }}
        .stat {{ display: inline-block; background: #0f3460; border-radius: 12px; padding: 16px 24px; margin-right: 16px; }}
        .stat .number {{ font-size: 2em; font-weight: bold; color: #e94560; }}
        table {{ width: 100%; border-collapse: collapse; margin-top: 24px; }}
        th, td {{ padding: 8px; text-align: left; border-bottom: 1px solid #2a2a4a; }}
    </style>
</head>
<body>
    <main class="container">
        <h1>Archivist</h1>
        <div class="stat"><div class="number">{}</div>Files</div>
        <div class="stat"><div class="number">{}</div>Folders</div>
        <div class="stat"><div class="number">{}</div>Indexed</div>
        <table>
            <tr><th>When</th><th>Source</th><th>Destination</th><th>Status</th></tr>
            {}
        </table>
    </main>
</body>
</html>"#,
        files, dirs, indexed, rows
    )
}

/// Serve the API until `shutdown` resolves
pub async fn start_server<F>(service: Arc<ArchiveService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let config = service.config().web.clone();
    let state = Arc::new(AppState::new(service));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP API listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            warn!(error = %e, "HTTP server stopped with an error");
            ArchivistError::Config(format!("Server error: {}", e))
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::history::MoveLog;
    use crate::index::{HashEmbedder, SqliteIndex};
    use crate::ollama::OllamaClient;
    use crate::summarizer::{PathRequest, Summarizer};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Notes;

    #[async_trait]
    impl Summarizer for Notes {
        async fn summarize(&self, _filename: &str, text: &str) -> Result<String> {
            Ok(text.to_string())
        }
        async fn summarize_image(&self, filename: &str, _bytes: &[u8]) -> Result<String> {
            Ok(filename.to_string())
        }
        async fn suggest_path(&self, _request: &PathRequest<'_>) -> Result<String> {
            Ok("<suggestedpath>Notes</suggestedpath>".to_string())
        }
    }

    fn app(dir: &TempDir) -> (Router, Arc<ArchiveService>) {
        let mut config = AppConfig::default();
        config.archive_dir = dir.path().join("archive");
        config.input_dir = dir.path().join("input");
        config.ensure_dirs().unwrap();

        let index = Arc::new(SqliteIndex::in_memory(Arc::new(HashEmbedder::default())).unwrap());
        let client = OllamaClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let service = Arc::new(ArchiveService::with_parts(
            config,
            client,
            index,
            Arc::new(Notes),
            MoveLog::in_memory().unwrap(),
        ));
        (create_router(Arc::new(AppState::new(Arc::clone(&service)))), service)
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart(filename: &str, content: &str) -> Request<Body> {
        let boundary = "archivist-test-boundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: text/plain\r\n\r\n{c}\r\n--{b}--\r\n",
            b = boundary,
            f = filename,
            c = content
        );
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_then_query_returns_absolute_path() {
        let dir = TempDir::new().unwrap();
        let (router, service) = app(&dir);

        let response = router
            .clone()
            .oneshot(multipart("groceries.txt", "milk eggs bread"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["path"], "Notes/groceries.txt");

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/query?query_text=groceries&n_results=3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json(response).await;
        let expected = service.archive().absolute("Notes/groceries.txt");
        assert_eq!(body["results"][0], expected.to_string_lossy().as_ref());
    }

    #[tokio::test]
    async fn upload_without_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (router, _service) = app(&dir);
        let body = "--b\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--b--\r\n";
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header("content-type", "multipart/form-data; boundary=b")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["ok"], false);
    }

    #[tokio::test]
    async fn reconcile_and_stats_report_counts() {
        let dir = TempDir::new().unwrap();
        let (router, _service) = app(&dir);
        std::fs::create_dir_all(dir.path().join("archive/Docs")).unwrap();
        std::fs::write(dir.path().join("archive/Docs/a.txt"), "alpha").unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/reconcile")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["added"], 1);

        let response = router
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json(response).await;
        assert_eq!(body["indexed"], 1);
        assert_eq!(body["archive"]["files"], 1);
    }
}
