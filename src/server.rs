//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload` | Multipart PDF upload; starts background indexing |
//! | `POST` | `/chat` | Ask a question in a session's conversation |
//! | `GET`  | `/sessions/{id}` | Indexing status of a session |
//! | `GET`  | `/health` | Liveness check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Session not found or still processing" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `forbidden` (403),
//! `not_found` (404), `processing` (404), `indexing_failed` (422),
//! `internal` (500), `queue_full` (503).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser front end
//! can be served from anywhere.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{require_role, AccessGuard, AuthError};
use crate::chain::Binder;
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::indexer::Indexer;
use crate::llm::{create_chat_model, ChatModel};
use crate::models::SourceRef;
use crate::queue::{IndexJob, IndexQueue, QueueError};
use crate::session::{SessionEntry, SessionState, SessionStatus, SessionStore};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    sessions: Arc<SessionStore>,
    binder: Arc<Binder>,
    queue: IndexQueue,
    guard: Option<Arc<AccessGuard>>,
}

impl AppState {
    /// Wire providers, the session store, and the indexing worker pool.
    ///
    /// Must be called inside a tokio runtime (workers are spawned here).
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn ChatModel>,
        guard: Option<Arc<AccessGuard>>,
    ) -> Self {
        let config = Arc::new(config.clone());
        let sessions = Arc::new(SessionStore::new());
        let binder = Arc::new(Binder::new(&config, embedder.clone(), llm));
        let indexer = Arc::new(Indexer::new(&config, embedder));
        let (queue, _workers) = IndexQueue::start(
            config.indexing.workers,
            config.indexing.queue_capacity,
            indexer,
            binder.clone(),
            sessions.clone(),
        );

        Self {
            config,
            sessions,
            binder,
            queue,
            guard,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }
}

/// Starts the HTTP server with providers built from `config`.
///
/// Fails before binding if an OpenAI-backed provider is configured without
/// `OPENAI_API_KEY`, or if the auth section is inconsistent.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    crate::config::require_api_key(config)?;
    let embedder = create_embedder(&config.embedding)?;
    let llm = create_chat_model(&config.llm)?;
    let guard = AccessGuard::from_config(&config.auth)?.map(Arc::new);
    if guard.as_ref().is_some_and(|g| !g.enforce()) {
        tracing::warn!("auth provider configured but auth.enforce = false; routes are open");
    }

    let state = AppState::new(config, embedder, llm, guard);
    run_server_with_state(state).await
}

/// Starts the HTTP server over pre-built state.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server_with_state(state: AppState) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&state.config.storage.uploads_dir).await?;
    tokio::fs::create_dir_all(&state.config.storage.vectorstores_dir).await?;

    let bind_addr = state.config.server.bind.clone();
    let app = router(state);

    tracing::info!("listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router. Auth layers are attached only when the guard enforces.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut upload = Router::new().route("/upload", post(handle_upload));
    let mut sessions = Router::new()
        .route("/chat", post(handle_chat))
        .route("/sessions/{id}", get(handle_session_status));

    if state.guard.as_ref().is_some_and(|g| g.enforce()) {
        upload = upload.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_uploader,
        ));
        sessions = sessions.route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_user,
        ));
    }

    Router::new()
        .merge(upload)
        .merge(sessions)
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(state.config.server.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated(_) => {
                AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", err.to_string())
            }
            AuthError::Forbidden(_) => {
                AppError::new(StatusCode::FORBIDDEN, "forbidden", err.to_string())
            }
        }
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

/// Constructs a 404 for an unknown session.
fn session_not_found() -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "not_found",
        "Session not found or still processing",
    )
}

/// Constructs a 500 error carrying the underlying cause.
fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

// ============ Auth middleware ============

fn authorization_header(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

async fn require_user(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(guard) = state.guard.as_ref() else {
        return Ok(next.run(req).await);
    };
    let claims = guard.authenticate(authorization_header(&req)).await?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

async fn require_uploader(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(guard) = state.guard.as_ref() else {
        return Ok(next.run(req).await);
    };
    let claims = guard.authenticate(authorization_header(&req)).await?;
    require_role(&claims, guard.upload_role())?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Handler for `GET /health`. Independent of every other piece of state.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /upload ============

#[derive(Serialize)]
struct UploadResponse {
    session_id: String,
    message: String,
}

/// Reduce a client-supplied filename to its last path component.
fn sanitize_filename(raw: &str) -> String {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match name {
        "" | "." | ".." => "upload.pdf".to_string(),
        other => other.to_string(),
    }
}

/// Handler for `POST /upload`.
///
/// Stores the `file` field under the uploads directory, registers the session
/// as processing and queues indexing. Returns without waiting for indexing;
/// a full indexing queue is answered with 503 instead of waiting for room.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = sanitize_filename(field.file_name().unwrap_or("upload.pdf"));
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read file field: {}", e)))?;
        upload = Some((filename, bytes));
        break;
    }
    let (filename, bytes) = upload.ok_or_else(|| bad_request("missing multipart field 'file'"))?;

    // Claim queue capacity first so a rejected upload leaves nothing behind.
    let slot = state.queue.try_reserve().map_err(|e| match e {
        QueueError::Full => {
            AppError::new(StatusCode::SERVICE_UNAVAILABLE, "queue_full", e.to_string())
        }
        QueueError::Closed => internal(e.to_string()),
    })?;

    let session_id = Uuid::new_v4().to_string();
    let storage = &state.config.storage;
    let path = storage.upload_path(&session_id, &filename);
    let index_dir = storage.index_dir(&session_id);

    tokio::fs::create_dir_all(&storage.uploads_dir)
        .await
        .map_err(|e| internal(e.to_string()))?;
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| internal(format!("failed to store upload: {}", e)))?;

    state.sessions.put(
        &session_id,
        SessionEntry::processing(filename.clone(), path.clone(), index_dir.clone()),
    );
    slot.submit(IndexJob {
        session_id: session_id.clone(),
        path,
        index_dir,
    });

    tracing::info!(session_id = %session_id, filename = %filename, bytes = bytes.len(), "upload accepted");

    Ok(Json(UploadResponse {
        session_id,
        message: "File uploaded. Processing started.".to_string(),
    }))
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    session_id: String,
    message: String,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
    sources: Vec<SourceRef>,
}

/// Resolve a session to its current state, rehydrating from disk when the
/// store has no entry. `None` means unknown.
async fn resolve_session(
    state: &AppState,
    session_id: &str,
) -> Result<Option<SessionState>, AppError> {
    if let Some(entry) = state.sessions.get(session_id) {
        return Ok(Some(entry.state));
    }
    // Only well-formed ids are looked up on disk.
    if Uuid::parse_str(session_id).is_err() {
        return Ok(None);
    }
    let chain = state
        .binder
        .rehydrate(session_id)
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(chain.map(|chain| {
        let entry = SessionEntry::rehydrated(
            state.config.storage.index_dir(session_id),
            Arc::new(chain),
        );
        state.sessions.insert_if_absent(session_id, entry).state
    }))
}

/// Handler for `POST /chat`.
async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(req) = payload.map_err(|e| bad_request(e.body_text()))?;
    let chain = match resolve_session(&state, &req.session_id).await? {
        Some(SessionState::Ready(chain)) => chain,
        Some(SessionState::Processing) => {
            return Err(AppError::new(
                StatusCode::NOT_FOUND,
                "processing",
                "Session not found or still processing",
            ))
        }
        Some(SessionState::Failed(cause)) => {
            return Err(AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "indexing_failed",
                format!("Document processing failed: {}", cause),
            ))
        }
        None => return Err(session_not_found()),
    };

    let result = chain.ask(&req.message).await.map_err(|e| {
        tracing::error!(session_id = %req.session_id, error = %e, "chat turn failed");
        internal(format!("Error processing chat: {}", e))
    })?;

    let preview_chars = state.config.retrieval.preview_chars;
    let sources = result
        .sources
        .iter()
        .map(|s| SourceRef::from_chunk(&s.chunk, preview_chars))
        .collect();

    Ok(Json(ChatResponse {
        answer: result.answer,
        sources,
    }))
}

// ============ GET /sessions/{id} ============

#[derive(Serialize)]
struct SessionStatusResponse {
    session_id: String,
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Handler for `GET /sessions/{id}`. Lets clients poll for indexing completion.
async fn handle_session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatusResponse>, AppError> {
    let state_now = resolve_session(&state, &id)
        .await?
        .ok_or_else(session_not_found)?;
    let filename = state.sessions.get(&id).and_then(|e| e.filename);
    let error = match &state_now {
        SessionState::Failed(cause) => Some(cause.to_string()),
        _ => None,
    };

    Ok(Json(SessionStatusResponse {
        session_id: id,
        status: state_now.status(),
        filename,
        error,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_reduced_to_last_component() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\a.pdf"), "a.pdf");
        assert_eq!(sanitize_filename(".."), "upload.pdf");
        assert_eq!(sanitize_filename(""), "upload.pdf");
    }

    #[test]
    fn auth_errors_map_to_status() {
        let e: AppError = AuthError::Unauthenticated("x".into()).into();
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);
        let e: AppError = AuthError::Forbidden("teacher".into()).into();
        assert_eq!(e.status, StatusCode::FORBIDDEN);
        assert_eq!(e.code, "forbidden");
    }
}
