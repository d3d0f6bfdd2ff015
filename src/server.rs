use crate::config::Settings;
use crate::document::is_pdf;
use crate::error::RagError;
use crate::generation::AnswerStyle;
use crate::rag::{AnswerEvent, AskOptions, ChatAnswer, RagEngine};
use anyhow::Context;
use axum::{
    extract::{multipart::MultipartError, rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, services::ServeDir};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Answer events buffered between the generator and a slow client
const STREAM_BUFFER: usize = 32;

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Gateway settings that are not part of the pipelines
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub upload_dir: PathBuf,
    pub static_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl GatewayOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        GatewayOptions {
            upload_dir: settings.upload_dir.clone(),
            static_dir: settings.static_dir.clone(),
            max_upload_bytes: settings.max_upload_bytes,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    engine: Arc<RagEngine>,
    upload_dir: Arc<PathBuf>,
}

/// Error returned by handlers; the only place errors become status codes
#[derive(Debug)]
pub enum ApiError {
    Pipeline(RagError),
    Multipart(MultipartError),
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Pipeline(RagError::Io(err))
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::Multipart(err)
    }
}

/// Status code for each pipeline error kind
pub fn status_for(err: &RagError) -> StatusCode {
    match err {
        RagError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
        RagError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RagError::Load(_)
        | RagError::Embedding(_)
        | RagError::IndexNotFound(_)
        | RagError::Store(_)
        | RagError::Generation(_)
        | RagError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Pipeline(err) => (status_for(&err), err.to_string()),
            ApiError::Multipart(err) => (err.status(), err.body_text()),
        };

        if status.is_server_error() {
            error!("Request failed with {}: {}", status, message);
        } else {
            warn!("Request rejected with {}: {}", status, message);
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub status: String,
    pub filename: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub question: Option<String>,
    /// Earlier turns under this id are fed to the model
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
    /// `student`, `teacher`, `researcher` or `general`
    #[serde(default, alias = "userType")]
    pub user_type: Option<String>,
}

impl ChatRequest {
    /// Unreadable payloads count as an empty question
    fn from_payload(payload: Result<Json<ChatRequest>, JsonRejection>) -> Self {
        match payload {
            Ok(Json(request)) => request,
            Err(rejection) => {
                debug!("Unreadable chat payload: {}", rejection);
                ChatRequest::default()
            }
        }
    }

    fn into_parts(self) -> (String, AskOptions) {
        let ask = AskOptions {
            conversation: self
                .conversation_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
            style: self
                .user_type
                .as_deref()
                .map(AnswerStyle::from_name)
                .unwrap_or_default(),
        };
        (self.question.unwrap_or_default(), ask)
    }
}

/// Build the HTTP router around a shared engine
pub fn router(engine: Arc<RagEngine>, options: &GatewayOptions) -> Router {
    let state = AppState {
        engine,
        upload_dir: Arc::new(options.upload_dir.clone()),
    };

    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health_check))
        .route("/upload_pdf", post(upload_pdf))
        .route("/chat/", post(chat))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .nest_service("/static", ServeDir::new(&options.static_dir))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the engine and serve until Ctrl-C
pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&settings.upload_dir)
        .await
        .with_context(|| format!("Failed to create {}", settings.upload_dir.display()))?;

    let engine = Arc::new(RagEngine::from_settings(settings).await?);
    let app = router(engine.clone(), &GatewayOptions::from_settings(settings));

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    info!("Server listening on {}", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.unload_index().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown requested");
}

async fn index_page() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn upload_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let original = field.file_name().unwrap_or_default().to_string();
        info!("Received upload request for file: {}", original);

        let file_name = stored_file_name(&original)?;
        if !is_pdf(&file_name) {
            return Err(RagError::InvalidUpload("Only PDF files are allowed.".to_string()).into());
        }

        let bytes = field.bytes().await?;
        let path = write_upload(&state.upload_dir, &file_name, &bytes).await?;
        debug!("Stored {} bytes at {}", bytes.len(), path.display());

        state.engine.ingest_file(&path).await?;

        return Ok(Json(UploadResponse {
            status: "success".to_string(),
            filename: file_name,
        }));
    }

    Err(RagError::InvalidUpload("No file uploaded.".to_string()).into())
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatAnswer>, ApiError> {
    let (question, ask) = ChatRequest::from_payload(payload).into_parts();
    let answer = state.engine.answer_with(&question, &ask).await?;
    Ok(Json(answer))
}

/// Server-sent events: `token` events with answer text as it is generated,
/// then one `complete` event carrying the full answer and its sources.
/// Retrieval errors are returned before the stream starts.
async fn chat_stream(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let (question, ask) = ChatRequest::from_payload(payload).into_parts();
    let prepared = state.engine.prepare_answer(&question, &ask).await?;

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let engine = state.engine.clone();
    tokio::spawn(async move { engine.stream_answer(prepared, tx).await });

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (sse_event(event), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: AnswerEvent) -> Result<Event, axum::Error> {
    match event {
        // Carriage returns cannot travel in an SSE data field
        AnswerEvent::Token(text) => Ok(Event::default().event("token").data(text.replace('\r', ""))),
        AnswerEvent::Complete(answer) => Event::default().event("complete").json_data(&answer),
    }
}

/// The client's file name without any directory part
fn stored_file_name(original: &str) -> Result<String, RagError> {
    let name = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(RagError::InvalidUpload("Missing file name.".to_string()));
    }
    Ok(name.to_string())
}

/// Write the upload under its own name, replacing any earlier file of that name
async fn write_upload(dir: &Path, file_name: &str, bytes: &[u8]) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let path = dir.join(file_name);
    let partial = dir.join(format!(
        ".{}.{}-{}.part",
        file_name,
        std::process::id(),
        UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let written = match tokio::fs::write(&partial, bytes).await {
        Ok(()) => tokio::fs::rename(&partial, &path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    Ok(path)
}
