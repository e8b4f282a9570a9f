//! HTTP server for the catalog import/export API.
//!
//! # API Endpoints
//!
//! | Method | Path                          | Description                           |
//! |--------|-------------------------------|---------------------------------------|
//! | GET    | `/health`                     | Health check                          |
//! | GET    | `/api/imports`                | Sessions known to this server         |
//! | POST   | `/api/imports`                | Upload a CSV and import it            |
//! | GET    | `/api/imports/{id}`           | Progress snapshot                     |
//! | GET    | `/api/imports/{id}/session`   | Full session record                   |
//! | POST   | `/api/imports/{id}/cancel`    | Request cancellation                  |
//! | GET    | `/api/export`                 | Filtered CSV export (streamed)        |
//! | POST   | `/api/validate`               | Bounded pre-check of an uploaded CSV  |
//! | GET    | `/api/events`                 | SSE stream of progress events         |

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{sse::Event, IntoResponse, Json, Response, Sse},
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde_json::{json, Value};
use std::{convert::Infallible, io, net::SocketAddr, time::Duration};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt as _;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::logs::EVENT_BROADCASTER;
use super::types::{
    error_response, CancelResponse, ExportQuery, ImportQuery, ImportResponse, ValidateResponse,
};
use crate::error::{ExportError, ImportError, ServerError, ServerResult};
use crate::export::Exporter;
use crate::jobs::ImportQueue;
use crate::parser::ImportSource;
use crate::storage::InMemoryStore;
use crate::validation::Validator;

/// Largest accepted upload.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Bytes buffered before an export chunk is handed to the response body.
const EXPORT_CHUNK_BYTES: usize = 16 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub queue: ImportQueue<InMemoryStore>,
}

impl AppState {
    pub fn new(queue: ImportQueue<InMemoryStore>) -> Self {
        Self { queue }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Import(ImportError::InvalidHeaders(_)) | ServerError::Import(ImportError::Csv(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ServerError::Export(ExportError::UnknownColumn(_)) => StatusCode::BAD_REQUEST,
            ServerError::Import(_) | ServerError::Export(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(error_response(&self.to_string()))).into_response()
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE, header::CONTENT_DISPOSITION]);

    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/api/imports", get(list_imports).post(create_import))
        .route("/api/imports/{id}", get(import_progress))
        .route("/api/imports/{id}/session", get(import_session))
        .route("/api/imports/{id}/cancel", post(cancel_import))
        .route("/api/export", get(export_csv))
        .route("/api/validate", post(validate_csv))
        .route("/api/events", get(sse_events))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(port: u16, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "Catalog CSV server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "catalog-csv",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Read the `file` part of a multipart upload.
async fn read_upload(multipart: &mut Multipart) -> ServerResult<ImportSource> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or("upload.csv").to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("Read error: {}", e)))?;
            info!(file = %name, bytes = data.len(), "Received upload");
            return Ok(ImportSource::bytes(name, data.to_vec()));
        }
    }
    Err(ServerError::BadRequest("No file provided".to_string()))
}

async fn list_imports(State(state): State<AppState>) -> Json<Vec<ImportResponse>> {
    Json(state.queue.sessions().iter().map(ImportResponse::from).collect())
}

/// Upload and import. Waits for the run unless `background=true`.
async fn create_import(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    mut multipart: Multipart,
) -> ServerResult<(StatusCode, Json<ImportResponse>)> {
    let source = read_upload(&mut multipart).await?;
    let mode = query.mode.unwrap_or_default();

    if query.background {
        let (handle, _task) = state.queue.dispatch(source, mode);
        return Ok((StatusCode::ACCEPTED, Json(ImportResponse::from(&handle.snapshot()))));
    }

    let session = state.queue.run(source, mode).await;
    Ok((StatusCode::OK, Json(ImportResponse::from(&session))))
}

async fn import_progress(State(state): State<AppState>, Path(id): Path<Uuid>) -> ServerResult<Json<Value>> {
    let progress = state
        .queue
        .progress(id)
        .ok_or_else(|| ServerError::NotFound(format!("import session {}", id)))?;
    serde_json::to_value(progress)
        .map(Json)
        .map_err(|e| ServerError::Internal(e.to_string()))
}

async fn import_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> ServerResult<Json<Value>> {
    let session = state
        .queue
        .session(id)
        .ok_or_else(|| ServerError::NotFound(format!("import session {}", id)))?;
    serde_json::to_value(session)
        .map(Json)
        .map_err(|e| ServerError::Internal(e.to_string()))
}

async fn cancel_import(State(state): State<AppState>, Path(id): Path<Uuid>) -> ServerResult<Json<CancelResponse>> {
    let cancelled = state.queue.cancel(id);
    let session = state
        .queue
        .session(id)
        .ok_or_else(|| ServerError::NotFound(format!("import session {}", id)))?;
    Ok(Json(CancelResponse {
        session_id: id,
        cancelled,
        status: session.status,
    }))
}

/// Stream a filtered export as CSV.
///
/// The store is read on a blocking worker and the bytes are forwarded
/// through a bounded channel, so neither side holds the whole file.
async fn export_csv(State(state): State<AppState>, Query(query): Query<ExportQuery>) -> ServerResult<Response> {
    let (filter, options) = query.into_parts();
    let exporter = Exporter::new(state.queue.config());
    exporter.headers(&options)?;

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(16);
    let store = state.queue.store().clone();
    tokio::task::spawn_blocking(move || {
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        let writer = ChannelWriter::new(tx.clone());
        if let Err(e) = exporter.export(&*store, &filter, &options, writer) {
            warn!(error = %e, "Export aborted");
            let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
        }
    });

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
        (header::CONTENT_DISPOSITION, "attachment; filename=\"catalog-export.csv\""),
    ];
    Ok((headers, Body::from_stream(ReceiverStream::new(rx))).into_response())
}

/// Bounded pre-check of an uploaded file; nothing is written.
async fn validate_csv(State(state): State<AppState>, mut multipart: Multipart) -> ServerResult<Json<ValidateResponse>> {
    let source = read_upload(&mut multipart).await?;
    let config = state.queue.config().clone();

    let result = tokio::task::spawn_blocking(move || {
        Validator::new(&config).validate_file(&source, &config, config.validation_sample_limit)
    })
    .await
    .map_err(|e| ServerError::Internal(e.to_string()))?
    .map_err(|e| ServerError::Import(ImportError::Csv(e)))?;

    Ok(Json(ValidateResponse::from(result)))
}

/// SSE endpoint for import progress events
async fn sse_events() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = EVENT_BROADCASTER.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => {
            let json = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default().event("import").data(json)))
        }
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// `io::Write` adapter feeding a response body channel.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(EXPORT_CHUNK_BYTES),
        }
    }

    fn send(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut self.buf));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

impl io::Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= EXPORT_CHUNK_BYTES {
            self.send()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportConfig;
    use axum::http::Request;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    const BOUNDARY: &str = "catalog-boundary";

    fn app() -> (Router, AppState) {
        let queue = ImportQueue::new(Arc::new(Mutex::new(InMemoryStore::new())), ImportConfig::default());
        let state = AppState::new(queue);
        (router(state.clone()), state)
    }

    fn upload(uri: &str, csv: &str) -> Request<Body> {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"books.csv\"\r\n\
             Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
            b = BOUNDARY,
            csv = csv
        );
        Request::post(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_import_then_progress_and_session() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(upload("/api/imports?mode=create_only", "ID,Title\nA1,One\nA2,\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(json["mode"], "create_only");
        assert_eq!(json["progress"]["totals"]["created"], 1);
        assert_eq!(json["progress"]["totals"]["failed"], 1);
        let id = json["sessionId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(Request::get(format!("/api/imports/{}", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["percentage"], 100.0);

        let response = app
            .oneshot(Request::get(format!("/api/imports/{}/session", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let session = body_json(response).await;
        assert_eq!(session["errors"][0]["field"], "title");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let (app, _) = app();
        let uri = format!("/api/imports/{}", Uuid::new_v4());
        let response = app
            .clone()
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::post(format!("{}/cancel", uri)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_finished_session_is_refused() {
        let (app, state) = app();
        let session = state
            .queue
            .run(ImportSource::bytes("a.csv", b"ID,Title\nA1,One\n".to_vec()), Default::default())
            .await;
        let response = app
            .oneshot(
                Request::post(format!("/api/imports/{}/cancel", session.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["cancelled"], false);
        assert_eq!(json["status"], "completed");
    }

    #[tokio::test]
    async fn test_export_streams_csv() {
        let (app, state) = app();
        state
            .queue
            .run(
                ImportSource::bytes("a.csv", b"ID,Title,Access\nA1,One,Y\nA2,Two,N\n".to_vec()),
                Default::default(),
            )
            .await;

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/export?columns=ID,Title&access_level=full")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ID,Title\nA1,One\n");

        let response = app
            .oneshot(Request::get("/api/export?columns=Shelf").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_validate_reports_without_writing() {
        let (app, state) = app();
        let response = app
            .oneshot(upload("/api/validate", "Title,Shelf\nOne,B2\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["valid"], false);
        assert_eq!(json["rowsChecked"], 1);
        assert_eq!(json["errors"][0]["message"], "Missing required column 'ID'");
        assert_eq!(state.queue.store().lock().unwrap().item_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_without_file_is_rejected() {
        let (app, _) = app();
        let body = format!("--{b}--\r\n", b = BOUNDARY);
        let request = Request::post("/api/imports")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
