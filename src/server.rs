//! HTTP API for the study dashboard.
//!
//! Request bodies are HTML forms (`multipart/form-data`, or
//! `application/x-www-form-urlencoded` for the question endpoints) and
//! responses are JSON.
//!
//! # Endpoints
//!
//! | Method   | Path                        | Description                              |
//! |----------|-----------------------------|------------------------------------------|
//! | `POST`   | `/upload`                   | Ingest files (`subject`, `files`…)       |
//! | `POST`   | `/ask`                      | Grounded answer with citations           |
//! | `POST`   | `/ask_v2`                   | Same response as `/ask`                  |
//! | `POST`   | `/teacher_ask`              | Conversational reply with a follow-up    |
//! | `GET`    | `/subjects`                 | Subjects and corpus sizes                |
//! | `GET`    | `/subjects/{id}/documents`  | Documents of one subject                 |
//! | `DELETE` | `/documents/{id}`           | Remove a document and its passages       |
//! | `GET`    | `/health`                   | Health check (returns version)           |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unknown_subject", "message": "unknown subject: subject3" } }
//! ```
//!
//! Error codes: `bad_request`, `invalid_subject`, `unsupported_format`,
//! `empty_document` (400); `unknown_subject`, `not_found` (404);
//! `timeout` (504); `synthesis_failed`, `internal` (500).
//!
//! Per-file upload failures do not fail the request; they are reported in
//! the file's entry of the `/upload` response.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::{AnswerEngine, SubjectSummary};
use crate::error::EngineError;
use crate::models::{AnswerRecord, AnswerStyle, Document, HistoryTurn, Query};
use crate::store::Upload;

/// Version tag of the `/ask` response shape.
const ANSWER_SCHEMA_VERSION: u32 = 2;

#[derive(Clone)]
struct AppState {
    engine: Arc<AnswerEngine>,
}

/// Build the router. Exposed so tests can drive it without a socket.
pub fn router(engine: Arc<AnswerEngine>, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/upload", post(handle_upload))
        .route("/ask", post(handle_ask))
        .route("/ask_v2", post(handle_ask))
        .route("/teacher_ask", post(handle_teacher_ask))
        .route("/subjects", get(handle_subjects))
        .route("/subjects/{id}/documents", get(handle_documents))
        .route("/documents/{id}", delete(handle_remove))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(AnswerEngine::from_config(config).await?);
    let app = router(engine.clone(), config.server.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("AskMyNotes listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::UnsupportedFormat(_)
        | EngineError::EmptyDocument(_)
        | EngineError::InvalidSubject(_)
        | EngineError::EmptyQuestion => StatusCode::BAD_REQUEST,
        EngineError::UnknownSubject(_) | EngineError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::Synthesis(_) | EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ Form parsing ============

/// Fields shared by the question endpoints.
#[derive(Debug, Default, Deserialize)]
struct AskForm {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    question: Option<String>,
    /// JSON array of `{ "role", "content" }`.
    #[serde(default)]
    history: Option<String>,
}

fn is_multipart(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    AppError {
        status: err.status(),
        code: "bad_request".to_string(),
        message: err.body_text(),
    }
}

/// Client file name without any directory part, either separator style.
fn base_name(name: &str) -> Option<String> {
    name.rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
}

async fn read_ask_form(req: Request) -> Result<AskForm, AppError> {
    if !is_multipart(&req) {
        let Form(form) = Form::<AskForm>::from_request(req, &())
            .await
            .map_err(|e| bad_request(e.body_text()))?;
        return Ok(form);
    }

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| bad_request(e.body_text()))?;
    let mut form = AskForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        let value = field.text().await.map_err(multipart_error)?;
        match name.as_str() {
            "subject" => form.subject = Some(value),
            "question" => form.question = Some(value),
            "history" => form.history = Some(value),
            _ => {}
        }
    }
    Ok(form)
}

/// Malformed history is ignored rather than failing the question.
fn parse_history(raw: Option<&str>) -> Vec<HistoryTurn> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str(raw) {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed history");
            Vec::new()
        }
    }
}

fn into_query(form: AskForm, style: AnswerStyle) -> Result<Query, AppError> {
    let subject = form
        .subject
        .ok_or_else(|| bad_request("subject is required"))?;
    let question = form
        .question
        .ok_or_else(|| bad_request("question is required"))?;
    let history = parse_history(form.history.as_deref());
    Ok(Query::new(subject, question)
        .with_history(history)
        .with_style(style))
}

// ============ POST /ask, /ask_v2 ============

#[derive(Debug, Serialize)]
struct EvidenceBody {
    snippet: String,
    /// `"<file> | <section>"`
    citation: String,
}

#[derive(Debug, Serialize)]
struct CitationBody {
    file: String,
    section: String,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    version: u32,
    answer: String,
    confidence: String,
    evidence: Vec<EvidenceBody>,
    citations: Vec<CitationBody>,
}

fn evidence_body(record: &AnswerRecord) -> Vec<EvidenceBody> {
    record
        .evidence
        .iter()
        .map(|e| EvidenceBody {
            snippet: e.snippet.clone(),
            citation: e.citation.label(),
        })
        .collect()
}

async fn handle_ask(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<AskResponse>, AppError> {
    let query = into_query(read_ask_form(req).await?, AnswerStyle::Concise)?;
    let record = state.engine.ask(&query).await?;

    Ok(Json(AskResponse {
        version: ANSWER_SCHEMA_VERSION,
        evidence: evidence_body(&record),
        citations: record
            .citations
            .iter()
            .map(|c| CitationBody {
                file: c.file.clone(),
                section: c.section.clone(),
            })
            .collect(),
        confidence: record.confidence.to_string(),
        answer: record.answer,
    }))
}

// ============ POST /teacher_ask ============

#[derive(Debug, Serialize)]
struct TeacherResponse {
    reply: String,
    confidence: String,
    evidence: Vec<EvidenceBody>,
}

async fn handle_teacher_ask(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<TeacherResponse>, AppError> {
    let query = into_query(read_ask_form(req).await?, AnswerStyle::Teacher)?;
    let record = state.engine.ask(&query).await?;

    Ok(Json(TeacherResponse {
        evidence: evidence_body(&record),
        confidence: record.confidence.to_string(),
        reply: record.answer,
    }))
}

// ============ POST /upload ============

#[derive(Debug, Serialize)]
struct UploadFileResult {
    filename: String,
    /// `"ok"` or `"error"`.
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    passages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    subject: String,
    files: Vec<UploadFileResult>,
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut subject: Option<String> = None;
    let mut uploads = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "subject" => subject = Some(field.text().await.map_err(multipart_error)?),
            "files" | "file" => {
                let filename = field
                    .file_name()
                    .and_then(base_name)
                    .unwrap_or_else(|| "upload".to_string());
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(multipart_error)?;
                let mut upload = Upload::new(filename, bytes.to_vec());
                upload.content_type = content_type;
                uploads.push(upload);
            }
            _ => {}
        }
    }

    let subject = subject.ok_or_else(|| bad_request("subject is required"))?;
    if uploads.is_empty() {
        return Err(bad_request("at least one file is required"));
    }

    let outcomes = state.engine.ingest_batch(&subject, uploads).await?;
    let files = outcomes
        .into_iter()
        .map(|outcome| match outcome.result {
            Ok(doc) => UploadFileResult {
                filename: outcome.filename,
                status: "ok",
                document_id: Some(doc.id),
                passages: Some(doc.passage_count),
                preview: outcome.preview,
                error: None,
            },
            Err(err) => UploadFileResult {
                filename: outcome.filename,
                status: "error",
                document_id: None,
                passages: None,
                preview: None,
                error: Some(ErrorDetail {
                    code: err.code().to_string(),
                    message: err.to_string(),
                }),
            },
        })
        .collect();

    Ok(Json(UploadResponse { subject, files }))
}

// ============ Subjects and documents ============

#[derive(Serialize)]
struct SubjectsResponse {
    subjects: Vec<SubjectSummary>,
}

async fn handle_subjects(State(state): State<AppState>) -> Json<SubjectsResponse> {
    Json(SubjectsResponse {
        subjects: state.engine.subjects(),
    })
}

#[derive(Serialize)]
struct DocumentsResponse {
    subject: String,
    documents: Vec<Document>,
}

async fn handle_documents(
    State(state): State<AppState>,
    Path(subject): Path<String>,
) -> Result<Json<DocumentsResponse>, AppError> {
    let documents = state.engine.documents(&subject)?;
    Ok(Json(DocumentsResponse { subject, documents }))
}

#[derive(Serialize)]
struct RemoveResponse {
    removed: Document,
}

async fn handle_remove(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<RemoveResponse>, AppError> {
    let removed = state.engine.remove(&document_id).await?;
    Ok(Json(RemoveResponse { removed }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (EngineError::UnknownSubject("s".into()), StatusCode::NOT_FOUND, "unknown_subject"),
            (EngineError::InvalidSubject("s".into()), StatusCode::BAD_REQUEST, "invalid_subject"),
            (
                EngineError::Timeout(std::time::Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
            ),
            (EngineError::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            (
                EngineError::Synthesis("backend".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "synthesis_failed",
            ),
        ];
        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status, status);
            assert_eq!(app.code, code);
        }
    }

    #[test]
    fn upload_names_lose_their_directories() {
        assert_eq!(base_name("../../x.pdf").as_deref(), Some("x.pdf"));
        assert_eq!(base_name("C:\\notes\\week1.docx").as_deref(), Some("week1.docx"));
        assert_eq!(base_name("bio.txt").as_deref(), Some("bio.txt"));
        assert_eq!(base_name("notes/").as_deref(), None);
        assert_eq!(base_name("..").as_deref(), None);
    }

    #[test]
    fn malformed_history_is_ignored() {
        assert!(parse_history(Some("not json")).is_empty());
        assert!(parse_history(None).is_empty());
        let turns = parse_history(Some(r#"[{"role":"user","content":"What is ATP?"}]"#));
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].content, "What is ATP?");
    }
}
