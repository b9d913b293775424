use axum::{
    Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode},
    middleware::{Next, from_fn},
    response::{Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    error::{StoreError, VerificationError},
    llm::OpenRouterGenerator,
    models::{ReviewStateResponse, VerificationOutcome, VerifySummaryRequest},
    storage::{DocumentStore, InMemoryDocumentStore},
    storage_postgres::PostgresDocumentStore,
    workflow::SummaryVerificationFlow,
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

const CORRELATION_HEADER: &str = "x-correlation-id";

fn error_response(code: StatusCode, message: &str, details: Option<&str>) -> ApiError {
    let mut body = json!({
        "error": message,
        "status": "error"
    });
    if let Some(details) = details {
        body["details"] = json!(details);
    }
    (code, Json(body))
}

fn bad_request_error(message: &str) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, message, None)
}

fn not_found_error(document_id: &str) -> ApiError {
    let (code, Json(mut body)) =
        error_response(StatusCode::NOT_FOUND, "Document not found", None);
    body["documentId"] = json!(document_id);
    (code, Json(body))
}

fn internal_error(message: &str, details: &str) -> ApiError {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message, Some(details))
}

fn map_verification_error(document_id: &str, err: VerificationError) -> ApiError {
    match &err {
        VerificationError::DocumentNotFound(_)
        | VerificationError::Storage(StoreError::NotFound(_)) => not_found_error(document_id),
        VerificationError::Storage(StoreError::VersionConflict { .. }) => error_response(
            StatusCode::CONFLICT,
            "Document was modified by another writer during verification",
            Some(&err.to_string()),
        ),
        VerificationError::Generation { .. } => error_response(
            StatusCode::BAD_GATEWAY,
            "Text generation service call failed",
            Some(&err.to_string()),
        ),
        VerificationError::Storage(_) => {
            internal_error("Failed to access document storage", &err.to_string())
        }
        VerificationError::Workflow(_) => {
            internal_error("Verification workflow failed", &err.to_string())
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    /// `None` when no text-generation credential is configured
    pub flow: Option<Arc<SummaryVerificationFlow>>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, flow: Option<SummaryVerificationFlow>) -> Self {
        Self {
            store,
            flow: flow.map(Arc::new),
        }
    }
}

pub async fn create_app(config: &ServiceConfig) -> Router {
    let store = create_document_store(config).await;

    let flow = match &config.openrouter_api_key {
        Some(api_key) => {
            let generator = Arc::new(OpenRouterGenerator::new(api_key, &config.model));
            Some(SummaryVerificationFlow::new(store.clone(), generator))
        }
        None => {
            warn!("OPENROUTER_API_KEY not set; verification requests will fail with 500");
            None
        }
    };

    build_router(AppState::new(store, flow))
}

async fn create_document_store(config: &ServiceConfig) -> Arc<dyn DocumentStore> {
    match &config.database_url {
        Some(database_url) => match PostgresDocumentStore::connect(database_url).await {
            Ok(store) => {
                info!("Using PostgreSQL document store");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    "Failed to connect to PostgreSQL: {}. Falling back to in-memory storage.",
                    e
                );
                Arc::new(InMemoryDocumentStore::new())
            }
        },
        None => {
            info!("Using in-memory document store (set DATABASE_URL to use PostgreSQL)");
            Arc::new(InMemoryDocumentStore::new())
        }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/verify-summary", post(verify_summary))
        .route(
            "/documents/{document_id}/verification",
            get(get_verification_state),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(correlation_id_middleware))
        .with_state(app_state)
}

/// Tag every request with a correlation id and run it inside a span carrying it
async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = HeaderValue::from_str(&correlation_id).ok();
    if let Some(value) = &header {
        request.headers_mut().insert(CORRELATION_HEADER, value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Summary Verification Service",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Certifies that generated article summaries are fully supported by their source text",
        "endpoints": {
            "POST /verify-summary": "Generate, verify and correct a document summary",
            "GET /documents/{document_id}/verification": "Current verification state and audit trail",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn verify_summary(
    State(state): State<AppState>,
    payload: Result<Json<VerifySummaryRequest>, JsonRejection>,
) -> ApiResult<VerificationOutcome> {
    let Json(request) = payload.map_err(|rejection| {
        warn!("Rejected verification request body: {}", rejection);
        bad_request_error(&format!("Invalid request body: {}", rejection.body_text()))
    })?;

    let document_id = validate_document_id(request.document_id.as_deref())?;

    let Some(flow) = &state.flow else {
        error!("Verification requested but OPENROUTER_API_KEY is not configured");
        return Err(internal_error(
            "Text generation is not configured",
            "OPENROUTER_API_KEY environment variable is not set",
        ));
    };

    info!(
        document_id = %document_id,
        force_regenerate = request.force_regenerate,
        "Starting summary verification"
    );

    match flow.run(&document_id, request.force_regenerate).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            error!(document_id = %document_id, "Verification failed: {}", e);
            Err(map_verification_error(&document_id, e))
        }
    }
}

fn validate_document_id(document_id: Option<&str>) -> Result<String, ApiError> {
    match document_id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(bad_request_error("documentId is required")),
    }
}

async fn get_verification_state(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<ReviewStateResponse> {
    match state.store.get_document(&document_id).await {
        Ok(Some(document)) => Ok(Json(ReviewStateResponse::from(document))),
        Ok(None) => Err(not_found_error(&document_id)),
        Err(e) => {
            error!("Failed to load document {}: {}", document_id, e);
            Err(internal_error("Failed to load document", &e.to_string()))
        }
    }
}
