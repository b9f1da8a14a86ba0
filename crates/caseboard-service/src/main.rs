use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{HeaderName, CONTENT_TYPE, REFERER, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use caseboard_core::{Case, CaseError, CaseId, CaseInput, CaseService};
use caseboard_store_sqlite::SqliteCaseStore;
use clap::Parser;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const MISSING_BODY_MESSAGE: &str = "Required request body is missing";
const DEFAULT_LOG_FILTER: &str = "info,tower_http=info";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

/// Whether an operation may be abandoned once it exceeds the operation timeout.
///
/// Writes are awaited past the deadline and report their committed outcome.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct ServiceState {
    cases: CaseService,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct DataEnvelope<T>
where
    T: Serialize,
{
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Clone, Serialize)]
struct ApiError {
    code: String,
    message: String,
    errors: Vec<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
struct ErrorDetails {
    reason: String,
    message: String,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    kind: &'static str,
    message: String,
    errors: Vec<ErrorDetails>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    malformed_request_total: AtomicU64,
    validation_failed_total: AtomicU64,
    case_not_found_total: AtomicU64,
    duplicate_case_number_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    malformed_request_total: u64,
    validation_failed_total: u64,
    case_not_found_total: u64,
    duplicate_case_number_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "caseboard-service")]
#[command(about = "HTTP service for Caseboard case records")]
struct Args {
    #[arg(long, env = "CASEBOARD_DB", default_value = "./caseboard.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CASEBOARD_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
    #[arg(long, env = "CASEBOARD_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(
        long,
        env = "CASEBOARD_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_values = [
            "http://localhost:3000",
            "http://localhost:8080",
            "https://localhost:8080",
        ]
    )]
    allowed_origins: Vec<String>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ApiErrorResponse {
            error: ApiError {
                code: self.status.as_u16().to_string(),
                message: self.message,
                errors: self.errors,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceFailure {
    fn new(
        status: StatusCode,
        kind: &'static str,
        message: impl Into<String>,
        errors: Vec<ErrorDetails>,
    ) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            errors,
        }
    }

    fn missing_body() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "MalformedRequest",
            MISSING_BODY_MESSAGE,
            Vec::new(),
        )
    }

    fn route_not_found(uri: &Uri) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "RouteNotFound",
            format!("No route for {}", uri.path()),
            Vec::new(),
        )
    }

    fn method_not_allowed(method: &Method, uri: &Uri) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            format!("Request method '{method}' is not supported for {}", uri.path()),
            Vec::new(),
        )
    }

    fn malformed_id(raw: &str, err: &std::num::ParseIntError) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "MalformedRequest",
            format!("Failed to convert path parameter 'id' with value '{raw}': {err}"),
            vec![ErrorDetails {
                reason: "ParseIntError".to_string(),
                message: format!("id {raw}"),
            }],
        )
    }

    fn internal(kind: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, kind, message, Vec::new())
    }

    fn from_case_error(err: &CaseError) -> Self {
        let message = err.to_string();
        match err {
            CaseError::ValidationFailed(violations) => Self::new(
                StatusCode::BAD_REQUEST,
                err.kind(),
                message,
                violations
                    .iter()
                    .map(|violation| ErrorDetails {
                        reason: violation.field.clone(),
                        message: violation.message.clone(),
                    })
                    .collect(),
            ),
            CaseError::CaseNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, err.kind(), message, Vec::new())
            }
            CaseError::DuplicateCaseNumber { .. } => Self::internal(err.kind(), message),
            CaseError::StoreUnavailable(source) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.kind(),
                message,
                vec![ErrorDetails {
                    reason: source.kind().to_string(),
                    message: source.to_string(),
                }],
            ),
        }
    }
}

impl ServiceState {
    fn new(cases: CaseService, operation_timeout: Duration) -> Self {
        Self {
            cases,
            operation_timeout,
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn missing_body_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        tracing::info!(rejection = %rejection, "rejected request body");
        self.telemetry.record_rejection();
        ServiceFailure::missing_body()
    }

    fn parse_case_id(&self, raw: &str) -> Result<CaseId, ServiceFailure> {
        raw.parse::<CaseId>().map_err(|err| {
            tracing::info!(id = raw, "rejected malformed case id");
            self.telemetry.record_rejection();
            ServiceFailure::malformed_id(raw, &err)
        })
    }

    /// Runs a synchronous case operation on the blocking pool.
    ///
    /// Reads that exceed the operation timeout fail with a 500. Writes that
    /// exceed it are awaited to completion and report what actually happened.
    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        access: Access,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(CaseService) -> Result<T, CaseError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let cases = self.cases.clone();
        let mut handle = tokio::task::spawn_blocking(move || op(cases));
        let join_result = match tokio::time::timeout(self.operation_timeout, &mut handle).await {
            Ok(join_result) => join_result,
            Err(_) if access == Access::Write => {
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = %self.operation_timeout.as_millis(),
                    "case write exceeded operation timeout, awaiting its outcome"
                );
                handle.await
            }
            Err(_) => {
                self.telemetry.record_failure("Timeout", true);
                tracing::error!(operation = operation_label, "case operation timed out");
                return Err(ServiceFailure::internal(
                    "Timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                ));
            }
        };

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("InternalError", false);
            tracing::error!(
                operation = operation_label,
                error = %err,
                "case operation join failure"
            );
            ServiceFailure::internal(
                "InternalError",
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = ServiceFailure::from_case_error(&err);
                tracing::warn!(
                    operation = operation_label,
                    kind = failure.kind,
                    error = %err,
                    "case operation failed"
                );
                self.telemetry.record_failure(failure.kind, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_rejection(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.record_failure("MalformedRequest", false);
    }

    fn record_failure(&self, kind: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match kind {
            "MalformedRequest" => &self.malformed_request_total,
            "ValidationFailed" => &self.validation_failed_total,
            "CaseNotFound" => &self.case_not_found_total,
            "DuplicateCaseNumber" => &self.duplicate_case_number_total,
            "StoreUnavailable" => &self.store_unavailable_total,
            "Timeout" => return,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            malformed_request_total: self.malformed_request_total.load(Ordering::Relaxed),
            validation_failed_total: self.validation_failed_total.load(Ordering::Relaxed),
            case_not_found_total: self.case_not_found_total.load(Ordering::Relaxed),
            duplicate_case_number_total: self
                .duplicate_case_number_total
                .load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> DataEnvelope<T>
where
    T: Serialize,
{
    DataEnvelope { data }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers.get(name).and_then(|value| value.to_str().ok()).unwrap_or_default()
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(origin, error = %err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([CONTENT_TYPE])
}

fn app(state: ServiceState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health).fallback(method_not_allowed))
        .route("/api/v1/openapi", get(openapi).fallback(method_not_allowed))
        .route(
            "/api/v1/cases",
            get(list_cases).post(insert_case).fallback(method_not_allowed),
        )
        .route(
            "/api/v1/cases/:id",
            get(get_case)
                .put(update_case)
                .delete(delete_case)
                .fallback(method_not_allowed),
        )
        .fallback(route_not_found)
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install ctrl-c handler");
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let operation_timeout = Duration::from_millis(args.operation_timeout_ms);
    let store = SqliteCaseStore::open_with_busy_timeout(&args.db, operation_timeout / 2)?;
    store.migrate()?;
    let state = ServiceState::new(CaseService::from_store(store), operation_timeout);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "caseboard-service listening");

    axum::serve(listener, app(state, &args.allowed_origins))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<DataEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn openapi() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/yaml; charset=utf-8")],
        OPENAPI_YAML,
    )
}

async fn route_not_found(uri: Uri) -> ServiceFailure {
    tracing::info!(path = uri.path(), "no route matched");
    ServiceFailure::route_not_found(&uri)
}

async fn method_not_allowed(method: Method, uri: Uri) -> ServiceFailure {
    tracing::info!(%method, path = uri.path(), "method not allowed");
    ServiceFailure::method_not_allowed(&method, &uri)
}

async fn list_cases(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<DataEnvelope<Vec<Case>>>, ServiceFailure> {
    tracing::info!(
        referer = header_str(&headers, &REFERER),
        user_agent = header_str(&headers, &USER_AGENT),
        "getCases request"
    );
    let cases = state
        .run_blocking("list_cases", Access::Read, |cases| cases.list_all())
        .await?;
    tracing::info!(size = cases.len(), "getCases response");
    Ok(Json(envelope(cases)))
}

async fn get_case(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<DataEnvelope<Case>>, ServiceFailure> {
    tracing::info!(
        id = %raw_id,
        referer = header_str(&headers, &REFERER),
        user_agent = header_str(&headers, &USER_AGENT),
        "getCase request"
    );
    let id = state.parse_case_id(&raw_id)?;
    let result = state
        .run_blocking("get_case", Access::Read, move |cases| {
            cases.get_by_id(id)?.ok_or(CaseError::CaseNotFound { id })
        })
        .await;

    match &result {
        Ok(_) => tracing::info!(case_id = %id, "case found"),
        Err(failure) if failure.status == StatusCode::NOT_FOUND => {
            tracing::info!(case_id = %id, "case not found");
        }
        Err(_) => {}
    }
    Ok(Json(envelope(result?)))
}

async fn insert_case(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CaseInput>, JsonRejection>,
) -> Result<(StatusCode, Json<CaseId>), ServiceFailure> {
    let Json(candidate) =
        payload.map_err(|rejection| state.missing_body_with_telemetry(&rejection))?;
    tracing::info!(
        case_number = candidate.case_number.as_deref().unwrap_or_default(),
        referer = header_str(&headers, &REFERER),
        user_agent = header_str(&headers, &USER_AGENT),
        "insertCase request"
    );
    let id = state
        .run_blocking("insert_case", Access::Write, move |cases| {
            cases.insert(&candidate)
        })
        .await?;
    tracing::info!(case_id = %id, "new case inserted");
    Ok((StatusCode::CREATED, Json(id)))
}

async fn update_case(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
    payload: Result<Json<CaseInput>, JsonRejection>,
) -> Result<Json<bool>, ServiceFailure> {
    tracing::info!(
        id = %raw_id,
        referer = header_str(&headers, &REFERER),
        user_agent = header_str(&headers, &USER_AGENT),
        "updateCase request"
    );
    let id = state.parse_case_id(&raw_id)?;
    let Json(candidate) =
        payload.map_err(|rejection| state.missing_body_with_telemetry(&rejection))?;
    state
        .run_blocking("update_case", Access::Write, move |cases| {
            cases.update(id, &candidate)
        })
        .await?;
    Ok(Json(true))
}

async fn delete_case(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ServiceFailure> {
    tracing::info!(
        id = %raw_id,
        referer = header_str(&headers, &REFERER),
        user_agent = header_str(&headers, &USER_AGENT),
        "deleteCase request"
    );
    let id = state.parse_case_id(&raw_id)?;
    state
        .run_blocking("delete_case", Access::Write, move |cases| {
            cases.delete_by_id(id)
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
