use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_identity_core::{ConsolidatedView, ContactId, IdentityError, Observation};
use contact_identity_store_sqlite::SqliteContactStore;
use serde::{Deserialize, Serialize};
use serde_json::json;

const LIVENESS_BODY: &str = "Identity Reconciliation Service is running";

#[derive(Debug, Clone)]
struct ServiceState {
    db: PathBuf,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    invariant_violation_total: AtomicU64,
    store_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    invariant_violation_total: u64,
    store_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Deserialize)]
struct IdentifyRequest {
    email: Option<String>,
    #[serde(rename = "phoneNumber")]
    phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct IdentifyResponse {
    contact: ContactPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ContactPayload {
    // The misspelled key is a wire-compatibility artifact consumed by
    // existing clients; do not correct it.
    #[serde(rename = "primaryContatctId")]
    primary_contact_id: ContactId,
    emails: Vec<String>,
    #[serde(rename = "phoneNumbers")]
    phone_numbers: Vec<String>,
    #[serde(rename = "secondaryContactIds")]
    secondary_contact_ids: Vec<ContactId>,
}

impl From<ConsolidatedView> for ContactPayload {
    fn from(view: ConsolidatedView) -> Self {
        Self {
            primary_contact_id: view.primary_id,
            emails: view.emails,
            phone_numbers: view.phones,
            secondary_contact_ids: view.secondary_ids,
        }
    }
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(payload)).into_response()
    }
}

#[derive(Debug, Parser)]
#[command(name = "contact-identity-service")]
#[command(about = "HTTP boundary for the contact identity resolution engine")]
struct Args {
    #[arg(long, default_value = "./contact_identity.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(rejection.status(), "invalid_json", rejection.body_text())
    }

    fn validation(&self, err: &IdentityError) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
    }

    fn classify_store_error(err: &anyhow::Error) -> ServiceFailure {
        let message = err.to_string();
        let normalized = format!("{err:#}").to_ascii_lowercase();

        if normalized.contains("invariant violation") {
            return Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "invariant_violation",
                message,
            );
        }

        if normalized.contains("sqlite") || normalized.contains("database") {
            return Self::failure(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message);
        }

        Self::failure(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    async fn run_blocking<T, F>(&self, operation_label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db = self.db.clone();
        let handle = tokio::task::spawn_blocking(move || op(db));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("internal_error", true);
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_store_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "invariant_violation" => {
                self.invariant_violation_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_error" => {
                self.store_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            invariant_violation_total: self.invariant_violation_total.load(Ordering::Relaxed),
            store_error_total: self.store_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health))
        .route("/identify", post(identify))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Fail fast on an unusable database before accepting traffic.
    let store = SqliteContactStore::open(&args.db)?;
    store.migrate()?;
    drop(store);

    let state = ServiceState {
        db: args.db,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, LIVENESS_BODY)
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    })
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;

    // Validation happens before any store access.
    let observation = Observation::new(request.email.as_deref(), request.phone_number.as_deref())
        .map_err(|err| state.validation(&err))?;

    let view = state
        .run_blocking("identify", move |db| {
            let mut store = SqliteContactStore::open(&db)?;
            store.identify(&observation)
        })
        .await?;

    Ok(Json(IdentifyResponse {
        contact: view.into(),
    }))
}
