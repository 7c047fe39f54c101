//! HTTP ingress.
//!
//! - `POST /api/v1/events`: validate and publish one championship event
//! - `POST /api/v1/subscriptions`: provision a client's subscriptions
//! - `DELETE /api/v1/subscriptions`: remove them
//! - `GET /api/v1/dead-letters/:subscription`: inspect dead-lettered messages
//! - `GET /health`, `GET /metrics`: unauthenticated
//!
//! Every response body, success or error, carries a `correlationId`, taken
//! from `X-Correlation-ID` when the caller sent one.

use crate::broker::{BrokerError, DeadLetter, SubscriptionAdmin};
use crate::event::ChampionshipEvent;
use crate::producer::{EventPublisher, PublishError};
use crate::subscriptions::{ProvisionReport, SubscriptionError, SubscriptionManager, TeardownReport};
use crate::trace::{TraceContext, TRACEPARENT, TRACESTATE};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Dead letters returned when the caller gives no `limit`.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

/// Shared handler state.
pub struct AppState {
    pub publisher: EventPublisher,
    pub subscriptions: SubscriptionManager,
    pub admin: Arc<dyn SubscriptionAdmin>,
    /// `None` leaves `/api` open.
    pub api_key: Option<String>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        publisher: EventPublisher,
        subscriptions: SubscriptionManager,
        admin: Arc<dyn SubscriptionAdmin>,
    ) -> Self {
        Self {
            publisher,
            subscriptions,
            admin,
            api_key: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/events", post(emit_event))
        .route(
            "/api/v1/subscriptions",
            post(ensure_subscriptions).delete(teardown_subscriptions),
        )
        .route("/api/v1/dead-letters/:subscription", get(list_dead_letters))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

/// Error body: `{error, message, correlationId}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
    correlation_id: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        }
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message, correlation_id)
    }

    fn from_broker(e: &BrokerError, correlation_id: &str) -> Self {
        match e {
            BrokerError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", e.to_string(), correlation_id),
            BrokerError::Unavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "broker_unavailable", e.to_string(), correlation_id)
            }
            e => Self::new(StatusCode::BAD_GATEWAY, "broker_error", e.to_string(), correlation_id),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.error,
            "message": self.message,
            "correlationId": self.correlation_id,
        }));
        (self.status, body).into_response()
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Inbound W3C trace context, if the caller sent a well-formed one.
fn inbound_trace(headers: &HeaderMap) -> Option<TraceContext> {
    let parent = headers.get(TRACEPARENT)?.to_str().ok()?;
    let context = TraceContext::from_traceparent(parent)?;
    match headers.get(TRACESTATE).and_then(|v| v.to_str().ok()) {
        Some(state) => Some(context.with_trace_state(state)),
        None => Some(context),
    }
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if !path.starts_with("/api/") {
        return next.run(req).await;
    }

    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let correlation_id = correlation_id(req.headers());
    let rejection = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        Some(token) if token == expected => None,
        Some(_) => {
            warn!(correlation_id = %correlation_id, "Invalid API Key attempt");
            Some("invalid API key")
        }
        None => {
            warn!(correlation_id = %correlation_id, "Missing or malformed Authorization header");
            Some("missing bearer token")
        }
    };

    match rejection {
        None => next.run(req).await,
        Some(message) => {
            ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", message, &correlation_id).into_response()
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.admin.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "broker": "connected" }))),
        Err(e) => {
            error!(error = %e, "Broker ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "broker": "unavailable", "error": e.to_string() })),
            )
        }
    }
}

/// Get metrics endpoint - returns server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.uptime_seconds();

    // Format uptime as human-readable
    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "topic": state.publisher.topic(),
        "events": state.publisher.metrics().snapshot(),
        "status": "running"
    }))
}

/// Response returned when an event is published.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponse {
    pub message_id: String,
    pub correlation_id: String,
    /// Trace the publish span belongs to
    pub trace_id: String,
}

async fn emit_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ChampionshipEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let Json(event) = payload.map_err(|e| ApiError::bad_request(e.body_text(), &correlation_id))?;
    debug!(correlation_id = %correlation_id, event = ?event, "Received event");

    let parent = inbound_trace(&headers);
    match state.publisher.publish(&event, parent.as_ref()).await {
        Ok(receipt) => {
            info!(
                message_id = %receipt.message_id,
                correlation_id = %correlation_id,
                trace_id = %receipt.trace.trace_id,
                "Event accepted"
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(EventResponse {
                    message_id: receipt.message_id,
                    correlation_id,
                    trace_id: receipt.trace.trace_id.to_string(),
                }),
            ))
        }
        Err(PublishError::Validation(e)) => {
            warn!(correlation_id = %correlation_id, error = %e, "Event rejected");
            Err(ApiError::bad_request(e.to_string(), &correlation_id))
        }
        Err(PublishError::Serialization(e)) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "serialization_error",
            e.to_string(),
            &correlation_id,
        )),
        Err(PublishError::Broker { message_id, source }) => {
            error!(
                correlation_id = %correlation_id,
                message_id = %message_id,
                error = %source,
                "Event not published"
            );
            Err(ApiError::from_broker(&source, &correlation_id))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureRequest {
    pub client: String,
    pub service_types: Vec<String>,
    #[serde(default)]
    pub championship_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownRequest {
    pub client: String,
    pub service_types: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
    correlation_id: String,
    #[serde(flatten)]
    report: ProvisionReport,
    remaining: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeardownResponse {
    correlation_id: String,
    #[serde(flatten)]
    report: TeardownReport,
    failed: Vec<String>,
}

fn subscription_error(e: SubscriptionError, correlation_id: &str) -> ApiError {
    match e {
        SubscriptionError::Validation(message) => ApiError::bad_request(message, correlation_id),
        SubscriptionError::Partial(report) => ApiError::new(
            StatusCode::MULTI_STATUS,
            "partial_provisioning",
            format!("not provisioned: {}", report.remaining().join(", ")),
            correlation_id,
        ),
    }
}

async fn ensure_subscriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<EnsureRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text(), &correlation_id))?;

    let report = state
        .subscriptions
        .ensure_subscriptions(&request.client, &request.service_types, &request.championship_ids)
        .await
        .map_err(|e| subscription_error(e, &correlation_id))?;

    let status = if report.is_complete() {
        StatusCode::OK
    } else if report.created().is_empty() && report.broker_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::MULTI_STATUS
    };

    info!(
        correlation_id = %correlation_id,
        client = %report.client,
        complete = report.is_complete(),
        "Subscriptions ensured"
    );

    let body = ProvisionResponse {
        correlation_id,
        remaining: report.remaining(),
        report,
    };
    Ok((status, Json(body)))
}

async fn teardown_subscriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<TeardownRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TeardownResponse>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text(), &correlation_id))?;

    let report = state
        .subscriptions
        .teardown_subscriptions(&request.client, &request.service_types)
        .await
        .map_err(|e| subscription_error(e, &correlation_id))?;

    let status = if report.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };

    let body = TeardownResponse {
        correlation_id,
        failed: report.failed(),
        report,
    };
    Ok((status, Json(body)))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterResponse {
    correlation_id: String,
    subscription: String,
    count: usize,
    dead_letters: Vec<DeadLetter>,
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(subscription): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLetterResponse>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);

    let dead_letters = state
        .admin
        .dead_letters(state.subscriptions.topic(), &subscription, limit)
        .await
        .map_err(|e| ApiError::from_broker(&e, &correlation_id))?;

    Ok(Json(DeadLetterResponse {
        correlation_id,
        subscription,
        count: dead_letters.len(),
        dead_letters,
    }))
}
