//! Delivery sinks.
//!
//! A sink is the terminal step of the consumer pipeline: it hands a
//! validated event to the outside world and reports how that went. The
//! [`DeliverySink`] trait never fails; every problem comes back as a
//! [`DeliveryOutcome`] carrying a [`DeliveryError`], so the pipeline treats
//! a non-2xx answer exactly like a transport error.
//!
//! ## Built-in Sinks
//!
//! - [`WebhookSink`]: HTTP POST of a JSON envelope, bounded timeout, no retries
//! - [`LogSink`]: structured log line, always succeeds (dry runs)

pub mod log;
pub mod webhook;

use crate::event::ChampionshipEvent;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

pub use log::LogSink;
pub use webhook::WebhookSink;

/// Why a delivery did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The request did not finish within the sink's timeout
    #[error("delivery timed out after {0}ms")]
    Timeout(u64),

    /// Connection, TLS or protocol failure before a status was received
    #[error("transport error: {0}")]
    Transport(String),

    /// The target answered with a non-2xx status
    #[error("target returned HTTP {0}")]
    Status(u16),
}

impl DeliveryError {
    /// Short category for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::Transport(_) => "transport",
            DeliveryError::Status(_) => "status",
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    /// HTTP status, when the target answered at all
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub error: Option<DeliveryError>,
}

impl DeliveryOutcome {
    pub fn delivered(status: Option<u16>, elapsed: Duration) -> Self {
        Self {
            status,
            elapsed,
            error: None,
        }
    }

    pub fn failed(error: DeliveryError, elapsed: Duration) -> Self {
        let status = match &error {
            DeliveryError::Status(code) => Some(*code),
            _ => None,
        };
        Self {
            status,
            elapsed,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// How a consumer labels what it forwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryProfile {
    /// Envelope `eventType`, e.g. `championship.shots`
    pub event_type: String,
    /// `data.source`, e.g. `shots-pusher`
    pub source: String,
    /// Static service-specific fields merged into `data`
    pub extra: Map<String, Value>,
}

impl DeliveryProfile {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// The terminal step of message processing.
///
/// Sinks must be `Send + Sync`; one instance serves the whole worker.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Returns the name of this sink (e.g., "webhook", "log")
    fn name(&self) -> &str;

    /// Deliver one event. Never errors; failures are in the outcome.
    async fn deliver(&self, event: &ChampionshipEvent, profile: &DeliveryProfile) -> DeliveryOutcome;
}

/// The JSON envelope posted to a webhook.
///
/// ```json
/// {
///   "eventType": "championship.shots",
///   "timestamp": "2025-12-11T10:00:01.250Z",
///   "data": {
///     "championshipId": 10, "matchId": 55, "skillId": 4,
///     "eventTimestamp": "2025-12-11T10:00:00Z",
///     "source": "shots-pusher",
///     "analysisType": "shots_detection"
///   }
/// }
/// ```
///
/// Service-specific fields never replace the core `data` fields.
pub fn envelope(event: &ChampionshipEvent, profile: &DeliveryProfile, delivered_at: chrono::DateTime<chrono::Utc>) -> Value {
    let mut data = profile.extra.clone();
    data.insert("championshipId".into(), event.id_championship.into());
    data.insert("matchId".into(), event.id_match.into());
    data.insert("skillId".into(), event.id_skill.into());
    data.insert(
        "eventTimestamp".into(),
        Value::String(event.timestamp.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)),
    );
    data.insert("source".into(), Value::String(profile.source.clone()));

    serde_json::json!({
        "eventType": profile.event_type,
        "timestamp": delivered_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "data": Value::Object(data),
    })
}
