//! Log Sink - Structured logging instead of delivery.
//!
//! The [`LogSink`] stands in for the webhook on local runs (`dry_run`): it
//! writes the envelope it would have posted and reports success.
//!
//! # Example
//!
//! ```rust,ignore
//! use touchline::sink::LogSink;
//!
//! let sink = LogSink::with_prefix("dry-run");
//! ```

use super::{envelope, DeliveryOutcome, DeliveryProfile, DeliverySink};
use crate::event::ChampionshipEvent;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// A sink that logs events using structured logging.
#[derive(Debug, Clone)]
pub struct LogSink {
    /// Prefix for log messages
    prefix: String,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            prefix: "delivery".to_string(),
        }
    }

    /// The prefix appears in log messages to tell several workers apart
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliverySink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &ChampionshipEvent, profile: &DeliveryProfile) -> DeliveryOutcome {
        let payload = envelope(event, profile, chrono::Utc::now());
        info!(
            prefix = %self.prefix,
            event_type = %profile.event_type,
            payload = %payload,
            "[{}] Would deliver {} for match {}",
            self.prefix,
            profile.event_type,
            event.id_match
        );
        DeliveryOutcome::delivered(None, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_sink_always_succeeds() {
        let sink = LogSink::with_prefix("dry-run");
        let event = ChampionshipEvent::new(10, 55, 4, chrono::Utc::now());

        let outcome = sink
            .deliver(&event, &DeliveryProfile::new("championship.event", "events-pusher"))
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.status, None);
        assert_eq!(sink.name(), "log");
    }
}
