//! Webhook Sink - HTTP POST to the client's endpoint.
//!
//! The [`WebhookSink`] posts the delivery envelope (see [`super::envelope`])
//! to one fixed URL. It makes exactly one attempt per call: redelivery is
//! the broker's business, driven by the message's dead-letter disposition.
//!
//! # Example
//!
//! ```rust,ignore
//! use touchline::sink::WebhookSink;
//! use std::time::Duration;
//!
//! let sink = WebhookSink::new("https://hooks.acme.example/touchline")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_header("X-Client", "acme-fc");
//! ```

use super::{envelope, DeliveryError, DeliveryOutcome, DeliveryProfile, DeliverySink};
use crate::event::ChampionshipEvent;
use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for webhook requests
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A sink that sends events to an HTTP webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    /// Target URL for the webhook
    url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout
    timeout: Duration,

    /// Extra request headers
    headers: Vec<(String, String)>,
}

impl WebhookSink {
    /// Create a new WebhookSink targeting the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            headers: Vec::new(),
        }
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a header sent with every request
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify(&self, error: reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::Timeout(self.timeout.as_millis() as u64)
        } else {
            DeliveryError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &ChampionshipEvent, profile: &DeliveryProfile) -> DeliveryOutcome {
        let payload = envelope(event, profile, chrono::Utc::now());

        debug!(
            url = %self.url,
            event_type = %profile.event_type,
            id_match = event.id_match,
            "Sending webhook"
        );

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&payload);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let started = Instant::now();
        let result = request.send().await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) if response.status().is_success() => {
                let status = response.status();
                info!(
                    url = %self.url,
                    status = %status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    event_type = %profile.event_type,
                    "Webhook delivered successfully"
                );
                DeliveryOutcome::delivered(Some(status.as_u16()), elapsed)
            }
            Ok(response) => {
                let status = response.status();
                warn!(
                    url = %self.url,
                    status = %status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    event_type = %profile.event_type,
                    "Webhook returned non-success status"
                );
                DeliveryOutcome::failed(DeliveryError::Status(status.as_u16()), elapsed)
            }
            Err(e) => {
                let error = self.classify(e);
                warn!(
                    url = %self.url,
                    category = error.category(),
                    error = %error,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Webhook request failed"
                );
                DeliveryOutcome::failed(error, elapsed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_builder() {
        let sink = WebhookSink::new("https://example.com/webhook")
            .with_timeout(Duration::from_secs(10))
            .with_header("X-Client", "acme-fc");

        assert_eq!(sink.url(), "https://example.com/webhook");
        assert_eq!(sink.timeout, Duration::from_secs(10));
        assert_eq!(sink.headers, vec![("X-Client".to_string(), "acme-fc".to_string())]);
    }

    #[test]
    fn test_default_timeout() {
        let sink = WebhookSink::new("https://example.com/webhook");
        assert_eq!(sink.timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unreachable_target_is_transport_failure() {
        // Port 9 (discard) on localhost is closed in test environments.
        let sink = WebhookSink::new("http://127.0.0.1:9/hook").with_timeout(Duration::from_secs(2));
        let event = ChampionshipEvent::new(1, 2, 3, chrono::Utc::now());
        let outcome = sink.deliver(&event, &DeliveryProfile::new("championship.event", "test")).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.status, None);
    }
}
