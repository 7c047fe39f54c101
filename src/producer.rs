//! Message Producer.
//!
//! Publishes a [`ChampionshipEvent`] to the shared topic exactly once:
//! validate, serialize, stamp routing attributes and the trace context of
//! the publish span, send. Transport failures are returned, never retried
//! here; the caller owns retry policy and can deduplicate on the message id
//! in the receipt or error.

use crate::broker::{BrokerError, OutboundMessage, TopicPublisher};
use crate::event::{ChampionshipEvent, EventKind, ProducerIdentity, ValidationError};
use crate::metrics::PublisherMetrics;
use crate::trace::{self, SpanLineage, TraceContext};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};

/// Undelivered messages are discarded by the broker after this long.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The send failed; the message may or may not have reached the topic.
    #[error("publish of message {message_id} failed: {source}")]
    Broker {
        message_id: String,
        #[source]
        source: BrokerError,
    },
}

/// What the caller gets back from a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    /// Context of the publish span, as stamped on the message.
    pub trace: TraceContext,
}

/// Publishes championship events to one topic.
#[derive(Clone)]
pub struct EventPublisher {
    sender: Arc<dyn TopicPublisher>,
    topic: String,
    identity: ProducerIdentity,
    time_to_live: Duration,
    metrics: Arc<PublisherMetrics>,
}

impl EventPublisher {
    pub fn new(sender: Arc<dyn TopicPublisher>, topic: impl Into<String>, identity: ProducerIdentity) -> Self {
        Self {
            sender,
            topic: topic.into(),
            identity,
            time_to_live: DEFAULT_MESSAGE_TTL,
            metrics: Arc::new(PublisherMetrics::new()),
        }
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = ttl;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PublisherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<PublisherMetrics> {
        &self.metrics
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Build the broker message for `event` inside the publish span `lineage`.
    fn build_message(
        &self,
        event: &ChampionshipEvent,
        lineage: &SpanLineage,
    ) -> Result<OutboundMessage, PublishError> {
        let body = serde_json::to_vec(event)?;
        let mut properties = event.routing_attributes(EventKind::ChampionshipData, &self.identity);
        trace::inject(&lineage.context, &mut properties);

        Ok(OutboundMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            body,
            time_to_live: self.time_to_live,
            properties,
        })
    }

    /// Publish one event.
    ///
    /// `parent` is the caller's trace context (e.g. from an inbound
    /// `traceparent` header); without one the publish span starts a trace.
    pub async fn publish(
        &self,
        event: &ChampionshipEvent,
        parent: Option<&TraceContext>,
    ) -> Result<PublishReceipt, PublishError> {
        if let Err(e) = event.validate() {
            self.metrics.record_rejected();
            return Err(e.into());
        }

        let lineage = SpanLineage::continue_from(parent);
        let message = self.build_message(event, &lineage).inspect_err(|_| self.metrics.record_failed())?;
        let message_id = message.message_id.clone();

        let span = info_span!(
            "publish_event",
            message_id = %message_id,
            trace_id = %lineage.context.trace_id,
            span_id = %lineage.context.span_id,
            parent_span_id = %lineage.parent_display(),
        );

        async {
            match self.sender.send(&self.topic, message).await {
                Ok(()) => {
                    self.metrics.record_published();
                    info!(
                        topic = %self.topic,
                        id_championship = event.id_championship,
                        id_match = event.id_match,
                        id_skill = event.id_skill,
                        "Event published"
                    );
                    Ok(PublishReceipt {
                        message_id: message_id.clone(),
                        trace: lineage.context.clone(),
                    })
                }
                Err(source) => {
                    self.metrics.record_failed();
                    error!(topic = %self.topic, error = %source, "Event publish failed");
                    Err(PublishError::Broker {
                        message_id: message_id.clone(),
                        source,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }
}
