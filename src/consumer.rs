//! Message Consumer Pipeline.
//!
//! Every message received from a subscription walks one state machine and
//! ends in exactly one [`Disposition`]:
//!
//! ```text
//! Received ─▶ Revalidated ─┬─ irrelevant ─────────────────────────▶ Abandoned
//!                          └─ relevant ─▶ deserialize ─▶ deliver ─┬─ Completed
//!                                                                 └─ DeadLettered
//! ```
//!
//! [`MessagePipeline`] is the state machine itself: it takes a received
//! message and returns the disposition, touching nothing but the sink. That
//! keeps it testable without a broker. [`Processor`] is the loop around it:
//! receive one message, run the pipeline on its own task (so a panic still
//! yields `DeadLettered`), apply the disposition, repeat. One message is in
//! flight at a time.

use crate::broker::{BrokerError, MessageProperties, MessageReceiver, ReceivedMessage};
use crate::event::{keys, ChampionshipEvent};
use crate::filter::ServiceType;
use crate::metrics::{PipelineMetrics, PipelineSnapshot};
use crate::shutdown::ShutdownSignal;
use crate::sink::{DeliveryError, DeliveryProfile, DeliverySink};
use crate::trace::{self, SpanLineage};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Abandon reason for messages the local predicate rejects.
pub const IRRELEVANT_REASON: &str = "IrrelevantMessage";

/// Local relevance check, independent of the broker's filter rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relevance {
    /// Every message routed to the subscription is relevant.
    Any,
    /// Only messages whose `idSkill` property is in the set.
    Skills(BTreeSet<i64>),
}

impl Relevance {
    /// `Skills` over `ids`, or `Any` when `ids` is empty.
    pub fn skills(ids: impl IntoIterator<Item = i64>) -> Self {
        let ids: BTreeSet<i64> = ids.into_iter().collect();
        if ids.is_empty() {
            Relevance::Any
        } else {
            Relevance::Skills(ids)
        }
    }

    /// A missing or non-numeric `idSkill` is never relevant to a skill filter.
    pub fn accepts(&self, properties: &MessageProperties) -> bool {
        match self {
            Relevance::Any => true,
            Relevance::Skills(ids) => properties
                .get(keys::ID_SKILL)
                .and_then(|v| v.as_int())
                .is_some_and(|skill| ids.contains(&skill)),
        }
    }
}

/// What one consumer worker does with the messages of its subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerProfile {
    pub subscription: String,
    pub service_type: ServiceType,
    pub relevance: Relevance,
    pub delivery: DeliveryProfile,
}

impl ConsumerProfile {
    /// Shot detection: skill 4 only, tagged `championship.shots`.
    pub fn shots(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            service_type: ServiceType::Shots,
            relevance: Relevance::skills([4]),
            delivery: DeliveryProfile::new("championship.shots", "shots-pusher")
                .with_field("shotCount", 1)
                .with_field("analysisType", "shots_detection"),
        }
    }

    /// Plain event forwarding, tagged `championship.event`.
    pub fn events(subscription: impl Into<String>) -> Self {
        Self {
            subscription: subscription.into(),
            service_type: ServiceType::Collection,
            relevance: Relevance::Any,
            delivery: DeliveryProfile::new("championship.event", "events-pusher"),
        }
    }
}

/// Terminal state of one received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Abandoned { reason: String },
    DeadLettered { reason: String, description: String },
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Abandoned { .. } => "abandoned",
            Disposition::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Failures that end a message in the dead-letter channel.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("message body is not a valid event: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("unexpected fault: {0}")]
    UnexpectedFault(String),
}

impl ProcessError {
    /// Dead-letter reason code.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProcessError::Deserialization(_) => "DeserializationError",
            ProcessError::Delivery(_) => "DeliveryError",
            ProcessError::UnexpectedFault(_) => "UnexpectedFault",
        }
    }

    pub fn into_disposition(self) -> Disposition {
        Disposition::DeadLettered {
            reason: self.reason_code().to_string(),
            description: self.to_string(),
        }
    }
}

/// The per-message state machine.
pub struct MessagePipeline {
    sink: Arc<dyn DeliverySink>,
    profile: ConsumerProfile,
    metrics: Arc<PipelineMetrics>,
}

impl MessagePipeline {
    pub fn new(sink: Arc<dyn DeliverySink>, profile: ConsumerProfile) -> Self {
        Self {
            sink,
            profile,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn profile(&self) -> &ConsumerProfile {
        &self.profile
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Decide the disposition of one message.
    ///
    /// Runs inside a `process_message` span that continues the publisher's
    /// trace when the message carries one, and starts a new trace otherwise.
    pub async fn process(&self, message: &ReceivedMessage) -> Disposition {
        let lineage = lineage_for(message);
        let span = info_span!(
            "process_message",
            subscription = %self.profile.subscription,
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            trace_id = %lineage.context.trace_id,
            span_id = %lineage.context.span_id,
            parent_span_id = %lineage.parent_display(),
        );

        async {
            if lineage.is_root() {
                debug!("No trace context on message, started a new trace");
            }
            let disposition = self.decide(message).await;
            self.record(&disposition);
            disposition
        }
        .instrument(span)
        .await
    }

    async fn decide(&self, message: &ReceivedMessage) -> Disposition {
        self.metrics.record_received();

        if !self.profile.relevance.accepts(&message.properties) {
            debug!(
                id_skill = ?message.property(keys::ID_SKILL),
                "Message not relevant for this consumer, abandoning"
            );
            return Disposition::Abandoned {
                reason: IRRELEVANT_REASON.to_string(),
            };
        }

        match self.deliver(message).await {
            Ok(()) => Disposition::Completed,
            Err(e) => {
                warn!(reason = e.reason_code(), error = %e, "Message processing failed");
                e.into_disposition()
            }
        }
    }

    async fn deliver(&self, message: &ReceivedMessage) -> Result<(), ProcessError> {
        let event: ChampionshipEvent = serde_json::from_slice(&message.body)?;
        debug!(
            id_championship = event.id_championship,
            id_match = event.id_match,
            id_skill = event.id_skill,
            "Delivering event"
        );

        let outcome = self.sink.deliver(&event, &self.profile.delivery).await;
        self.metrics.record_delivery(outcome.elapsed);
        match outcome.error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    fn record(&self, disposition: &Disposition) {
        match disposition {
            Disposition::Completed => self.metrics.record_completed(),
            Disposition::Abandoned { .. } => self.metrics.record_abandoned(),
            Disposition::DeadLettered { .. } => self.metrics.record_dead_lettered(),
        }
    }
}

/// Span ids for processing `message`: a child of the publisher's span when
/// the message carries a trace context, a new root otherwise.
pub fn lineage_for(message: &ReceivedMessage) -> SpanLineage {
    SpanLineage::continue_from(trace::decode(&message.properties).as_ref())
}

/// Apply a disposition with exactly one broker call.
pub async fn settle(
    receiver: &dyn MessageReceiver,
    message: &ReceivedMessage,
    disposition: &Disposition,
) -> Result<(), BrokerError> {
    match disposition {
        Disposition::Completed => receiver.complete(message).await,
        Disposition::Abandoned { .. } => receiver.abandon(message).await,
        Disposition::DeadLettered { reason, description } => {
            receiver.dead_letter(message, reason, description).await
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Receive loop for one subscription, one message at a time.
pub struct Processor {
    receiver: Arc<dyn MessageReceiver>,
    pipeline: Arc<MessagePipeline>,
    receive_wait: Duration,
    error_backoff: Duration,
    stats_every: u64,
}

impl Processor {
    pub fn new(receiver: Arc<dyn MessageReceiver>, pipeline: Arc<MessagePipeline>) -> Self {
        Self {
            receiver,
            pipeline,
            receive_wait: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
            stats_every: 100,
        }
    }

    /// Longest a single receive call blocks.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Pause after a failed receive.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Log statistics every `n` messages (0 disables).
    pub fn with_stats_every(mut self, n: u64) -> Self {
        self.stats_every = n;
        self
    }

    /// Run the pipeline on its own task; a panic becomes `UnexpectedFault`.
    async fn run_pipeline(&self, message: &ReceivedMessage) -> Disposition {
        let pipeline = Arc::clone(&self.pipeline);
        let owned = message.clone();
        match tokio::spawn(async move { pipeline.process(&owned).await }).await {
            Ok(disposition) => disposition,
            Err(join_error) => {
                let detail = if join_error.is_panic() {
                    panic_message(join_error.into_panic().as_ref())
                } else {
                    join_error.to_string()
                };
                error!(
                    subscription = %self.receiver.subscription(),
                    message_id = %message.message_id,
                    error = %detail,
                    "Pipeline crashed, dead-lettering message"
                );
                self.pipeline.metrics().record_dead_lettered();
                ProcessError::UnexpectedFault(detail).into_disposition()
            }
        }
    }

    /// Process a single received message through to its settlement.
    pub async fn handle(&self, message: ReceivedMessage) -> Disposition {
        let disposition = self.run_pipeline(&message).await;
        match settle(self.receiver.as_ref(), &message, &disposition).await {
            Ok(()) => debug!(
                message_id = %message.message_id,
                disposition = disposition.as_str(),
                "Message settled"
            ),
            Err(e) => {
                // The lock will lapse and the broker redelivers.
                self.pipeline.metrics().record_settle_failure();
                error!(
                    message_id = %message.message_id,
                    disposition = disposition.as_str(),
                    error = %e,
                    "Failed to settle message"
                );
            }
        }
        disposition
    }

    /// Receive and process until `shutdown` fires.
    ///
    /// A message already received when shutdown fires is still processed
    /// and settled; no new message is received afterwards.
    pub async fn run(self, shutdown: ShutdownSignal) -> PipelineSnapshot {
        let subscription = self.receiver.subscription().to_string();
        info!(subscription = %subscription, "Listening for messages");

        let mut handled: u64 = 0;
        while !shutdown.is_shutdown() {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.receiver.receive(self.receive_wait) => result,
            };

            match received {
                Ok(Some(message)) => {
                    self.handle(message).await;
                    handled += 1;
                    if self.stats_every > 0 && handled % self.stats_every == 0 {
                        let stats = self.pipeline.metrics().snapshot();
                        info!(
                            subscription = %subscription,
                            received = stats.received,
                            completed = stats.completed,
                            abandoned = stats.abandoned,
                            dead_lettered = stats.dead_lettered,
                            mean_delivery_ms = stats.mean_delivery_ms,
                            "Processor statistics"
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(subscription = %subscription, error = %e, "Receive failed, backing off");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        let stats = self.pipeline.metrics().snapshot();
        info!(
            subscription = %subscription,
            received = stats.received,
            completed = stats.completed,
            abandoned = stats.abandoned,
            dead_lettered = stats.dead_lettered,
            "Processor stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PropertyValue;
    use crate::sink::DeliveryOutcome;
    use crate::trace::{TraceContext, TRACEPARENT};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    /// Records every delivery and answers with a fixed outcome.
    struct ScriptedSink {
        fail_with: Option<DeliveryError>,
        calls: Mutex<Vec<ChampionshipEvent>>,
    }

    impl ScriptedSink {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_with: None,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: DeliveryError) -> Arc<Self> {
            Arc::new(Self {
                fail_with: Some(error),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliverySink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn deliver(&self, event: &ChampionshipEvent, _profile: &DeliveryProfile) -> DeliveryOutcome {
            self.calls.lock().unwrap().push(event.clone());
            match &self.fail_with {
                None => DeliveryOutcome::delivered(Some(200), Duration::from_millis(1)),
                Some(e) => DeliveryOutcome::failed(e.clone(), Duration::from_millis(1)),
            }
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl DeliverySink for PanickingSink {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn deliver(&self, _event: &ChampionshipEvent, _profile: &DeliveryProfile) -> DeliveryOutcome {
            panic!("sink exploded");
        }
    }

    fn message(skill: i64, body: &[u8]) -> ReceivedMessage {
        let mut properties = MessageProperties::new();
        properties.insert(keys::ID_SKILL.into(), PropertyValue::Int(skill));
        ReceivedMessage {
            message_id: "m-1".into(),
            body: body.to_vec(),
            properties,
            delivery_count: 1,
            lock_token: "lock-1".into(),
            enqueued_at: chrono::Utc::now(),
        }
    }

    fn valid_body(skill: i64) -> Vec<u8> {
        serde_json::to_vec(&ChampionshipEvent::new(10, 55, skill, chrono::Utc::now())).unwrap()
    }

    #[test]
    fn test_relevance() {
        let shots = Relevance::skills([4]);
        assert!(shots.accepts(&message(4, b"").properties));
        assert!(!shots.accepts(&message(3, b"").properties));
        assert!(!shots.accepts(&MessageProperties::new()));

        let mut textual = MessageProperties::new();
        textual.insert(keys::ID_SKILL.into(), PropertyValue::from("4"));
        assert!(!shots.accepts(&textual));

        assert_eq!(Relevance::skills([]), Relevance::Any);
        assert!(Relevance::Any.accepts(&MessageProperties::new()));
    }

    #[tokio::test]
    async fn test_relevant_and_delivered_completes() {
        let sink = ScriptedSink::ok();
        let pipeline = MessagePipeline::new(sink.clone(), ConsumerProfile::shots("acme-fc-finalizacao"));

        let disposition = pipeline.process(&message(4, &valid_body(4))).await;
        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(sink.calls(), 1);
        assert_eq!(pipeline.metrics().snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_irrelevant_is_abandoned_without_delivery() {
        let sink = ScriptedSink::ok();
        let pipeline = MessagePipeline::new(sink.clone(), ConsumerProfile::shots("acme-fc-finalizacao"));

        let disposition = pipeline.process(&message(3, &valid_body(3))).await;
        assert_eq!(
            disposition,
            Disposition::Abandoned {
                reason: IRRELEVANT_REASON.to_string()
            }
        );
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn test_bad_body_is_dead_lettered() {
        let sink = ScriptedSink::ok();
        let pipeline = MessagePipeline::new(sink.clone(), ConsumerProfile::shots("s"));

        match pipeline.process(&message(4, b"{not json")).await {
            Disposition::DeadLettered { reason, .. } => assert_eq!(reason, "DeserializationError"),
            other => panic!("unexpected disposition: {other:?}"),
        }
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_dead_lettered() {
        for error in [
            DeliveryError::Status(500),
            DeliveryError::Timeout(30_000),
            DeliveryError::Transport("connection refused".into()),
        ] {
            let pipeline = MessagePipeline::new(ScriptedSink::failing(error.clone()), ConsumerProfile::events("s"));
            match pipeline.process(&message(4, &valid_body(4))).await {
                Disposition::DeadLettered { reason, description } => {
                    assert_eq!(reason, "DeliveryError");
                    assert!(description.contains(&error.to_string()));
                }
                other => panic!("unexpected disposition: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_broker_filter_and_local_check_are_independent() {
        // Skill 4 never passes the finalizacao rule, but a shots consumer
        // that receives it anyway accepts it.
        let rule = crate::filter::FilterRule::for_service(&ServiceType::Shots, &BTreeSet::from([10])).unwrap();
        let mut msg = message(4, &valid_body(4));
        msg.properties.insert(keys::ID_CHAMPIONSHIP.into(), PropertyValue::Int(10));
        msg.properties.insert(keys::EVENT_TYPE.into(), PropertyValue::from("ChampionshipData"));
        assert!(!rule.matches(&msg.properties));

        let pipeline = MessagePipeline::new(ScriptedSink::ok(), ConsumerProfile::shots("s"));
        assert_eq!(pipeline.process(&msg).await, Disposition::Completed);
    }

    #[tokio::test]
    async fn test_process_accepts_trace_context() {
        let parent = TraceContext::new_root();
        let mut msg = message(4, &valid_body(4));
        msg.properties.insert(TRACEPARENT.into(), PropertyValue::from(parent.traceparent()));

        let pipeline = MessagePipeline::new(ScriptedSink::ok(), ConsumerProfile::shots("s"));
        assert_eq!(pipeline.process(&msg).await, Disposition::Completed);

        msg.properties.insert(TRACEPARENT.into(), PropertyValue::from("garbage"));
        assert_eq!(pipeline.process(&msg).await, Disposition::Completed);
    }

    /// Fields of every `process_message` span opened while installed.
    #[derive(Clone, Default)]
    struct ProcessSpans(Arc<Mutex<Vec<BTreeMap<String, String>>>>);

    #[derive(Default)]
    struct FieldMap(BTreeMap<String, String>);

    impl tracing::field::Visit for FieldMap {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{:?}", value));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ProcessSpans {
        fn on_new_span(
            &self,
            attrs: &tracing::span::Attributes<'_>,
            _id: &tracing::span::Id,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if attrs.metadata().name() == "process_message" {
                let mut fields = FieldMap::default();
                attrs.record(&mut fields);
                self.0.lock().unwrap().push(fields.0);
            }
        }
    }

    #[tokio::test]
    async fn test_process_span_is_child_of_publisher_span() {
        let spans = ProcessSpans::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));

        let parent = TraceContext::new_root();
        let mut msg = message(4, &valid_body(4));
        msg.properties.insert(TRACEPARENT.into(), PropertyValue::from(parent.traceparent()));

        let pipeline = MessagePipeline::new(ScriptedSink::ok(), ConsumerProfile::shots("s"));
        pipeline.process(&msg).await;
        pipeline.process(&message(4, &valid_body(4))).await;

        let recorded = spans.0.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0]["trace_id"], parent.trace_id.to_string());
        assert_eq!(recorded[0]["parent_span_id"], parent.span_id.to_string());
        assert_ne!(recorded[0]["span_id"], parent.span_id.to_string());

        assert_ne!(recorded[1]["trace_id"], parent.trace_id.to_string());
        assert_eq!(recorded[1]["parent_span_id"], "");
    }

    #[test]
    fn test_lineage_for_message() {
        let parent = TraceContext::new_root();
        let mut msg = message(4, b"");
        assert!(lineage_for(&msg).is_root());

        msg.properties.insert(TRACEPARENT.into(), PropertyValue::from(parent.traceparent()));
        let lineage = lineage_for(&msg);
        assert_eq!(lineage.context.trace_id, parent.trace_id);
        assert_eq!(lineage.parent_span_id, Some(parent.span_id));
    }

    #[test]
    fn test_reason_codes() {
        let bad_json = serde_json::from_str::<ChampionshipEvent>("x").unwrap_err();
        assert_eq!(ProcessError::from(bad_json).reason_code(), "DeserializationError");
        assert_eq!(ProcessError::from(DeliveryError::Status(502)).reason_code(), "DeliveryError");
        assert_eq!(ProcessError::UnexpectedFault("boom".into()).reason_code(), "UnexpectedFault");
    }

    /// Receiver that records settlements instead of talking to a broker.
    #[derive(Default)]
    struct RecordingReceiver {
        settled: Mutex<Vec<String>>,
        refuse: bool,
    }

    #[async_trait]
    impl MessageReceiver for RecordingReceiver {
        async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BrokerError> {
            tokio::time::sleep(max_wait).await;
            Ok(None)
        }

        async fn complete(&self, _m: &ReceivedMessage) -> Result<(), BrokerError> {
            self.record("complete")
        }

        async fn abandon(&self, _m: &ReceivedMessage) -> Result<(), BrokerError> {
            self.record("abandon")
        }

        async fn dead_letter(&self, _m: &ReceivedMessage, reason: &str, _d: &str) -> Result<(), BrokerError> {
            self.record(&format!("dead_letter:{reason}"))
        }

        fn subscription(&self) -> &str {
            "test"
        }
    }

    impl RecordingReceiver {
        fn record(&self, call: &str) -> Result<(), BrokerError> {
            self.settled.lock().unwrap().push(call.to_string());
            if self.refuse {
                Err(BrokerError::NotFound("lock lost".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_unexpected_fault() {
        let receiver = Arc::new(RecordingReceiver::default());
        let pipeline = Arc::new(MessagePipeline::new(Arc::new(PanickingSink), ConsumerProfile::events("s")));
        let processor = Processor::new(receiver.clone(), pipeline.clone());

        let disposition = processor.handle(message(4, &valid_body(4))).await;
        match disposition {
            Disposition::DeadLettered { reason, description } => {
                assert_eq!(reason, "UnexpectedFault");
                assert!(description.contains("sink exploded"));
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
        assert_eq!(*receiver.settled.lock().unwrap(), vec!["dead_letter:UnexpectedFault"]);
        assert_eq!(pipeline.metrics().snapshot().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_exactly_one_settlement_per_message() {
        let receiver = Arc::new(RecordingReceiver::default());
        let pipeline = Arc::new(MessagePipeline::new(ScriptedSink::ok(), ConsumerProfile::shots("s")));
        let processor = Processor::new(receiver.clone(), pipeline);

        processor.handle(message(4, &valid_body(4))).await;
        processor.handle(message(9, &valid_body(9))).await;
        processor.handle(message(4, b"[]")).await;

        assert_eq!(
            *receiver.settled.lock().unwrap(),
            vec!["complete", "abandon", "dead_letter:DeserializationError"]
        );
    }

    #[tokio::test]
    async fn test_settle_failure_is_counted_not_fatal() {
        let receiver = Arc::new(RecordingReceiver {
            refuse: true,
            ..Default::default()
        });
        let pipeline = Arc::new(MessagePipeline::new(ScriptedSink::ok(), ConsumerProfile::shots("s")));
        let processor = Processor::new(receiver, pipeline.clone());

        assert_eq!(processor.handle(message(4, &valid_body(4))).await, Disposition::Completed);
        assert_eq!(pipeline.metrics().snapshot().settle_failures, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let receiver = Arc::new(RecordingReceiver::default());
        let pipeline = Arc::new(MessagePipeline::new(ScriptedSink::ok(), ConsumerProfile::shots("s")));
        let processor = Processor::new(receiver, pipeline).with_receive_wait(Duration::from_millis(10));

        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(processor.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.trigger();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.received, 0);
    }
}
