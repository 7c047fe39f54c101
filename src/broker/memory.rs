//! In-process broker.
//!
//! Behaves like the real thing where Touchline cares: rule-based fan-out,
//! peek-lock with lock expiry, delivery counting, message TTL and a
//! dead-letter side channel per subscription. Topics spring into existence
//! on first use.

use super::{
    BrokerError, DeadLetter, MessageProperties, MessageReceiver, OutboundMessage,
    ReceivedMessage, RuleSwap, SubscriptionAdmin, SubscriptionOptions, TopicPublisher,
    MAX_DELIVERY_REASON,
};
use crate::filter::FilterRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Upper bound on one wait inside `receive`, so expiring locks are noticed.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// Dead letters kept per subscription; the oldest are dropped beyond this.
pub const DEAD_LETTER_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Vec<u8>,
    properties: MessageProperties,
    enqueued_at: DateTime<Utc>,
    expires_at: Instant,
    /// Deliveries handed out so far.
    delivery_count: u32,
}

struct Lock {
    message: StoredMessage,
    until: Instant,
}

struct SubscriptionState {
    options: SubscriptionOptions,
    rules: BTreeMap<String, FilterRule>,
    queue: VecDeque<StoredMessage>,
    locked: HashMap<String, Lock>,
    dead_letters: VecDeque<DeadLetter>,
    dead_letter_limit: usize,
    dead_letter_seq: u64,
}

impl SubscriptionState {
    fn new(options: SubscriptionOptions, dead_letter_limit: usize) -> Self {
        let mut rules = BTreeMap::new();
        let default_rule = FilterRule::catch_all();
        rules.insert(default_rule.name.clone(), default_rule);
        Self {
            options,
            rules,
            queue: VecDeque::new(),
            locked: HashMap::new(),
            dead_letters: VecDeque::new(),
            dead_letter_limit,
            dead_letter_seq: 0,
        }
    }

    fn accepts(&self, properties: &MessageProperties) -> bool {
        self.rules.values().any(|rule| rule.matches(properties))
    }

    /// Return messages whose lock ran out to the head of the queue.
    fn release_expired_locks(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, lock)| lock.until <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(lock) = self.locked.remove(&token) {
                debug!(message_id = %lock.message.message_id, "Lock expired, message returned");
                self.queue.push_front(lock.message);
            }
        }
    }

    fn dead_letter(&mut self, message: &StoredMessage, reason: &str, description: &str) {
        let received = to_received(message, String::new());
        let entry = DeadLetter::from_message(self.dead_letter_seq.to_string(), &received, reason, description);
        self.dead_letter_seq += 1;
        self.dead_letters.push_back(entry);
        while self.dead_letters.len() > self.dead_letter_limit {
            self.dead_letters.pop_front();
        }
    }

    /// Next deliverable message, locked for the subscription's lock duration.
    fn take_next(&mut self, subscription: &str) -> Option<ReceivedMessage> {
        let now = Instant::now();
        self.release_expired_locks(now);

        while let Some(mut message) = self.queue.pop_front() {
            if message.expires_at <= now {
                debug!(subscription = %subscription, message_id = %message.message_id, "Message expired");
                continue;
            }
            if message.delivery_count >= self.options.max_delivery_count {
                warn!(
                    subscription = %subscription,
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    "Max delivery count reached, dead-lettering"
                );
                let description = format!(
                    "Message could not be consumed after {} delivery attempts",
                    message.delivery_count
                );
                self.dead_letter(&message, MAX_DELIVERY_REASON, &description);
                continue;
            }

            message.delivery_count += 1;
            let token = uuid::Uuid::new_v4().to_string();
            let received = to_received(&message, token.clone());
            self.locked.insert(
                token,
                Lock {
                    message,
                    until: now + self.options.lock_duration,
                },
            );
            return Some(received);
        }
        None
    }

    fn unlock(&mut self, lock_token: &str) -> Result<StoredMessage, BrokerError> {
        self.locked
            .remove(lock_token)
            .map(|lock| lock.message)
            .ok_or_else(|| BrokerError::NotFound(format!("lock {} lost or expired", lock_token)))
    }
}

fn to_received(message: &StoredMessage, lock_token: String) -> ReceivedMessage {
    ReceivedMessage {
        message_id: message.message_id.clone(),
        body: message.body.clone(),
        properties: message.properties.clone(),
        delivery_count: message.delivery_count,
        lock_token,
        enqueued_at: message.enqueued_at,
    }
}

#[derive(Default)]
struct State {
    /// topic -> subscription -> state
    topics: HashMap<String, BTreeMap<String, SubscriptionState>>,
    /// Overrides [`DEAD_LETTER_LIMIT`] for subscriptions created afterwards.
    dead_letter_limit: Option<usize>,
}

impl State {
    fn subscription(&mut self, topic: &str, subscription: &str) -> Result<&mut SubscriptionState, BrokerError> {
        self.topics
            .get_mut(topic)
            .and_then(|subs| subs.get_mut(subscription))
            .ok_or_else(|| BrokerError::NotFound(format!("subscription {}/{}", topic, subscription)))
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    arrivals: Notify,
}

/// Broker kept entirely in memory. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` dead letters per subscription.
    pub fn with_dead_letter_limit(self, limit: usize) -> Self {
        self.state().dead_letter_limit = Some(limit);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Peek-lock receiver on one subscription.
    pub fn receiver(&self, topic: &str, subscription: &str) -> InMemoryReceiver {
        InMemoryReceiver {
            broker: self.clone(),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
        }
    }

    /// Subscription names on a topic.
    pub fn subscriptions(&self, topic: &str) -> Vec<String> {
        self.state()
            .topics
            .get(topic)
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Rules installed on a subscription, by name.
    pub fn rules(&self, topic: &str, subscription: &str) -> Vec<FilterRule> {
        self.state()
            .subscription(topic, subscription)
            .map(|sub| sub.rules.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages waiting or locked on a subscription.
    pub fn pending(&self, topic: &str, subscription: &str) -> usize {
        self.state()
            .subscription(topic, subscription)
            .map(|sub| sub.queue.len() + sub.locked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SubscriptionAdmin for InMemoryBroker {
    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BrokerError> {
        Ok(self.state().subscription(topic, subscription).is_ok())
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        let limit = state.dead_letter_limit.unwrap_or(DEAD_LETTER_LIMIT);
        let subs = state.topics.entry(topic.to_string()).or_default();
        if subs.contains_key(subscription) {
            return Err(BrokerError::AlreadyExists(format!("subscription {}/{}", topic, subscription)));
        }
        subs.insert(subscription.to_string(), SubscriptionState::new(options.clone(), limit));
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        state
            .topics
            .get_mut(topic)
            .and_then(|subs| subs.remove(subscription))
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("subscription {}/{}", topic, subscription)))
    }

    async fn rule_names(&self, topic: &str, subscription: &str) -> Result<Vec<String>, BrokerError> {
        let mut state = self.state();
        Ok(state.subscription(topic, subscription)?.rules.keys().cloned().collect())
    }

    async fn create_rule(&self, topic: &str, subscription: &str, rule: &FilterRule) -> Result<(), BrokerError> {
        let mut state = self.state();
        let sub = state.subscription(topic, subscription)?;
        if sub.rules.contains_key(&rule.name) {
            return Err(BrokerError::AlreadyExists(format!("rule {}", rule.name)));
        }
        sub.rules.insert(rule.name.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, topic: &str, subscription: &str, rule_name: &str) -> Result<(), BrokerError> {
        let mut state = self.state();
        state
            .subscription(topic, subscription)?
            .rules
            .remove(rule_name)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("rule {}", rule_name)))
    }

    async fn replace_rules(
        &self,
        topic: &str,
        subscription: &str,
        rule: &FilterRule,
    ) -> Result<RuleSwap, BrokerError> {
        let mut state = self.state();
        let sub = state.subscription(topic, subscription)?;
        sub.rules.clear();
        sub.rules.insert(rule.name.clone(), rule.clone());
        Ok(RuleSwap::Atomic)
    }

    async fn dead_letters(
        &self,
        topic: &str,
        subscription: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, BrokerError> {
        let mut state = self.state();
        let letters = &state.subscription(topic, subscription)?.dead_letters;
        let skip = letters.len().saturating_sub(limit);
        Ok(letters.iter().skip(skip).cloned().collect())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl TopicPublisher for InMemoryBroker {
    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let now = Instant::now();
        let enqueued_at = Utc::now();
        let mut copies = 0usize;
        {
            let mut state = self.state();
            let subs = state.topics.entry(topic.to_string()).or_default();
            for sub in subs.values_mut() {
                if !sub.accepts(&message.properties) {
                    continue;
                }
                let ttl = message.time_to_live.min(sub.options.default_message_ttl);
                sub.queue.push_back(StoredMessage {
                    message_id: message.message_id.clone(),
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    enqueued_at,
                    expires_at: now + ttl,
                    delivery_count: 0,
                });
                copies += 1;
            }
        }
        debug!(topic = %topic, message_id = %message.message_id, copies, "Message fanned out");
        self.inner.arrivals.notify_waiters();
        Ok(())
    }
}

/// Peek-lock receiver on an [`InMemoryBroker`] subscription.
#[derive(Clone)]
pub struct InMemoryReceiver {
    broker: InMemoryBroker,
    topic: String,
    subscription: String,
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BrokerError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let arrival = self.broker.inner.arrivals.notified();
            {
                let mut state = self.broker.state();
                let sub = state.subscription(&self.topic, &self.subscription)?;
                if let Some(message) = sub.take_next(&self.subscription) {
                    return Ok(Some(message));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_SLICE);
            let _ = tokio::time::timeout(wait, arrival).await;
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        state
            .subscription(&self.topic, &self.subscription)?
            .unlock(&message.lock_token)
            .map(|_| ())
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        {
            let mut state = self.broker.state();
            let sub = state.subscription(&self.topic, &self.subscription)?;
            let stored = sub.unlock(&message.lock_token)?;
            sub.queue.push_front(stored);
        }
        self.broker.inner.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state();
        let sub = state.subscription(&self.topic, &self.subscription)?;
        let stored = sub.unlock(&message.lock_token)?;
        sub.dead_letter(&stored, reason, description);
        Ok(())
    }

    fn subscription(&self) -> &str {
        &self.subscription
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PropertyValue;
    use crate::filter::FilterExpr;

    const TOPIC: &str = "championship-events";

    fn message(id: &str, skill: i64) -> OutboundMessage {
        let mut properties = MessageProperties::new();
        properties.insert("idChampionship".into(), PropertyValue::Int(10));
        properties.insert("idSkill".into(), PropertyValue::Int(skill));
        OutboundMessage {
            message_id: id.to_string(),
            content_type: "application/json".to_string(),
            body: b"{}".to_vec(),
            time_to_live: Duration::from_secs(60),
            properties,
        }
    }

    fn skill_rule(skill: i64) -> FilterRule {
        FilterRule::new("skill-filter", FilterExpr::equals("idSkill", skill))
    }

    #[tokio::test]
    async fn test_new_subscription_has_default_rule() {
        let broker = InMemoryBroker::new();
        broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await.unwrap();
        assert_eq!(broker.rule_names(TOPIC, "a").await.unwrap(), vec!["$Default"]);

        let err = broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await;
        assert!(matches!(err, Err(BrokerError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_fan_out_by_rule() {
        let broker = InMemoryBroker::new();
        for sub in ["shots", "all", "none"] {
            broker.create_subscription(TOPIC, sub, &SubscriptionOptions::default()).await.unwrap();
        }
        broker.replace_rules(TOPIC, "shots", &skill_rule(4)).await.unwrap();
        broker.replace_rules(TOPIC, "none", &skill_rule(99)).await.unwrap();

        broker.send(TOPIC, message("m1", 4)).await.unwrap();
        broker.send(TOPIC, message("m2", 7)).await.unwrap();

        assert_eq!(broker.pending(TOPIC, "shots"), 1);
        assert_eq!(broker.pending(TOPIC, "all"), 2);
        assert_eq!(broker.pending(TOPIC, "none"), 0);
    }

    #[tokio::test]
    async fn test_receive_complete() {
        let broker = InMemoryBroker::new();
        broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await.unwrap();
        broker.send(TOPIC, message("m1", 4)).await.unwrap();

        let receiver = broker.receiver(TOPIC, "a");
        let received = receiver.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(received.message_id, "m1");
        assert_eq!(received.delivery_count, 1);

        // Locked, so not handed out twice.
        assert!(receiver.receive(Duration::from_millis(10)).await.unwrap().is_none());

        receiver.complete(&received).await.unwrap();
        assert_eq!(broker.pending(TOPIC, "a"), 0);
        assert!(receiver.complete(&received).await.is_err());
    }

    #[tokio::test]
    async fn test_abandon_redelivers_with_higher_count() {
        let broker = InMemoryBroker::new();
        broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await.unwrap();
        broker.send(TOPIC, message("m1", 4)).await.unwrap();

        let receiver = broker.receiver(TOPIC, "a");
        let first = receiver.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        receiver.abandon(&first).await.unwrap();

        let second = receiver.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.message_id, "m1");
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_max_delivery_dead_letters() {
        let broker = InMemoryBroker::new();
        let options = SubscriptionOptions {
            max_delivery_count: 2,
            ..SubscriptionOptions::default()
        };
        broker.create_subscription(TOPIC, "a", &options).await.unwrap();
        broker.send(TOPIC, message("m1", 4)).await.unwrap();

        let receiver = broker.receiver(TOPIC, "a");
        for _ in 0..2 {
            let m = receiver.receive(Duration::from_millis(10)).await.unwrap().unwrap();
            receiver.abandon(&m).await.unwrap();
        }
        assert!(receiver.receive(Duration::from_millis(10)).await.unwrap().is_none());

        let letters = broker.dead_letters(TOPIC, "a", 10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, MAX_DELIVERY_REASON);
        assert_eq!(letters[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_lock_expiry_returns_message() {
        let broker = InMemoryBroker::new();
        let options = SubscriptionOptions {
            lock_duration: Duration::from_millis(20),
            ..SubscriptionOptions::default()
        };
        broker.create_subscription(TOPIC, "a", &options).await.unwrap();
        broker.send(TOPIC, message("m1", 4)).await.unwrap();

        let receiver = broker.receiver(TOPIC, "a");
        let first = receiver.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        let again = receiver.receive(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(again.message_id, "m1");
        assert_eq!(again.delivery_count, 2);

        // The stale lock can no longer settle.
        assert!(receiver.complete(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_message_is_dropped() {
        let broker = InMemoryBroker::new();
        broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await.unwrap();
        let mut short = message("m1", 4);
        short.time_to_live = Duration::from_millis(1);
        broker.send(TOPIC, short).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let receiver = broker.receiver(TOPIC, "a");
        assert!(receiver.receive(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await.unwrap();
        let receiver = broker.receiver(TOPIC, "a");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.send(TOPIC, message("late", 4)).await.unwrap();
        });

        let received = receiver.receive(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(received.message_id, "late");
    }

    #[tokio::test]
    async fn test_dead_letter_with_reason() {
        let broker = InMemoryBroker::new();
        broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await.unwrap();
        broker.send(TOPIC, message("m1", 4)).await.unwrap();

        let receiver = broker.receiver(TOPIC, "a");
        let m = receiver.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        receiver.dead_letter(&m, "DeliveryError", "HTTP 500").await.unwrap();

        let letters = broker.dead_letters(TOPIC, "a", 10).await.unwrap();
        assert_eq!(letters[0].reason, "DeliveryError");
        assert_eq!(letters[0].description, "HTTP 500");
        assert_eq!(broker.pending(TOPIC, "a"), 0);
    }

    #[tokio::test]
    async fn test_dead_letters_are_capped() {
        let broker = InMemoryBroker::new().with_dead_letter_limit(3);
        broker.create_subscription(TOPIC, "a", &SubscriptionOptions::default()).await.unwrap();
        let receiver = broker.receiver(TOPIC, "a");

        for i in 0..5 {
            broker.send(TOPIC, message(&format!("m{i}"), 4)).await.unwrap();
            let m = receiver.receive(Duration::from_millis(10)).await.unwrap().unwrap();
            receiver.dead_letter(&m, "DeliveryError", "HTTP 500").await.unwrap();
        }

        let letters = broker.dead_letters(TOPIC, "a", 10).await.unwrap();
        let ids: Vec<&str> = letters.iter().map(|l| l.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
        assert_eq!(letters[2].id, "4");
    }

    #[tokio::test]
    async fn test_delete_missing_subscription() {
        let broker = InMemoryBroker::new();
        let err = broker.delete_subscription(TOPIC, "ghost").await;
        assert!(matches!(err, Err(BrokerError::NotFound(_))));
    }
}
