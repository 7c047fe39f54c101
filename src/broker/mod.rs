//! Broker boundary.
//!
//! Touchline talks to its message broker through three narrow traits:
//!
//! - [`SubscriptionAdmin`]: subscriptions on a topic and their filter rules
//! - [`TopicPublisher`]: sending a message to a topic
//! - [`MessageReceiver`]: peek-lock receive and settlement on one subscription
//!
//! The broker owns fan-out: a message published to a topic is copied into
//! every subscription that has at least one rule matching the message
//! properties. Two implementations ship with the crate:
//!
//! - [`memory::InMemoryBroker`]: in-process, used by tests and local runs
//! - [`redis::RedisBroker`]: Redis Streams with one stream per subscription
//!
//! ```text
//! publish ─▶ topic ──┬─ rule? ─▶ acme-fc-coleta      ─▶ worker (peek-lock)
//!                    └─ rule? ─▶ acme-fc-finalizacao ─▶ worker (peek-lock)
//! ```

pub mod memory;
pub mod redis;

use crate::filter::FilterRule;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryBroker;
pub use redis::RedisBroker;

/// Name of the catch-all rule a broker installs on every new subscription.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Dead-letter reason used by the broker when a message ran out of deliveries.
pub const MAX_DELIVERY_REASON: &str = "MaxDeliveryCountExceeded";

/// Dead-letter reason used by the broker when a message outlived its TTL.
pub const EXPIRED_REASON: &str = "TTLExpiredException";

/// Errors raised at the broker boundary.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker could not be reached (connection, pool, configuration).
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A topic, subscription or rule did not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Creating an entity that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The broker rejected a command.
    #[error("broker command failed: {0}")]
    Command(String),

    /// A stored message or rule could not be encoded or decoded.
    #[error("broker codec error: {0}")]
    Codec(String),
}

impl BrokerError {
    /// True for failures a caller may retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Command(_))
    }
}

/// A typed message property value.
///
/// Filter rules compare numbers with numbers and strings with strings, so
/// the type of a property matters: `idChampionship = 10` never matches a
/// property holding the text `"10"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    Text(String),
}

impl PropertyValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            PropertyValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Int(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

/// Application properties attached to a message (the metadata channel).
pub type MessageProperties = BTreeMap<String, PropertyValue>;

/// A message ready to be sent to a topic.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub time_to_live: Duration,
    pub properties: MessageProperties,
}

/// A message received under a peek-lock.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    /// Number of times this message has been handed out, this delivery included.
    pub delivery_count: u32,
    /// Opaque token identifying the lock held on this delivery.
    pub lock_token: String,
    pub enqueued_at: DateTime<Utc>,
}

impl ReceivedMessage {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

/// A message parked in a subscription's dead-letter side channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Identifier of the dead-letter entry itself.
    pub id: String,
    pub message_id: String,
    pub reason: String,
    pub description: String,
    pub delivery_count: u32,
    pub properties: MessageProperties,
    /// Message body, lossily decoded as UTF-8.
    pub body: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_message(id: impl Into<String>, message: &ReceivedMessage, reason: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            message_id: message.message_id.clone(),
            reason: reason.to_string(),
            description: description.to_string(),
            delivery_count: message.delivery_count,
            properties: message.properties.clone(),
            body: String::from_utf8_lossy(&message.body).into_owned(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Options applied when a subscription is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Messages older than this are discarded by the subscription.
    pub default_message_ttl: Duration,
    /// Deliveries allowed before the broker dead-letters a message.
    pub max_delivery_count: u32,
    /// How long a received message stays reserved for its receiver.
    pub lock_duration: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            default_message_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_delivery_count: 10,
            lock_duration: Duration::from_secs(60),
        }
    }
}

/// How a rule replacement was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleSwap {
    /// Old rules removed and new rule installed in one broker operation.
    Atomic,
    /// Old rules deleted one by one before the new rule was created; messages
    /// published in between may have been matched by zero or by stale rules.
    Sequential,
}

/// Subscription and rule management on a topic.
#[async_trait]
pub trait SubscriptionAdmin: Send + Sync {
    async fn subscription_exists(&self, topic: &str, subscription: &str)
        -> Result<bool, BrokerError>;

    /// Create a subscription carrying the catch-all [`DEFAULT_RULE_NAME`] rule.
    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<(), BrokerError>;

    async fn delete_subscription(&self, topic: &str, subscription: &str)
        -> Result<(), BrokerError>;

    /// Names of the rules currently installed on a subscription.
    async fn rule_names(&self, topic: &str, subscription: &str)
        -> Result<Vec<String>, BrokerError>;

    async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &FilterRule,
    ) -> Result<(), BrokerError>;

    async fn delete_rule(&self, topic: &str, subscription: &str, rule_name: &str)
        -> Result<(), BrokerError>;

    async fn rule_exists(
        &self,
        topic: &str,
        subscription: &str,
        rule_name: &str,
    ) -> Result<bool, BrokerError> {
        Ok(self
            .rule_names(topic, subscription)
            .await?
            .iter()
            .any(|name| name == rule_name))
    }

    /// Leave `rule` as the only rule on the subscription.
    ///
    /// The default implementation deletes every existing rule and then
    /// creates the new one. Brokers that can swap rules in one step override
    /// it and report [`RuleSwap::Atomic`].
    async fn replace_rules(
        &self,
        topic: &str,
        subscription: &str,
        rule: &FilterRule,
    ) -> Result<RuleSwap, BrokerError> {
        for name in self.rule_names(topic, subscription).await? {
            self.delete_rule(topic, subscription, &name).await?;
        }
        self.create_rule(topic, subscription, rule).await?;
        Ok(RuleSwap::Sequential)
    }

    /// Most recent dead-lettered messages of a subscription, oldest first.
    async fn dead_letters(
        &self,
        topic: &str,
        subscription: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, BrokerError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Sends messages to a topic.
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<(), BrokerError>;
}

/// Peek-lock receiver bound to one subscription.
///
/// Every message returned by [`receive`](MessageReceiver::receive) must be
/// settled with exactly one of `complete`, `abandon` or `dead_letter` before
/// its lock expires; otherwise the broker hands it out again.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait up to `max_wait` for the next message.
    async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BrokerError>;

    /// Remove the message from the subscription.
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Release the lock and return the message to the subscription.
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Move the message to the subscription's dead-letter side channel.
    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError>;

    /// Name of the subscription this receiver reads from.
    fn subscription(&self) -> &str;
}
