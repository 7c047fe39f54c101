//! Redis Streams broker.
//!
//! Layout under a configurable key prefix `{p}`:
//!
//! ```text
//! {p}:topic:{topic}:subscriptions      SET    subscription names
//! {p}:sub:{topic}:{sub}:rules          HASH   rule name -> rule JSON
//! {p}:sub:{topic}:{sub}:options        HASH   ttlMs, maxDeliveryCount, lockMs
//! {p}:sub:{topic}:{sub}:stream         STREAM one entry per copied message
//! {p}:sub:{topic}:{sub}:dlq            STREAM dead letters
//! ```
//!
//! Fan-out happens at publish time: the publisher evaluates each
//! subscription's rules and appends a copy to every matching stream in one
//! MULTI/EXEC. Consumers read through the `consumers` group; the pending
//! entry list is the peek-lock, and an entry idle for longer than the lock
//! duration is re-appended with its delivery count bumped.

use super::{
    BrokerError, DeadLetter, MessageProperties, MessageReceiver, OutboundMessage,
    ReceivedMessage, RuleSwap, SubscriptionAdmin, SubscriptionOptions, TopicPublisher,
    MAX_DELIVERY_REASON,
};
use crate::dlq::{bytes_field, str_field, DeadLetterQueue, DlqError};
use crate::filter::FilterRule;
use crate::DEFAULT_CONSUMER_GROUP;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, pipe, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Entries reclaimed from expired locks per receive call.
const RECLAIM_BATCH: usize = 10;

/// Fan-out attempts before a send gives up on a churning subscription set.
const FAN_OUT_ATTEMPTS: usize = 5;

fn command_error(e: RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        BrokerError::Unavailable(e.to_string())
    } else {
        BrokerError::Command(e.to_string())
    }
}

impl From<DlqError> for BrokerError {
    fn from(e: DlqError) -> Self {
        match e {
            DlqError::ConnectionError(msg) => BrokerError::Unavailable(msg),
            DlqError::RedisError(msg) => BrokerError::Command(msg),
            DlqError::SerializationError(msg) => BrokerError::Codec(msg),
        }
    }
}

#[derive(Debug, Clone)]
struct SubscriptionKeys {
    rules: String,
    options: String,
    stream: String,
    dlq: String,
}

/// Broker backed by Redis Streams.
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    prefix: String,
}

impl RedisBroker {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    /// Build a connection pool for `url`.
    pub fn from_url(url: &str, prefix: impl Into<String>) -> Result<Self, BrokerError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(Self::new(pool, prefix))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:topic:{}:subscriptions", self.prefix, topic)
    }

    fn keys(&self, topic: &str, subscription: &str) -> SubscriptionKeys {
        let base = format!("{}:sub:{}:{}", self.prefix, topic, subscription);
        SubscriptionKeys {
            rules: format!("{}:rules", base),
            options: format!("{}:options", base),
            stream: format!("{}:stream", base),
            dlq: format!("{}:dlq", base),
        }
    }

    async fn conn(&self) -> Result<Connection, BrokerError> {
        self.pool
            .get()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }

    async fn require_subscription(
        &self,
        conn: &mut Connection,
        topic: &str,
        subscription: &str,
    ) -> Result<(), BrokerError> {
        let exists: bool = conn
            .sismember(self.topic_key(topic), subscription)
            .await
            .map_err(command_error)?;
        if exists {
            Ok(())
        } else {
            Err(BrokerError::NotFound(format!("subscription {}/{}", topic, subscription)))
        }
    }

    /// Dead-letter stream of a subscription.
    pub fn dead_letter_queue(&self, topic: &str, subscription: &str) -> DeadLetterQueue {
        DeadLetterQueue::new(self.pool.clone(), self.keys(topic, subscription).dlq)
    }

    /// Peek-lock receiver on one subscription, reading as `consumer`.
    pub fn receiver(&self, topic: &str, subscription: &str, consumer: &str) -> RedisReceiver {
        RedisReceiver {
            broker: self.clone(),
            keys: self.keys(topic, subscription),
            dlq: self.dead_letter_queue(topic, subscription),
            subscription: subscription.to_string(),
            consumer: consumer.to_string(),
        }
    }
}

async fn load_options(conn: &mut Connection, key: &str) -> Result<SubscriptionOptions, BrokerError> {
    let stored: HashMap<String, u64> = conn.hgetall(key).await.map_err(command_error)?;
    Ok(decode_options(&stored))
}

/// Options from the stored hash; missing or out-of-range values fall back to defaults.
fn decode_options(stored: &HashMap<String, u64>) -> SubscriptionOptions {
    let defaults = SubscriptionOptions::default();
    SubscriptionOptions {
        default_message_ttl: stored
            .get("ttlMs")
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(defaults.default_message_ttl),
        max_delivery_count: stored
            .get("maxDeliveryCount")
            .and_then(|n| u32::try_from(*n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_delivery_count),
        lock_duration: stored
            .get("lockMs")
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(defaults.lock_duration),
    }
}

fn lock_lost(lock_token: &str) -> BrokerError {
    BrokerError::NotFound(format!("lock {} lost or expired", lock_token))
}

/// `NotFound` when a settle found nothing pending under the lock.
fn settled(acked: bool, lock_token: &str) -> Result<(), BrokerError> {
    if acked {
        Ok(())
    } else {
        Err(lock_lost(lock_token))
    }
}

fn encode_rule(rule: &FilterRule) -> Result<String, BrokerError> {
    serde_json::to_string(rule).map_err(|e| BrokerError::Codec(e.to_string()))
}

#[async_trait]
impl SubscriptionAdmin for RedisBroker {
    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        conn.sismember(self.topic_key(topic), subscription)
            .await
            .map_err(command_error)
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(topic, subscription);
        let default_rule = FilterRule::catch_all();

        let added: i64 = conn
            .sadd(self.topic_key(topic), subscription)
            .await
            .map_err(command_error)?;
        if added == 0 {
            return Err(BrokerError::AlreadyExists(format!("subscription {}/{}", topic, subscription)));
        }

        let _: () = pipe()
            .atomic()
            .cmd("HSET")
            .arg(&keys.options)
            .arg("ttlMs")
            .arg(options.default_message_ttl.as_millis() as u64)
            .arg("maxDeliveryCount")
            .arg(options.max_delivery_count)
            .arg("lockMs")
            .arg(options.lock_duration.as_millis() as u64)
            .ignore()
            .cmd("HSET")
            .arg(&keys.rules)
            .arg(&default_rule.name)
            .arg(encode_rule(&default_rule)?)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        // Start at 0 so nothing appended since the stream existed is skipped.
        let created: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&keys.stream)
            .arg(DEFAULT_CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {}
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %keys.stream, "Consumer group already exists");
            }
            Err(e) => return Err(command_error(e)),
        }

        info!(topic = %topic, subscription = %subscription, "Subscription created");
        Ok(())
    }

    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let keys = self.keys(topic, subscription);

        let (removed,): (i64,) = pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.topic_key(topic))
            .arg(subscription)
            .cmd("DEL")
            .arg(&keys.rules)
            .arg(&keys.options)
            .arg(&keys.stream)
            .arg(&keys.dlq)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        if removed == 0 {
            return Err(BrokerError::NotFound(format!("subscription {}/{}", topic, subscription)));
        }
        info!(topic = %topic, subscription = %subscription, "Subscription deleted");
        Ok(())
    }

    async fn rule_names(&self, topic: &str, subscription: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn().await?;
        self.require_subscription(&mut conn, topic, subscription).await?;
        conn.hkeys(self.keys(topic, subscription).rules)
            .await
            .map_err(command_error)
    }

    async fn create_rule(&self, topic: &str, subscription: &str, rule: &FilterRule) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        self.require_subscription(&mut conn, topic, subscription).await?;
        let set: bool = conn
            .hset_nx(self.keys(topic, subscription).rules, &rule.name, encode_rule(rule)?)
            .await
            .map_err(command_error)?;
        if set {
            Ok(())
        } else {
            Err(BrokerError::AlreadyExists(format!("rule {}", rule.name)))
        }
    }

    async fn delete_rule(&self, topic: &str, subscription: &str, rule_name: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        self.require_subscription(&mut conn, topic, subscription).await?;
        let removed: i64 = conn
            .hdel(self.keys(topic, subscription).rules, rule_name)
            .await
            .map_err(command_error)?;
        if removed == 0 {
            return Err(BrokerError::NotFound(format!("rule {}", rule_name)));
        }
        Ok(())
    }

    async fn replace_rules(
        &self,
        topic: &str,
        subscription: &str,
        rule: &FilterRule,
    ) -> Result<RuleSwap, BrokerError> {
        let mut conn = self.conn().await?;
        self.require_subscription(&mut conn, topic, subscription).await?;
        let key = self.keys(topic, subscription).rules;

        let _: () = pipe()
            .atomic()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("HSET")
            .arg(&key)
            .arg(&rule.name)
            .arg(encode_rule(rule)?)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(RuleSwap::Atomic)
    }

    async fn dead_letters(
        &self,
        topic: &str,
        subscription: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetter>, BrokerError> {
        {
            let mut conn = self.conn().await?;
            self.require_subscription(&mut conn, topic, subscription).await?;
        }
        Ok(self.dead_letter_queue(topic, subscription).recent(limit).await?)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(command_error)?;
        Ok(())
    }
}

impl RedisBroker {
    /// Streams of the subscriptions whose rules accept `message`, with the
    /// TTL each copy gets.
    async fn matching_streams(
        &self,
        conn: &mut Connection,
        topic: &str,
        message: &OutboundMessage,
    ) -> Result<Vec<(String, Duration)>, BrokerError> {
        let subscriptions: Vec<String> = conn
            .smembers(self.topic_key(topic))
            .await
            .map_err(command_error)?;

        let mut streams = Vec::new();
        for subscription in &subscriptions {
            let keys = self.keys(topic, subscription);
            let raw_rules: Vec<String> = conn.hvals(&keys.rules).await.map_err(command_error)?;
            let accepts = raw_rules.iter().any(|raw| match serde_json::from_str::<FilterRule>(raw) {
                Ok(rule) => rule.matches(&message.properties),
                Err(e) => {
                    warn!(subscription = %subscription, error = %e, "Skipping unreadable rule");
                    false
                }
            });
            if accepts {
                let options = load_options(conn, &keys.options).await?;
                streams.push((keys.stream, message.time_to_live.min(options.default_message_ttl)));
            }
        }
        Ok(streams)
    }
}

#[async_trait]
impl TopicPublisher for RedisBroker {
    /// Append a copy to every matching subscription stream.
    ///
    /// The subscription set is WATCHed while rules are evaluated, so a
    /// subscription deleted mid-send aborts the EXEC instead of leaving an
    /// orphan stream behind; the send is then retried.
    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let properties =
            serde_json::to_string(&message.properties).map_err(|e| BrokerError::Codec(e.to_string()))?;
        let topic_key = self.topic_key(topic);

        for attempt in 1..=FAN_OUT_ATTEMPTS {
            let _: () = cmd("WATCH")
                .arg(&topic_key)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;

            let streams = match self.matching_streams(&mut conn, topic, &message).await {
                Ok(streams) => streams,
                Err(e) => {
                    let _: Result<(), RedisError> = cmd("UNWATCH").query_async(&mut conn).await;
                    return Err(e);
                }
            };
            if streams.is_empty() {
                let _: () = cmd("UNWATCH").query_async(&mut conn).await.map_err(command_error)?;
                debug!(topic = %topic, message_id = %message.message_id, "Message matched no subscription");
                return Ok(());
            }

            let now = Utc::now();
            let mut fan_out = pipe();
            fan_out.atomic();
            for (stream, ttl) in &streams {
                let expires_at = now + chrono::Duration::milliseconds(ttl.as_millis() as i64);
                fan_out
                    .cmd("XADD")
                    .arg(stream)
                    .arg("*")
                    .arg("messageId")
                    .arg(&message.message_id)
                    .arg("contentType")
                    .arg(&message.content_type)
                    .arg("body")
                    .arg(&message.body)
                    .arg("properties")
                    .arg(&properties)
                    .arg("enqueuedAt")
                    .arg(now.to_rfc3339())
                    .arg("expiresAt")
                    .arg(expires_at.timestamp_millis())
                    .arg("deliveryCount")
                    .arg(0);
            }

            // EXEC answers nil when the watched set changed.
            let ids: Option<Vec<String>> = fan_out.query_async(&mut conn).await.map_err(command_error)?;
            match ids {
                Some(ids) => {
                    debug!(topic = %topic, message_id = %message.message_id, copies = ids.len(), "Message fanned out");
                    return Ok(());
                }
                None => debug!(topic = %topic, attempt, "Subscriptions changed during fan-out, retrying"),
            }
        }

        Err(BrokerError::Command(format!(
            "fan-out to {} aborted {} times by concurrent subscription changes",
            topic, FAN_OUT_ATTEMPTS
        )))
    }
}

/// A stream entry decoded back into message form.
struct StoredEntry {
    id: String,
    fields: HashMap<String, RedisValue>,
}

impl StoredEntry {
    /// Deliveries handed out before this one.
    fn delivery_count(&self) -> u32 {
        str_field(&self.fields, "deliveryCount")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        str_field(&self.fields, "expiresAt")
            .and_then(|s| s.parse::<i64>().ok())
            .is_some_and(|ms| ms <= now.timestamp_millis())
    }

    fn to_received(&self, delivery_count: u32) -> ReceivedMessage {
        let properties: MessageProperties = str_field(&self.fields, "properties")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let enqueued_at = str_field(&self.fields, "enqueuedAt")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        ReceivedMessage {
            message_id: str_field(&self.fields, "messageId").unwrap_or_default(),
            body: bytes_field(&self.fields, "body"),
            properties,
            delivery_count,
            lock_token: self.id.clone(),
            enqueued_at,
        }
    }
}

/// Peek-lock receiver on a [`RedisBroker`] subscription.
#[derive(Clone)]
pub struct RedisReceiver {
    broker: RedisBroker,
    keys: SubscriptionKeys,
    dlq: DeadLetterQueue,
    subscription: String,
    consumer: String,
}

impl RedisReceiver {
    async fn fetch(&self, conn: &mut Connection, id: &str) -> Result<Option<StoredEntry>, BrokerError> {
        let reply: StreamRangeReply = conn
            .xrange(&self.keys.stream, id, id)
            .await
            .map_err(command_error)?;
        Ok(reply.ids.into_iter().next().map(|entry| StoredEntry {
            id: entry.id,
            fields: entry.map,
        }))
    }

    /// Ack and delete one entry. Returns false if it was no longer pending.
    async fn settle(&self, conn: &mut Connection, id: &str) -> Result<bool, BrokerError> {
        let (acked, _): (i64, i64) = pipe()
            .atomic()
            .cmd("XACK")
            .arg(&self.keys.stream)
            .arg(DEFAULT_CONSUMER_GROUP)
            .arg(id)
            .cmd("XDEL")
            .arg(&self.keys.stream)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(command_error)?;
        Ok(acked > 0)
    }

    /// Append a copy of `entry` carrying `delivery_count`, then retire the original.
    async fn requeue(&self, conn: &mut Connection, entry: &StoredEntry, delivery_count: u32) -> Result<(), BrokerError> {
        let mut requeue = pipe();
        requeue.atomic();
        {
            let xadd = requeue.cmd("XADD").arg(&self.keys.stream).arg("*");
            for (field, value) in &entry.fields {
                if field == "deliveryCount" {
                    continue;
                }
                if let RedisValue::BulkString(bytes) = value {
                    xadd.arg(field).arg(bytes);
                } else if let Some(text) = str_field(&entry.fields, field) {
                    xadd.arg(field).arg(text);
                }
            }
            xadd.arg("deliveryCount").arg(delivery_count).ignore();
        }
        let _: () = requeue
            .cmd("XACK")
            .arg(&self.keys.stream)
            .arg(DEFAULT_CONSUMER_GROUP)
            .arg(&entry.id)
            .ignore()
            .cmd("XDEL")
            .arg(&self.keys.stream)
            .arg(&entry.id)
            .ignore()
            .query_async(conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    /// Put entries whose lock expired back on the stream.
    async fn reclaim_expired(&self, conn: &mut Connection, options: &SubscriptionOptions) -> Result<(), BrokerError> {
        let reply: RedisValue = cmd("XAUTOCLAIM")
            .arg(&self.keys.stream)
            .arg(DEFAULT_CONSUMER_GROUP)
            .arg(&self.consumer)
            .arg(options.lock_duration.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(RECLAIM_BATCH)
            .arg("JUSTID")
            .query_async(conn)
            .await
            .map_err(command_error)?;

        let ids: Vec<String> = match reply {
            RedisValue::Array(parts) => match parts.into_iter().nth(1) {
                Some(RedisValue::Array(ids)) => ids
                    .into_iter()
                    .filter_map(|id| match id {
                        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
                        RedisValue::SimpleString(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };

        for id in ids {
            match self.fetch(conn, &id).await? {
                Some(entry) => {
                    let delivered = entry.delivery_count() + 1;
                    debug!(subscription = %self.subscription, id = %id, delivery_count = delivered, "Lock expired, message returned");
                    self.requeue(conn, &entry, delivered).await?;
                }
                None => {
                    self.settle(conn, &id).await?;
                }
            }
        }
        Ok(())
    }

    async fn read_one(&self, conn: &mut Connection, block: Duration) -> Result<Option<StoredEntry>, BrokerError> {
        let mut opts = StreamReadOptions::default()
            .group(DEFAULT_CONSUMER_GROUP, &self.consumer)
            .count(1);
        let block_ms = block.as_millis() as usize;
        if block_ms > 0 {
            opts = opts.block(block_ms);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.keys.stream], &[">"], &opts)
            .await
            .map_err(command_error)?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next())
            .map(|entry| StoredEntry {
                id: entry.id,
                fields: entry.map,
            }))
    }
}

#[async_trait]
impl MessageReceiver for RedisReceiver {
    async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BrokerError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut conn = self.broker.conn().await?;
        let options = load_options(&mut conn, &self.keys.options).await?;
        self.reclaim_expired(&mut conn, &options).await?;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Some(entry) = self.read_one(&mut conn, remaining).await? else {
                return Ok(None);
            };

            if entry.expired(Utc::now()) {
                debug!(subscription = %self.subscription, id = %entry.id, "Message expired");
                self.settle(&mut conn, &entry.id).await?;
            } else if entry.delivery_count() >= options.max_delivery_count {
                let stale = entry.to_received(entry.delivery_count());
                warn!(
                    subscription = %self.subscription,
                    message_id = %stale.message_id,
                    delivery_count = stale.delivery_count,
                    "Max delivery count reached, dead-lettering"
                );
                let description = format!(
                    "Message could not be consumed after {} delivery attempts",
                    stale.delivery_count
                );
                self.dlq.add(&stale, MAX_DELIVERY_REASON, &description).await?;
                self.settle(&mut conn, &entry.id).await?;
            } else {
                return Ok(Some(entry.to_received(entry.delivery_count() + 1)));
            }

            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let mut conn = self.broker.conn().await?;
        settled(self.settle(&mut conn, &message.lock_token).await?, &message.lock_token)
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let mut conn = self.broker.conn().await?;
        let entry = self
            .fetch(&mut conn, &message.lock_token)
            .await?
            .ok_or_else(|| lock_lost(&message.lock_token))?;
        self.requeue(&mut conn, &entry, message.delivery_count).await
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.broker.conn().await?;
        // A reclaimed entry is re-appended under a new id, so a missing
        // entry means another receiver owns the message now.
        if self.fetch(&mut conn, &message.lock_token).await?.is_none() {
            return Err(lock_lost(&message.lock_token));
        }
        self.dlq.add(message, reason, description).await?;
        settled(self.settle(&mut conn, &message.lock_token).await?, &message.lock_token)
    }

    fn subscription(&self) -> &str {
        &self.subscription
    }
}
