//! Dead-letter storage for the Redis broker.
//!
//! Each subscription gets its own dead-letter stream next to its message
//! stream. Messages land here when a consumer dead-letters them (bad payload,
//! failed webhook) or when the broker gives up after the subscription's
//! maximum delivery count. Nothing reads them automatically; they wait for
//! an operator.
//!
//! # Example
//!
//! ```rust,ignore
//! use touchline::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(redis_pool, "touchline:sub:championship-events:acme-fc-finalizacao:dlq");
//! dlq.add(&message, "DeliveryError", "HTTP 503 from webhook").await?;
//!
//! // Later, show what piled up
//! let parked = dlq.recent(10).await?;
//! ```

use deadpool_redis::redis::{cmd, Value as RedisValue};
use deadpool_redis::Pool;
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::broker::{DeadLetter, MessageProperties, ReceivedMessage};

/// Maximum entries to keep per dead-letter stream (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10000;

/// Dead-letter stream of one subscription.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
    stream: String,
}

impl DeadLetterQueue {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, DlqError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::ConnectionError(e.to_string())
        })
    }

    /// Park a message with the reason it could not be processed.
    pub async fn add(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<String, DlqError> {
        let mut conn = self.conn().await?;

        let properties = serde_json::to_string(&message.properties).map_err(|e| {
            error!(error = %e, "Failed to serialize message properties for DLQ");
            DlqError::SerializationError(e.to_string())
        })?;

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("messageId")
            .arg(&message.message_id)
            .arg("body")
            .arg(&message.body)
            .arg("properties")
            .arg(&properties)
            .arg("reason")
            .arg(reason)
            .arg("description")
            .arg(description)
            .arg("deliveryCount")
            .arg(message.delivery_count)
            .arg("deadLetteredAt")
            .arg(chrono::Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to add message to DLQ");
                DlqError::RedisError(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            message_id = %message.message_id,
            reason = %reason,
            delivery_count = message.delivery_count,
            "Message moved to dead-letter queue"
        );

        Ok(id)
    }

    /// The `count` most recent entries, oldest first.
    pub async fn recent(&self, count: usize) -> Result<Vec<DeadLetter>, DlqError> {
        let mut conn = self.conn().await?;

        let entries: Vec<(String, HashMap<String, RedisValue>)> = cmd("XREVRANGE")
            .arg(&self.stream)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::RedisError(e.to_string()))?;

        Ok(entries
            .into_iter()
            .rev()
            .map(|(id, fields)| parse_entry(id, &fields))
            .collect())
    }
}

/// Read a text field from stream entry data.
pub(crate) fn str_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    match map.get(key)? {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        RedisValue::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a binary field from stream entry data.
pub(crate) fn bytes_field(map: &HashMap<String, RedisValue>, key: &str) -> Vec<u8> {
    match map.get(key) {
        Some(RedisValue::BulkString(bytes)) => bytes.clone(),
        Some(RedisValue::SimpleString(s)) => s.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}

fn parse_entry(id: String, fields: &HashMap<String, RedisValue>) -> DeadLetter {
    let properties: MessageProperties = str_field(fields, "properties")
        .and_then(|raw| match serde_json::from_str(&raw) {
            Ok(props) => Some(props),
            Err(e) => {
                warn!(id = %id, error = %e, "Unreadable properties in DLQ entry");
                None
            }
        })
        .unwrap_or_default();

    let dead_lettered_at = str_field(fields, "deadLetteredAt")
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);

    DeadLetter {
        message_id: str_field(fields, "messageId").unwrap_or_default(),
        reason: str_field(fields, "reason").unwrap_or_default(),
        description: str_field(fields, "description").unwrap_or_default(),
        delivery_count: str_field(fields, "deliveryCount")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        properties,
        body: String::from_utf8_lossy(&bytes_field(fields, "body")).into_owned(),
        dead_lettered_at,
        id,
    }
}

/// Errors that can occur when working with the Dead Letter Queue.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PropertyValue;

    fn bulk(s: &str) -> RedisValue {
        RedisValue::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_entry() {
        let mut fields = HashMap::new();
        fields.insert("messageId".to_string(), bulk("m-1"));
        fields.insert("body".to_string(), bulk(r#"{"idSkill":4}"#));
        fields.insert("properties".to_string(), bulk(r#"{"idSkill":4}"#));
        fields.insert("reason".to_string(), bulk("DeliveryError"));
        fields.insert("description".to_string(), bulk("HTTP 500"));
        fields.insert("deliveryCount".to_string(), bulk("3"));
        fields.insert("deadLetteredAt".to_string(), bulk("2025-12-11T12:00:00+00:00"));

        let letter = parse_entry("1700000000000-0".to_string(), &fields);
        assert_eq!(letter.id, "1700000000000-0");
        assert_eq!(letter.message_id, "m-1");
        assert_eq!(letter.reason, "DeliveryError");
        assert_eq!(letter.delivery_count, 3);
        assert_eq!(letter.properties["idSkill"], PropertyValue::Int(4));
        assert_eq!(letter.body, r#"{"idSkill":4}"#);
    }

    #[test]
    fn test_parse_entry_tolerates_garbage() {
        let mut fields = HashMap::new();
        fields.insert("properties".to_string(), bulk("not json"));
        fields.insert("deliveryCount".to_string(), RedisValue::Nil);

        let letter = parse_entry("1-0".to_string(), &fields);
        assert!(letter.properties.is_empty());
        assert_eq!(letter.delivery_count, 0);
        assert_eq!(letter.body, "");
    }

    #[test]
    fn test_field_helpers() {
        let mut fields = HashMap::new();
        fields.insert("a".to_string(), RedisValue::SimpleString("x".into()));
        fields.insert("n".to_string(), RedisValue::Int(7));
        assert_eq!(str_field(&fields, "a").as_deref(), Some("x"));
        assert_eq!(str_field(&fields, "n").as_deref(), Some("7"));
        assert_eq!(str_field(&fields, "missing"), None);
        assert_eq!(bytes_field(&fields, "a"), b"x".to_vec());
    }
}
