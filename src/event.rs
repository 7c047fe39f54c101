//! Core event types for Touchline.
//!
//! A [`ChampionshipEvent`] is the unit of business data: one in-match
//! occurrence identified by championship, match and skill. The collector
//! publishes it once; the broker copies it into every subscription whose
//! filter rule matches its routing attributes.
//!
//! # Wire form
//!
//! ```json
//! {
//!   "idChampionship": 10,
//!   "idMatch": 55,
//!   "idSkill": 4,
//!   "timestamp": "2025-12-11T10:00:00Z"
//! }
//! ```

use crate::broker::{MessageProperties, PropertyValue};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message property names shared by the producer, the filters and the consumers.
pub mod keys {
    pub const ID_CHAMPIONSHIP: &str = "idChampionship";
    pub const ID_MATCH: &str = "idMatch";
    pub const ID_SKILL: &str = "idSkill";
    pub const TIMESTAMP: &str = "timestamp";
    pub const EVENT_TYPE: &str = "eventType";
    pub const SOURCE: &str = "source";
    pub const VERSION: &str = "version";
    pub const ENVIRONMENT: &str = "environment";
    pub const HOST: &str = "host";
}

/// Category tags carried in the `eventType` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ChampionshipData,
    SkillEvent,
    GamePeriod,
    Lineup,
    XgEvent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChampionshipData => "ChampionshipData",
            EventKind::SkillEvent => "SkillEvent",
            EventKind::GamePeriod => "GamePeriod",
            EventKind::Lineup => "Lineup",
            EventKind::XgEvent => "xGEvent",
        }
    }
}

/// Rejection of an event at ingress.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field} must be a positive integer (got {value})")]
pub struct ValidationError {
    pub field: &'static str,
    pub value: i64,
}

/// An in-match event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChampionshipEvent {
    pub id_championship: i64,
    pub id_match: i64,
    pub id_skill: i64,
    /// When the event happened on the pitch.
    pub timestamp: DateTime<Utc>,
}

impl ChampionshipEvent {
    pub fn new(id_championship: i64, id_match: i64, id_skill: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id_championship,
            id_match,
            id_skill,
            timestamp,
        }
    }

    /// All three identifiers must be strictly positive.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            (keys::ID_CHAMPIONSHIP, self.id_championship),
            (keys::ID_MATCH, self.id_match),
            (keys::ID_SKILL, self.id_skill),
        ] {
            if value <= 0 {
                return Err(ValidationError { field, value });
            }
        }
        Ok(())
    }

    /// Routing attributes stamped on the message at publish time.
    pub fn routing_attributes(&self, kind: EventKind, identity: &ProducerIdentity) -> MessageProperties {
        let mut props = MessageProperties::new();
        props.insert(keys::ID_CHAMPIONSHIP.into(), PropertyValue::Int(self.id_championship));
        props.insert(keys::ID_MATCH.into(), PropertyValue::Int(self.id_match));
        props.insert(keys::ID_SKILL.into(), PropertyValue::Int(self.id_skill));
        props.insert(
            keys::TIMESTAMP.into(),
            PropertyValue::Text(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        props.insert(keys::EVENT_TYPE.into(), PropertyValue::from(kind.as_str()));
        props.insert(keys::SOURCE.into(), PropertyValue::from(identity.service_name.as_str()));
        props.insert(keys::VERSION.into(), PropertyValue::from(identity.service_version.as_str()));
        props.insert(keys::ENVIRONMENT.into(), PropertyValue::from(identity.environment.as_str()));
        props.insert(keys::HOST.into(), PropertyValue::from(identity.host.as_str()));
        props
    }
}

/// Who published a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerIdentity {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub host: String,
}

impl ProducerIdentity {
    pub fn new(
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        environment: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            environment: environment.into(),
            host: host.into(),
        }
    }

    /// Identity with the host name read from the operating system.
    pub fn detect(
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.to_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(service_name, service_version, environment, host)
    }
}
