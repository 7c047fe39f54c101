//! Configuration module for Touchline.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 3000
//! api_key = "${TOUCHLINE_API_KEY}"
//!
//! [broker]
//! topic = "championship-events"
//!
//! [consumer]
//! subscription = "acme-fc-finalizacao"
//! service_type = "finalizacao"
//! webhook_url = "${SHOTS_WEBHOOK_URL}"
//! webhook_event_type = "championship.shots"
//! source = "shots-pusher"
//! skill_ids = [4]
//!
//! [consumer.extra]
//! analysisType = "shots_detection"
//! ```

use crate::broker::SubscriptionOptions;
use crate::consumer::{ConsumerProfile, Relevance};
use crate::event::ProducerIdentity;
use crate::filter::ServiceType;
use crate::sink::{DeliveryProfile, DeliverySink, LogSink, WebhookSink};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TouchlineConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub producer: ProducerConfig,

    /// Only the worker needs this section.
    #[serde(default)]
    pub consumer: Option<ConsumerConfig>,
}

/// Server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on `/api` routes; open when unset
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    crate::DEFAULT_KEY_PREFIX.to_string()
}

/// Topic and subscription settings
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_max_delivery_count")]
    pub max_delivery_count: u32,

    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    #[serde(default = "default_subscription_ttl_hours")]
    pub subscription_ttl_hours: u64,

    #[serde(default = "default_message_ttl_hours")]
    pub message_ttl_hours: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            max_delivery_count: default_max_delivery_count(),
            lock_duration_ms: default_lock_duration_ms(),
            subscription_ttl_hours: default_subscription_ttl_hours(),
            message_ttl_hours: default_message_ttl_hours(),
        }
    }
}

fn default_topic() -> String {
    crate::DEFAULT_TOPIC.to_string()
}

fn default_max_delivery_count() -> u32 {
    10
}

fn default_lock_duration_ms() -> u64 {
    60000
}

fn default_subscription_ttl_hours() -> u64 {
    7 * 24
}

fn default_message_ttl_hours() -> u64 {
    24
}

impl BrokerConfig {
    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            default_message_ttl: hours(self.subscription_ttl_hours),
            max_delivery_count: self.max_delivery_count,
            lock_duration: Duration::from_millis(self.lock_duration_ms),
        }
    }

    pub fn message_ttl(&self) -> Duration {
        hours(self.message_ttl_hours)
    }
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 60 * 60)
}

/// Identity stamped on every published message
#[derive(Debug, Deserialize, Clone)]
pub struct ProducerConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_service_version")]
    pub service_version: String,

    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            service_version: default_service_version(),
            environment: default_environment(),
        }
    }
}

impl ProducerConfig {
    /// Identity for published messages, with the local host name.
    pub fn identity(&self) -> ProducerIdentity {
        ProducerIdentity::detect(&self.service_name, &self.service_version, &self.environment)
    }
}

fn default_service_name() -> String {
    "touchline-collector".to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_environment() -> String {
    "Development".to_string()
}

/// One worker: the subscription it drains and where it delivers
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    pub subscription: String,

    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Consumer name within the group; defaults to the host name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub webhook_url: String,

    #[serde(default = "default_webhook_event_type")]
    pub webhook_event_type: String,

    #[serde(default = "default_source")]
    pub source: String,

    /// Local relevance check; empty accepts everything
    #[serde(default)]
    pub skill_ids: Vec<i64>,

    #[serde(default = "default_webhook_timeout_ms")]
    pub webhook_timeout_ms: u64,

    #[serde(default = "default_receive_wait_ms")]
    pub receive_wait_ms: u64,

    /// Static fields merged into the webhook `data` object
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    /// Log instead of calling the webhook
    #[serde(default)]
    pub dry_run: bool,
}

fn default_service_type() -> String {
    "coleta".to_string()
}

fn default_webhook_event_type() -> String {
    "championship.event".to_string()
}

fn default_source() -> String {
    "touchline-worker".to_string()
}

fn default_webhook_timeout_ms() -> u64 {
    30000
}

/// Time left after a webhook timeout to apply the disposition before the
/// message lock lapses.
pub const SETTLE_MARGIN_MS: u64 = 5000;

fn default_receive_wait_ms() -> u64 {
    2000
}

impl ConsumerConfig {
    pub fn profile(&self) -> ConsumerProfile {
        let mut delivery = DeliveryProfile::new(&self.webhook_event_type, &self.source);
        delivery.extra = self.extra.clone();
        ConsumerProfile {
            subscription: self.subscription.clone(),
            service_type: ServiceType::parse(&self.service_type),
            relevance: Relevance::skills(self.skill_ids.iter().copied()),
            delivery,
        }
    }

    pub fn build_sink(&self) -> Arc<dyn DeliverySink> {
        if self.dry_run {
            Arc::new(LogSink::with_prefix(&self.subscription))
        } else {
            Arc::new(
                WebhookSink::new(&self.webhook_url)
                    .with_timeout(Duration::from_millis(self.webhook_timeout_ms)),
            )
        }
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscription.trim().is_empty() {
            return Err(ConfigError::MissingField("consumer.subscription".to_string()));
        }

        if self.dry_run && self.webhook_url.is_empty() {
            return Ok(());
        }

        if self.webhook_url.is_empty() {
            return Err(ConfigError::MissingField("consumer.webhook_url".to_string()));
        }

        // Check for unsubstituted env vars
        if self.webhook_url.contains("${") {
            warn!(
                url = %self.webhook_url,
                "Webhook URL contains unsubstituted environment variable"
            );
        }

        if !self.webhook_url.starts_with("http://") && !self.webhook_url.starts_with("https://") {
            return Err(ConfigError::ValidationError(
                "consumer.webhook_url must start with http:// or https://".to_string(),
            ));
        }

        if self.webhook_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.webhook_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

impl TouchlineConfig {
    /// Load configuration from the default path or TOUCHLINE_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("TOUCHLINE_CONFIG").unwrap_or_else(|_| "config/touchline.toml".to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            let content = fs::read_to_string(path)?;
            let content = substitute_env_vars(&content);
            debug!("Parsing TOML configuration");
            toml::from_str(&content)?
        } else {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;

        info!(
            topic = %config.broker.topic,
            consumer = ?config.consumer.as_ref().map(|c| c.subscription.as_str()),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Apply REDIS_URL, TOUCHLINE_API_KEY, PORT and TOUCHLINE_WORKER_NAME.
    ///
    /// An API key left empty or still holding a `${VAR}` placeholder is
    /// dropped, so the routes run open (with a warning) rather than
    /// accepting the placeholder text as a token.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(key) = lookup("TOUCHLINE_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid PORT"),
            }
        }
        if let (Some(name), Some(consumer)) = (lookup("TOUCHLINE_WORKER_NAME"), self.consumer.as_mut()) {
            consumer.name = Some(name);
        }
        if let Some(key) = &self.server.api_key {
            if key.trim().is_empty() || key.contains("${") {
                warn!("API key is empty or an unsubstituted placeholder, ignoring it");
                self.server.api_key = None;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.topic.trim().is_empty() {
            return Err(ConfigError::MissingField("broker.topic".to_string()));
        }

        if self.broker.max_delivery_count < 1 {
            return Err(ConfigError::ValidationError(
                "broker.max_delivery_count must be at least 1".to_string(),
            ));
        }

        if self.broker.lock_duration_ms == 0 {
            return Err(ConfigError::ValidationError(
                "broker.lock_duration_ms must be greater than zero".to_string(),
            ));
        }

        if self.broker.message_ttl_hours == 0 {
            return Err(ConfigError::ValidationError(
                "broker.message_ttl_hours must be greater than zero".to_string(),
            ));
        }

        if let Some(consumer) = &self.consumer {
            let budget = consumer.webhook_timeout_ms.saturating_add(SETTLE_MARGIN_MS);
            if budget > self.broker.lock_duration_ms {
                return Err(ConfigError::ValidationError(format!(
                    "consumer.webhook_timeout_ms ({}) plus {} ms to settle must fit in broker.lock_duration_ms ({})",
                    consumer.webhook_timeout_ms, SETTLE_MARGIN_MS, self.broker.lock_duration_ms
                )));
            }
        }

        Ok(())
    }

    /// The `[consumer]` section, validated. Only the worker calls this, so
    /// the server starts with an incomplete consumer section.
    pub fn consumer(&self) -> Result<&ConsumerConfig, ConfigError> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("consumer".to_string()))?;
        consumer.validate()?;
        Ok(consumer)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = match Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return content.to_string(),
    };

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TOUCHLINE_TEST_VAR", "substituted_value");
        let input = "url = \"${TOUCHLINE_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("TOUCHLINE_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = TouchlineConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.broker.topic, "championship-events");
        assert_eq!(config.broker.max_delivery_count, 10);
        assert_eq!(config.broker.message_ttl(), Duration::from_secs(86_400));
        assert!(config.consumer.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_subscription_options() {
        let options = BrokerConfig::default().subscription_options();
        assert_eq!(options, SubscriptionOptions::default());
    }

    #[test]
    fn test_parse_consumer() {
        let toml = r#"
            [consumer]
            subscription = "acme-fc-finalizacao"
            service_type = "finalizacao"
            webhook_url = "https://hooks.example.com/shots"
            webhook_event_type = "championship.shots"
            source = "shots-pusher"
            skill_ids = [4]

            [consumer.extra]
            analysisType = "shots_detection"
            shotCount = 1
        "#;

        let config: TouchlineConfig = toml::from_str(toml).unwrap();
        let consumer = config.consumer().unwrap();
        assert_eq!(consumer.webhook_timeout_ms, 30000);

        let profile = consumer.profile();
        assert_eq!(profile.service_type, ServiceType::Shots);
        assert_eq!(profile.relevance, Relevance::skills([4]));
        assert_eq!(profile.delivery.event_type, "championship.shots");
        assert_eq!(profile.delivery.extra["analysisType"], "shots_detection");
        assert_eq!(profile.delivery.extra["shotCount"], 1);
    }

    #[test]
    fn test_validation_invalid_url() {
        let toml = r#"
            [consumer]
            subscription = "s"
            webhook_url = "not-a-url"
        "#;

        let config: TouchlineConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert!(matches!(config.consumer(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_missing_consumer_section() {
        let config = TouchlineConfig::default();
        assert!(matches!(config.consumer(), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_dry_run_needs_no_url() {
        let toml = r#"
            [consumer]
            subscription = "s"
            dry_run = true
        "#;

        let config: TouchlineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.consumer().unwrap().build_sink().name(), "log");
    }

    #[test]
    fn test_validation_broker_limits() {
        let mut config = TouchlineConfig::default();
        config.broker.max_delivery_count = 0;
        assert!(config.validate().is_err());

        let mut config = TouchlineConfig::default();
        config.broker.lock_duration_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("REDIS_URL", "redis://cache:6380"),
            ("TOUCHLINE_API_KEY", "secret"),
            ("PORT", "8080"),
            ("TOUCHLINE_WORKER_NAME", "worker-7"),
        ]);
        let mut config: TouchlineConfig = toml::from_str("[consumer]\nsubscription = \"s\"\ndry_run = true").unwrap();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.server.api_key.as_deref(), Some("secret"));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.consumer.unwrap().name.as_deref(), Some("worker-7"));
    }

    #[test]
    fn test_webhook_timeout_must_fit_in_lock() {
        let parse = |timeout: u64, lock: u64| -> TouchlineConfig {
            toml::from_str(&format!(
                "[broker]\nlock_duration_ms = {lock}\n\n[consumer]\nsubscription = \"s\"\ndry_run = true\nwebhook_timeout_ms = {timeout}"
            ))
            .unwrap()
        };

        assert!(parse(30000, 30000).validate().is_err());
        assert!(parse(26000, 30000).validate().is_err());
        assert!(parse(25000, 30000).validate().is_ok());

        let defaults: TouchlineConfig = toml::from_str("[consumer]\nsubscription = \"s\"\ndry_run = true").unwrap();
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn test_placeholder_api_key_is_dropped() {
        let mut config: TouchlineConfig = toml::from_str(include_str!("../config/touchline.toml")).unwrap();
        assert_eq!(config.server.api_key.as_deref(), Some("${TOUCHLINE_API_KEY}"));

        config.apply_overrides(|_| None);
        assert_eq!(config.server.api_key, None);
        assert!(config.validate().is_ok());

        config.apply_overrides(|key| (key == "TOUCHLINE_API_KEY").then(|| "  ".to_string()));
        assert_eq!(config.server.api_key, None);

        config.apply_overrides(|key| (key == "TOUCHLINE_API_KEY").then(|| "s3cret".to_string()));
        assert_eq!(config.server.api_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_invalid_port_override_ignored() {
        let mut config = TouchlineConfig::default();
        config.apply_overrides(|key| (key == "PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.server.port, 3000);
    }
}
