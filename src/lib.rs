//! # Touchline
//!
//! Content-filtered fan-out of championship events: one collector publishes
//! every event to a shared topic, and each client service type drains its
//! own filtered subscription into a webhook.
//!
//! ## Architecture
//!
//! ```text
//! Collector -> HTTP API -> Producer -> Topic -> Subscriptions (SQL-style rules)
//!                                                   |
//!                               Worker -> Pipeline -> Webhook | Dead letters
//! ```
//!
//! ## Modules
//!
//! - [`event`]: The championship event and its routing attributes
//! - [`filter`]: Subscription rule expressions per service type
//! - [`trace`]: W3C trace context carried in message properties
//! - [`broker`]: Topic/subscription abstraction with in-memory and Redis backends
//! - [`subscriptions`]: Per-client subscription provisioning and teardown
//! - [`producer`]: Publishing events to the topic
//! - [`consumer`]: Receive, revalidate, deliver and settle
//! - [`sink`]: Delivery targets (webhook, log)
//! - [`api`]: HTTP ingress and subscription management

pub mod api;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod producer;
pub mod shutdown;
pub mod sink;
pub mod subscriptions;
pub mod trace;

// Re-export commonly used types at crate root
pub use broker::{InMemoryBroker, MessageReceiver, RedisBroker, SubscriptionAdmin, TopicPublisher};
pub use consumer::{ConsumerProfile, MessagePipeline, Processor};
pub use event::ChampionshipEvent;
pub use producer::EventPublisher;
pub use subscriptions::SubscriptionManager;

/// Topic every championship event is published to
pub const DEFAULT_TOPIC: &str = "championship-events";

/// Consumer group each Redis subscription stream is read through
pub const DEFAULT_CONSUMER_GROUP: &str = "consumers";

/// Prefix for every Redis key the broker owns
pub const DEFAULT_KEY_PREFIX: &str = "touchline";
