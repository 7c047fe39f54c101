//! Touchline Worker - Subscription Consumer
//!
//! Drains one client subscription: every received message is revalidated,
//! delivered to the configured webhook and settled (completed, abandoned or
//! dead-lettered).
//!
//! ## Configuration
//!
//! The `[consumer]` section of `config/touchline.toml` (or
//! `TOUCHLINE_CONFIG`), plus environment variables:
//! - `REDIS_URL`: Redis connection string
//! - `TOUCHLINE_WORKER_NAME`: Consumer name in the group (default: hostname or UUID)
//! - `RUST_LOG` / `LOG_FORMAT`: Logging level and format

use std::sync::Arc;
use tracing::{info, warn};

use touchline::config::{ConsumerConfig, TouchlineConfig};
use touchline::shutdown::ShutdownSignal;
use touchline::{MessagePipeline, Processor, RedisBroker, SubscriptionAdmin};

/// Consumer name from config, else hostname, else a random id.
fn worker_name(consumer: &ConsumerConfig) -> String {
    if let Some(name) = consumer.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }

    // Try hostname
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    // Fallback to UUID
    format!("worker-{}", uuid::Uuid::new_v4())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    dotenvy::dotenv().ok();
    touchline::logging::init();

    let config = TouchlineConfig::load()?;
    let consumer = config.consumer()?.clone();
    let topic = config.broker.topic.clone();
    let worker_name = worker_name(&consumer);

    info!(
        worker_name = %worker_name,
        subscription = %consumer.subscription,
        service_type = %consumer.service_type,
        dry_run = consumer.dry_run,
        "Touchline worker starting"
    );

    let broker = RedisBroker::from_url(&config.redis.url, &config.redis.key_prefix)?;
    match broker.subscription_exists(&topic, &consumer.subscription).await {
        Ok(true) => {}
        Ok(false) => warn!(
            subscription = %consumer.subscription,
            "Subscription does not exist yet, provision it through the API"
        ),
        Err(e) => warn!(error = %e, "Could not check subscription, continuing"),
    }

    let receiver = broker.receiver(&topic, &consumer.subscription, &worker_name);
    let sink = consumer.build_sink();
    let pipeline = Arc::new(MessagePipeline::new(sink, consumer.profile()));
    let processor = Processor::new(Arc::new(receiver), pipeline).with_receive_wait(consumer.receive_wait());

    // Setup graceful shutdown
    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    let running = tokio::spawn(processor.run(shutdown.clone()));
    shutdown.cancelled().await;

    info!("Shutdown signal received, finishing current message...");
    match shutdown.drain(running).await {
        Some(Ok(stats)) => info!(
            completed = stats.completed,
            abandoned = stats.abandoned,
            dead_lettered = stats.dead_lettered,
            "Worker shut down gracefully"
        ),
        Some(Err(e)) => warn!(error = %e, "Processor task failed"),
        None => warn!("Processor did not stop in time, its message lock will lapse"),
    }

    Ok(())
}
