//! Touchline Server - Event Collection and Subscription Management
//!
//! Accepts championship events over HTTP and publishes them to the shared
//! topic; provisions per-client subscriptions on the same broker.
//!
//! ## Configuration
//!
//! `config/touchline.toml` (or `TOUCHLINE_CONFIG`), with environment overrides:
//! - `REDIS_URL`: Redis connection string
//! - `TOUCHLINE_API_KEY`: Bearer token for `/api` routes
//! - `PORT`: Listen port (default: 3000)
//! - `RUST_LOG` / `LOG_FORMAT`: Logging level and format

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use touchline::api::{self, AppState};
use touchline::config::TouchlineConfig;
use touchline::shutdown::ShutdownSignal;
use touchline::{EventPublisher, RedisBroker, SubscriptionManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    touchline::logging::init();

    // 2. Load Configuration
    let config = TouchlineConfig::load()?;
    if config.server.api_key.is_none() {
        warn!("TOUCHLINE_API_KEY not set, /api routes are unauthenticated. DO NOT USE IN PRODUCTION.");
    }

    // 3. Connect the broker
    let broker = Arc::new(RedisBroker::from_url(&config.redis.url, &config.redis.key_prefix)?);
    let topic = config.broker.topic.clone();

    let publisher = EventPublisher::new(broker.clone(), &topic, config.producer.identity())
        .with_time_to_live(config.broker.message_ttl());
    let subscriptions = SubscriptionManager::new(broker.clone(), &topic)
        .with_options(config.broker.subscription_options());

    let state = Arc::new(
        AppState::new(publisher, subscriptions, broker).with_api_key(config.server.api_key.clone()),
    );

    // 4. Build Router with Auth Middleware
    let app = api::router(state);

    // 5. Start Server
    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(addr = %addr, topic = %topic, "Touchline server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    info!("Touchline server stopped");
    Ok(())
}
