//! Redis pub/sub transport for transition events (optional).
//!
//! Lets notification workers run in a different process from the
//! orchestrators. Pub/sub is not durable: subscribers that are offline miss
//! events. Acceptable here because notifications are best-effort.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use thiserror::Error;
use tracing::warn;

use consular_events::{EventBus, Subscription, TransitionEvent};

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus carrying JSON-encoded [`TransitionEvent`]s.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<TransitionEvent> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: TransitionEvent) -> Result<(), Self::Error> {
        let payload =
            serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<TransitionEvent> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Forwarding thread; exits when the subscription is dropped or the
        // connection fails (the subscription then reports Disconnected).
        let spawned = thread::Builder::new()
            .name(format!("redis-sub-{channel}"))
            .spawn(move || {
                let mut conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(err) => {
                        warn!(error = %err, "redis subscription connection failed");
                        return;
                    }
                };

                let mut pubsub = conn.as_pubsub();
                if let Err(err) = pubsub.subscribe(&channel) {
                    warn!(channel = %channel, error = %err, "redis subscribe failed");
                    return;
                }

                loop {
                    let msg = match pubsub.get_message() {
                        Ok(m) => m,
                        Err(err) => {
                            warn!(channel = %channel, error = %err, "redis subscription closed");
                            return;
                        }
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let event: TransitionEvent = match serde_json::from_str(&payload) {
                        Ok(e) => e,
                        Err(err) => {
                            warn!(channel = %channel, error = %err, "dropping malformed event");
                            continue;
                        }
                    };

                    if tx.send(event).is_err() {
                        return;
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "failed to start redis subscription thread");
        }

        Subscription::new(rx)
    }
}
