//! Redis pub/sub composite sink (optional).
//!
//! Pub/sub is not durable: a composite published while no subscriber is
//! connected is lost to that subscriber. Composite ids are deterministic per
//! correlation id, so downstream stages can de-duplicate replays.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::{debug, warn};

use docreduce_events::{CompositeEvent, EventBus, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum RedisSinkError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("failed to serialize composite: {0}")]
    Serialize(String),
}

/// Publishes composite events as JSON on a Redis channel.
#[derive(Debug, Clone)]
pub struct RedisPubSubSink {
    client: redis::Client,
    channel: String,
}

impl RedisPubSubSink {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisSinkError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisSinkError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<CompositeEvent> for RedisPubSubSink {
    type Error = RedisSinkError;

    fn publish(&self, message: CompositeEvent) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisSinkError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisSinkError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisSinkError::Redis(e.to_string()))?;

        debug!(
            channel = %self.channel,
            correlation_id = %message.correlation_id,
            receivers,
            "composite published to redis"
        );
        Ok(())
    }

    fn subscribe(&self) -> Subscription<CompositeEvent> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();
        let channel = self.channel.clone();

        thread::spawn(move || {
            if let Err(e) = forward_composites(&client, &channel, &tx) {
                warn!(channel = %channel, error = %e, "redis subscription ended");
            }
        });

        Subscription::new(rx)
    }
}

/// Pump decoded composites from `channel` into `tx` until either side closes.
fn forward_composites(
    client: &redis::Client,
    channel: &str,
    tx: &mpsc::Sender<CompositeEvent>,
) -> redis::RedisResult<()> {
    let mut conn = client.get_connection()?;
    let mut pubsub = conn.as_pubsub();
    pubsub.subscribe(channel)?;

    loop {
        let payload: String = match pubsub.get_message()?.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(channel, error = %e, "ignoring non-text payload");
                continue;
            }
        };

        match serde_json::from_str::<CompositeEvent>(&payload) {
            Ok(composite) => {
                if tx.send(composite).is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!(channel, error = %e, "skipping undecodable composite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_urls() {
        assert!(matches!(
            RedisPubSubSink::new("not a url", "composites"),
            Err(RedisSinkError::Redis(_))
        ));
    }

    #[test]
    fn opening_a_client_does_not_connect() {
        let sink = RedisPubSubSink::new("redis://127.0.0.1:6379", "composites").unwrap();
        assert_eq!(sink.channel(), "composites");
    }
}
