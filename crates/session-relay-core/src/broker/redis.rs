//! Redis pub/sub broker (feature-gated).
//!
//! Publishing goes through a shared `ConnectionManager`. Every
//! subscription gets its own pub/sub connection and a forwarding task;
//! unsubscribing aborts the task, which drops the connection.

use std::{fmt::Display, future::Future, time::Duration};

use ::redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, Subscription};
use crate::config::RedisConnectionConfig;

fn unavailable(e: &::redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

/// Run a broker call, failing with [`BrokerError::Unavailable`] if it
/// errors or does not finish within `timeout`.
async fn bounded<T, E, F>(timeout: Duration, what: &str, call: F) -> Result<T, BrokerError>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BrokerError::Unavailable(format!("{what}: {e}"))),
        Err(_) => Err(BrokerError::Unavailable(format!("{what}: timed out after {timeout:?}"))),
    }
}

/// Redis-backed broker for multi-instance deployments.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    publisher: ConnectionManager,
    /// Bounds each subscription's connect and `SUBSCRIBE`.
    subscribe_timeout: Duration,
}

impl RedisBroker {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns [`BrokerError::Unavailable`] if the URL is invalid or no
    /// connection could be established after the configured retries.
    pub async fn connect(url: &str, config: &RedisConnectionConfig) -> Result<Self, BrokerError> {
        info!(
            "Connecting to Redis broker (timeout={}s, retries={})",
            config.connection_timeout_secs, config.initial_connection_retries
        );

        let client = Client::open(url).map_err(|e| unavailable(&e))?;
        let publisher = Self::connect_with_retry(&client, config).await?;

        info!("Connected to Redis broker");
        Ok(Self {
            client,
            publisher,
            subscribe_timeout: Duration::from_secs(config.connection_timeout_secs),
        })
    }

    /// Connect with exponential backoff.
    async fn connect_with_retry(
        client: &Client,
        config: &RedisConnectionConfig,
    ) -> Result<ConnectionManager, BrokerError> {
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .set_response_timeout(Duration::from_secs(config.response_timeout_secs))
            .set_number_of_retries(config.reconnection_retries)
            .set_exponent_base(config.retry_exponent_base)
            .set_max_delay(config.max_retry_delay_ms);

        let max_retries = config.initial_connection_retries;
        let mut delay_ms = config.initial_retry_delay_ms;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            match ConnectionManager::new_with_config(client.clone(), manager_config.clone()).await {
                Ok(manager) => return Ok(manager),
                Err(e) => {
                    if attempt < max_retries {
                        warn!(
                            "Redis connection attempt {}/{} failed, retrying in {delay_ms}ms: {e}",
                            attempt + 1,
                            max_retries + 1,
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        delay_ms = (delay_ms * 2).min(config.max_retry_delay_ms);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(BrokerError::Unavailable(format!(
            "failed to connect after {} attempts: {}",
            max_retries + 1,
            last_error.map_or_else(|| "unknown error".to_owned(), |e| e.to_string())
        )))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BrokerError> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn
            .publish(topic, payload.to_vec())
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let pubsub = bounded(self.subscribe_timeout, "subscribe", async {
            let mut pubsub = self.client.get_async_pubsub().await?;
            pubsub.subscribe(topic).await?;
            Ok::<_, ::redis::RedisError>(pubsub)
        })
        .await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let owned_topic = topic.to_owned();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                if sender
                    .send(Bytes::copy_from_slice(msg.get_payload_bytes()))
                    .is_err()
                {
                    break;
                }
            }
            debug!(topic = %owned_topic, "Redis subscription stream ended");
        });

        Ok(Subscription::new(topic, receiver, move || forwarder.abort()))
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_call_fails_fast_when_stalled() {
        let started = tokio::time::Instant::now();
        let stalled = std::future::pending::<Result<(), ::redis::RedisError>>();

        let err = assert_err!(bounded(Duration::from_secs(5), "subscribe", stalled).await);
        assert!(matches!(err, BrokerError::Unavailable(ref msg) if msg.contains("timed out")));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_bounded_call_maps_errors() {
        let refused = async {
            Err::<(), _>(::redis::RedisError::from((
                ::redis::ErrorKind::IoError,
                "connection refused",
            )))
        };
        let err = assert_err!(bounded(Duration::from_secs(5), "subscribe", refused).await);
        assert!(matches!(err, BrokerError::Unavailable(ref msg) if msg.contains("refused")));

        let ready = async { Ok::<_, ::redis::RedisError>(7) };
        let value = assert_ok!(bounded(Duration::from_secs(5), "subscribe", ready).await);
        assert_eq!(value, 7);
    }
}
