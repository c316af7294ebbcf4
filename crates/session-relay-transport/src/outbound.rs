//! Request-side relay.
//!
//! Sends a one-shot request into a session held open by some other
//! process and waits for the correlated response.
//!
//! Limitation: a session id with no live subscriber is indistinguishable
//! from a slow session. The message is dropped by the broker and the
//! caller sees [`OutboundError::RequestTimeout`] once the window elapses.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use session_relay_core::{
    Broker, BrokerError, Headers, RelayedMessage, RelayedResponse, SessionId, Subscription,
    protocol::{request_topic, response_topic},
};
use tracing::{debug, warn};

/// Request-side relay error.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    /// No response arrived in time. Also what an unknown session looks like.
    #[error("Timed out after {timeout:?} waiting for response {request_id} from session {session_id}")]
    RequestTimeout {
        session_id: SessionId,
        request_id: String,
        timeout: Duration,
    },
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Request to relay into a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: String,
}

impl OutboundRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Publishes requests to `requests:{session}` and waits on
/// `responses:{session}:{request}`.
#[derive(Clone)]
pub struct OutboundRelay {
    broker: Arc<dyn Broker>,
    default_timeout: Duration,
}

impl OutboundRelay {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, default_timeout: Duration) -> Self {
        Self {
            broker,
            default_timeout,
        }
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Relay with the configured default timeout.
    ///
    /// # Errors
    /// See [`OutboundRelay::relay`].
    pub async fn relay_default(
        &self,
        session_id: &SessionId,
        request: OutboundRequest,
    ) -> Result<RelayedResponse, OutboundError> {
        self.relay(session_id, request, self.default_timeout).await
    }

    /// Relay a request into a session and wait for its response.
    ///
    /// The response subscription is set up before publishing and is
    /// released exactly once, including when this future is dropped.
    ///
    /// # Errors
    /// Returns [`OutboundError::RequestTimeout`] if nothing arrives within
    /// `timeout`, or [`OutboundError::Broker`] if the broker is unreachable.
    pub async fn relay(
        &self,
        session_id: &SessionId,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<RelayedResponse, OutboundError> {
        let message = RelayedMessage::new(request.method, request.url, request.headers, request.body);
        let request_id = message.request_id.clone();
        let payload = message.encode()?;

        let mut responses = self
            .broker
            .subscribe(&response_topic(session_id, &request_id))
            .await?;

        let result = self
            .exchange(session_id, &request_id, payload, &mut responses, timeout)
            .await;
        responses.unsubscribe();
        result
    }

    async fn exchange(
        &self,
        session_id: &SessionId,
        request_id: &str,
        payload: Bytes,
        responses: &mut Subscription,
        timeout: Duration,
    ) -> Result<RelayedResponse, OutboundError> {
        let delivered = self.broker.publish(&request_topic(session_id), payload).await?;
        debug!(session_id = %session_id, request_id, delivered, "Relayed request published");

        match tokio::time::timeout(timeout, next_response(responses)).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(BrokerError::Unavailable("response subscription closed".to_owned()).into()),
            Err(_) => {
                warn!(session_id = %session_id, request_id, ?timeout, "Relayed request timed out");
                Err(OutboundError::RequestTimeout {
                    session_id: session_id.clone(),
                    request_id: request_id.to_owned(),
                    timeout,
                })
            }
        }
    }
}

async fn next_response(responses: &mut Subscription) -> Option<RelayedResponse> {
    while let Some(payload) = responses.recv().await {
        match RelayedResponse::decode(&payload) {
            Ok(response) => return Some(response),
            Err(e) => warn!(topic = responses.topic(), error = %e, "Ignoring malformed response"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use session_relay_core::{
        ChannelStream, HandlerError, MemoryBroker, ProtocolHandler, ResponseSink, StreamFrame,
        SyntheticRequest,
    };
    use session_relay_session::{InboundRelay, OpenSession, SessionContext, SessionRegistry};
    use tokio::{sync::mpsc, time::Instant};
    use tokio_test::assert_ok;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);
    const MAX: Duration = Duration::from_secs(55);

    /// `/x` answers `200 ok`; anything else echoes method, url and body.
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProtocolHandler for Echo {
        async fn handle(
            &self,
            mut request: SyntheticRequest,
            sink: &mut ResponseSink,
        ) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(request.url().to_owned());
            let body = request.take_body();
            sink.write_head(200);
            if request.url() == "/x" {
                sink.end("ok");
            } else {
                let body = String::from_utf8_lossy(&body);
                sink.end(format!("{} {} {body}", request.method(), request.url()));
            }
            Ok(())
        }
    }

    struct Fixture {
        broker: MemoryBroker,
        inbound: InboundRelay,
        outbound: OutboundRelay,
        echo: Arc<Echo>,
    }

    fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let echo = Arc::new(Echo::default());
        let handler = Arc::clone(&echo);
        let factory = move |_: &SessionContext| -> Arc<dyn ProtocolHandler> {
            Arc::clone(&handler) as Arc<dyn ProtocolHandler>
        };
        let inbound = InboundRelay::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(broker.clone()),
            Arc::new(factory),
            MAX,
        );
        // The request side lives in "another process": it shares only the broker.
        let outbound = OutboundRelay::new(Arc::new(broker.clone()), TIMEOUT);
        Fixture {
            broker,
            inbound,
            outbound,
            echo,
        }
    }

    async fn open(f: &Fixture) -> (OpenSession, mpsc::Receiver<StreamFrame>) {
        let (stream, rx) = ChannelStream::new(8);
        (f.inbound.open(Arc::new(stream)).await.unwrap(), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_through_open_session() {
        let f = fixture();
        let (session, _rx) = open(&f).await;

        let started = Instant::now();
        let response = f
            .outbound
            .relay(session.id(), OutboundRequest::new("GET", "/x"), TIMEOUT)
            .await
            .unwrap();

        assert_eq!(response, RelayedResponse::new(200, "ok"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.broker.topic_count(), 1, "only the session's request topic remains");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_times_out() {
        let f = fixture();
        let started = Instant::now();

        let err = f
            .outbound
            .relay_default(&SessionId::from("never-opened"), OutboundRequest::new("GET", "/x"))
            .await
            .unwrap_err();

        assert!(matches!(err, OutboundError::RequestTimeout { timeout, .. } if timeout == TIMEOUT));
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(f.broker.topic_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_times_out_without_response() {
        let f = fixture();
        let (session, _rx) = open(&f).await;
        let id = session.id().clone();
        session.closed().await.unwrap();

        let err = f
            .outbound
            .relay(&id, OutboundRequest::new("GET", "/x"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::RequestTimeout { .. }));
        assert!(f.echo.seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_does_not_break_session() {
        let f = fixture();
        let (session, _rx) = open(&f).await;

        f.broker
            .publish(&request_topic(session.id()), Bytes::from_static(b"\x00garbage"))
            .await
            .unwrap();

        let response = f
            .outbound
            .relay(
                session.id(),
                OutboundRequest::new("POST", "/message").with_body(r#"{"id":1}"#),
                TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(response.body, r#"POST /message {"id":1}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_requests_keep_order() {
        let f = fixture();
        let (session, _rx) = open(&f).await;

        for url in ["/first", "/second", "/third"] {
            assert_ok!(
                f.outbound
                    .relay(session.id(), OutboundRequest::new("GET", url), TIMEOUT)
                    .await
            );
        }
        assert_eq!(*f.echo.seen.lock().unwrap(), ["/first", "/second", "/third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_reach_the_handler() {
        struct HeaderEcho;

        #[async_trait]
        impl ProtocolHandler for HeaderEcho {
            async fn handle(
                &self,
                request: SyntheticRequest,
                sink: &mut ResponseSink,
            ) -> Result<(), HandlerError> {
                let auth = request
                    .header("authorization")
                    .and_then(|v| v.values().next())
                    .unwrap_or("none")
                    .to_owned();
                sink.write_head(202);
                sink.end(auth);
                Ok(())
            }
        }

        let broker = MemoryBroker::new();
        let factory =
            |_: &SessionContext| -> Arc<dyn ProtocolHandler> { Arc::new(HeaderEcho) };
        let inbound = InboundRelay::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(broker.clone()),
            Arc::new(factory),
            MAX,
        );
        let outbound = OutboundRelay::new(Arc::new(broker), TIMEOUT);
        let (stream, _rx) = ChannelStream::new(8);
        let session = inbound.open(Arc::new(stream)).await.unwrap();

        let mut headers = Headers::new();
        headers.insert("Authorization".into(), "Bearer abc".into());
        let response = outbound
            .relay_default(
                session.id(),
                OutboundRequest::new("POST", "/message").with_headers(headers),
            )
            .await
            .unwrap();
        assert_eq!(response, RelayedResponse::new(202, "Bearer abc"));
    }

    #[tokio::test]
    async fn test_broker_down_fails_fast() {
        let f = fixture();
        f.broker.disconnect();
        let err = f
            .outbound
            .relay(&SessionId::from("s"), OutboundRequest::new("GET", "/x"), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::Broker(BrokerError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_releases_subscription() {
        let f = fixture();
        let outbound = f.outbound.clone();
        let waiting = tokio::spawn(async move {
            outbound
                .relay(&SessionId::from("nobody"), OutboundRequest::new("GET", "/x"), TIMEOUT)
                .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.broker.topic_count(), 1);

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert_eq!(f.broker.topic_count(), 0);
    }
}
