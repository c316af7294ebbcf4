//! HTTP surface for relayed sessions.
//!
//! - `GET /sse` opens a session and streams its output as Server-Sent Events
//! - `POST /message?sessionId=...` relays a request into an open session,
//!   wherever in the deployment that session lives

use std::{convert::Infallible, sync::Arc};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{Query, State},
    http::{HeaderMap, Method, Request, StatusCode, Uri},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use bytes::Bytes;
use futures::{StreamExt, future};
use serde::Deserialize;
use session_relay_core::{
    ChannelStream, HandlerError, HeaderValue, Headers, ProtocolHandler, ResponseSink, SessionId,
    StreamFrame, SyntheticRequest,
};
use session_relay_session::InboundRelay;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::outbound::{OutboundError, OutboundRelay, OutboundRequest};

/// Frames buffered per stream before the handler's writes wait.
pub const STREAM_CAPACITY: usize = 64;

/// Path clients post relayed messages to.
pub const MESSAGE_PATH: &str = "/message";

/// Shared state for the relay routes.
#[derive(Clone)]
pub struct RelayState {
    /// Opens sessions held by this instance.
    pub inbound: InboundRelay,
    /// Reaches sessions held by any instance.
    pub outbound: OutboundRelay,
}

impl RelayState {
    #[must_use]
    pub const fn new(inbound: InboundRelay, outbound: OutboundRelay) -> Self {
        Self { inbound, outbound }
    }
}

/// Build the relay router.
///
/// # Example
/// ```ignore
/// let app = create_relay_router(RelayState::new(inbound, outbound));
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn create_relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route(MESSAGE_PATH, post(message_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn sse_handler(State(state): State<RelayState>) -> Response {
    let (stream, frames) = ChannelStream::new(STREAM_CAPACITY);

    let session = match state.inbound.open(Arc::new(stream)).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to open session: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, "Failed to open session").into_response();
        }
    };

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGE_PATH}?sessionId={}", session.id()));

    // Ends at the terminal frame; dropping it is a client disconnect.
    let events = ReceiverStream::new(frames)
        .take_while(|frame| future::ready(matches!(frame, StreamFrame::Data(_))))
        .filter_map(|frame| {
            future::ready(match frame {
                StreamFrame::Data(data) => Some(
                    Event::default()
                        .event("message")
                        .data(String::from_utf8_lossy(&data)),
                ),
                StreamFrame::End { .. } => None,
            })
        });

    let stream = futures::stream::once(future::ready(endpoint))
        .chain(events)
        .map(Ok::<_, Infallible>);

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

async fn message_handler(
    State(state): State<RelayState>,
    Query(query): Query<MessageQuery>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(session_id) = query
        .session_id
        .filter(|id| !id.trim().is_empty())
        .map(SessionId::from)
    else {
        return (StatusCode::BAD_REQUEST, "Missing sessionId").into_response();
    };

    let request = OutboundRequest::new(method.as_str(), uri.to_string())
        .with_headers(collect_headers(&headers))
        .with_body(body);

    match state.outbound.relay_default(&session_id, request).await {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, response.body).into_response()
        }
        Err(OutboundError::RequestTimeout { .. }) => {
            (StatusCode::REQUEST_TIMEOUT, "Request timed out").into_response()
        }
        Err(OutboundError::Broker(e)) => {
            tracing::error!("Broker error relaying to {session_id}: {e}");
            (StatusCode::SERVICE_UNAVAILABLE, "Broker unavailable").into_response()
        }
        Err(OutboundError::Encode(e)) => {
            tracing::error!("Failed to encode relayed message: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Flatten an HTTP header map into wire headers. Repeated headers
/// become a list; values that are not valid UTF-8 are skipped.
#[must_use]
pub fn collect_headers(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for name in headers.keys() {
        let mut values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_owned))
            .collect();
        let value = match values.len() {
            0 => continue,
            1 => HeaderValue::Single(values.remove(0)),
            _ => HeaderValue::Multiple(values),
        };
        out.insert(name.as_str().to_owned(), value);
    }
    out
}

/// Rebuild an `http` request from a synthetic one, for handlers written
/// against axum/tower request types.
///
/// # Errors
/// Returns error if the method, url or a header is not valid HTTP.
pub fn into_http_request(request: SyntheticRequest) -> Result<Request<Body>, axum::http::Error> {
    let (method, url, headers, body) = request.into_parts();
    let mut builder = Request::builder().method(method.as_str()).uri(url);
    for (name, value) in &headers {
        for v in value.values() {
            builder = builder.header(name.as_str(), v);
        }
    }
    builder.body(Body::from(body))
}

/// Maximum response body captured from a routed handler.
const MAX_ROUTED_BODY: usize = 16 * 1024 * 1024;

/// Protocol handler that drives an axum [`Router`] with synthetic requests.
#[derive(Clone)]
pub struct RouterHandler {
    router: Router,
}

impl RouterHandler {
    #[must_use]
    pub const fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl ProtocolHandler for RouterHandler {
    async fn handle(
        &self,
        request: SyntheticRequest,
        sink: &mut ResponseSink,
    ) -> Result<(), HandlerError> {
        let request = into_http_request(request).map_err(|e| HandlerError::Failed(e.to_string()))?;
        let response = match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let status = response.status().as_u16();
        let body: Bytes = to_bytes(response.into_body(), MAX_ROUTED_BODY)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        sink.write_head(status);
        sink.end(body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::header;
    use session_relay_core::{MemoryBroker, RelayedMessage};
    use session_relay_session::{SessionContext, SessionRegistry};

    use super::*;

    fn echo_router() -> Router {
        Router::new().route(
            MESSAGE_PATH,
            post(|headers: HeaderMap, body: String| async move {
                let kind = headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("none")
                    .to_owned();
                (StatusCode::ACCEPTED, format!("{kind}:{body}"))
            }),
        )
    }

    fn state(broker: &MemoryBroker, timeout: Duration) -> RelayState {
        let factory = |_: &SessionContext| -> Arc<dyn ProtocolHandler> {
            Arc::new(RouterHandler::new(echo_router()))
        };
        let inbound = InboundRelay::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(broker.clone()),
            Arc::new(factory),
            Duration::from_secs(55),
        );
        RelayState::new(inbound, OutboundRelay::new(Arc::new(broker.clone()), timeout))
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_missing_session_id_is_bad_request() {
        let app = create_relay_router(state(&MemoryBroker::new(), Duration::from_secs(10)));
        let request = Request::post(MESSAGE_PATH).body(Body::from("{}")).unwrap();
        let (status, _) = call(app.clone(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let request = Request::post("/message?sessionId=").body(Body::empty()).unwrap();
        let (status, _) = call(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = create_relay_router(state(&MemoryBroker::new(), Duration::from_secs(10)));
        let request = Request::get("/nope").body(Body::empty()).unwrap();
        assert_eq!(call(app, request).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_route_rejects_other_methods() {
        let app = create_relay_router(state(&MemoryBroker::new(), Duration::from_secs(10)));
        let request = Request::post("/sse").body(Body::empty()).unwrap();
        assert_eq!(call(app, request).await.0, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_times_out() {
        let app = create_relay_router(state(&MemoryBroker::new(), Duration::from_secs(10)));
        let request = Request::post("/message?sessionId=ghost")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(call(app, request).await.0, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn test_broker_down_is_service_unavailable() {
        let broker = MemoryBroker::new();
        let app = create_relay_router(state(&broker, Duration::from_secs(10)));
        broker.disconnect();
        let request = Request::post("/message?sessionId=s").body(Body::empty()).unwrap();
        assert_eq!(call(app, request).await.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_sse_opens_session_and_message_reaches_it() {
        let broker = MemoryBroker::new();
        let relay_state = state(&broker, Duration::from_secs(10));
        let app = create_relay_router(relay_state.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/sse").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let first = String::from_utf8(first.to_vec()).unwrap();
        assert!(first.starts_with("event: endpoint\ndata: /message?sessionId="));
        let endpoint = first
            .trim_end()
            .trim_start_matches("event: endpoint\ndata: ")
            .to_owned();
        assert_eq!(relay_state.inbound.registry().len(), 1);

        // The message could land on any instance; this one shares the broker.
        let request = Request::post(endpoint.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"jsonrpc":"2.0"}"#))
            .unwrap();
        let (status, text) = call(app, request).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(text, r#"application/json:{"jsonrpc":"2.0"}"#);

        // Client goes away: session is torn down.
        drop(body);
        for _ in 0..100 {
            if relay_state.inbound.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(relay_state.inbound.registry().is_empty());
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_router_handler_maps_synthetic_request() {
        let handler = RouterHandler::new(echo_router());
        let message = RelayedMessage {
            request_id: "r".into(),
            url: "/message?sessionId=s".into(),
            method: "POST".into(),
            body: "hello".into(),
            headers: [("content-type".to_owned(), HeaderValue::from("text/plain"))].into(),
        };
        let mut sink = ResponseSink::new();
        handler
            .handle(SyntheticRequest::from(message), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.status(), Some(202));
        assert_eq!(sink.body().unwrap(), &Bytes::from("text/plain:hello"));
    }

    #[test]
    fn test_collect_headers_groups_repeats() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", "1".parse().unwrap());
        headers.append("x-a", "2".parse().unwrap());
        headers.insert("x-b", "only".parse().unwrap());

        let collected = collect_headers(&headers);
        assert_eq!(
            collected.get("x-a"),
            Some(&HeaderValue::Multiple(vec!["1".into(), "2".into()]))
        );
        assert_eq!(collected.get("x-b"), Some(&HeaderValue::from("only")));
    }

    #[tokio::test]
    async fn test_into_http_request_preserves_parts() {
        let message = RelayedMessage::new("PUT", "/a?b=c", Headers::new(), "body");
        let request = into_http_request(SyntheticRequest::from(message)).unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.uri(), "/a?b=c");
        let body = to_bytes(request.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, Bytes::from("body"));
    }

    #[tokio::test]
    async fn test_invalid_method_is_handler_error() {
        let handler = RouterHandler::new(echo_router());
        let mut sink = ResponseSink::new();
        let request = SyntheticRequest::new("NOT A METHOD", "/", Headers::new(), None);
        assert!(handler.handle(request, &mut sink).await.is_err());
        assert!(sink.status().is_none());
    }
}
