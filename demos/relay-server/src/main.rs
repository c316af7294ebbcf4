//! Relay server demo: an SSE echo session reachable from any instance.
//!
//! Run with: cargo run -p relay-server
//!
//! Open a stream with `curl -N http://localhost:3000/sse`, then post to the
//! advertised endpoint:
//!
//! ```text
//! curl -X POST 'http://localhost:3000/message?sessionId=<id>' -d '{"hello":"world"}'
//! ```
//!
//! A second instance listens on the next port and shares the broker, so
//! the message can also be posted there. Set `RELAY_REDIS_URL` and build
//! with `--features redis` to share sessions between server processes.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use session_relay_core::{
    Broker, HandlerError, MemoryBroker, ProtocolHandler, RelayConfig, ResponseSink,
    StreamConnection, SyntheticRequest,
};
use session_relay_session::{InboundRelay, SessionContext, SessionRegistry};
use session_relay_transport::{OutboundRelay, RelayState, create_relay_router};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Writes every relayed body to the session's event stream and
/// acknowledges it. A body of `close` ends the session.
struct EchoHandler {
    ctx: SessionContext,
}

#[async_trait]
impl ProtocolHandler for EchoHandler {
    async fn handle(
        &self,
        mut request: SyntheticRequest,
        sink: &mut ResponseSink,
    ) -> Result<(), HandlerError> {
        let body = request.take_body();

        if body.as_ref() == b"close" {
            sink.write_head(202);
            sink.end("Closing");
            self.ctx.close();
            return Ok(());
        }

        self.ctx
            .stream
            .send(body)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))?;

        sink.write_head(202);
        sink.end("Accepted");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::from_env().context("Invalid relay configuration")?;
    let broker = connect_broker(&config).await?;

    // Two instances sharing one broker: a stream opened on either can be
    // addressed through the other.
    let primary = Instance::new(&config, Arc::clone(&broker));
    let peer = Instance::new(&config, broker);
    let peer_port = config
        .bind_addr
        .port()
        .checked_add(1)
        .context("No free port after the bind address for the peer instance")?;
    let peer_addr = SocketAddr::new(config.bind_addr.ip(), peer_port);

    tracing::info!(
        max_session_duration = ?config.max_session_duration(),
        request_timeout = ?config.request_timeout,
        "Starting relay instances on http://{} and http://{peer_addr}",
        config.bind_addr
    );

    tokio::try_join!(primary.serve(config.bind_addr), peer.serve(peer_addr))?;
    Ok(())
}

/// One relay process worth of state: its own registry and routes.
struct Instance {
    registry: Arc<SessionRegistry>,
    app: Router,
}

impl Instance {
    fn new(config: &RelayConfig, broker: Arc<dyn Broker>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let factory = |ctx: &SessionContext| -> Arc<dyn ProtocolHandler> {
            Arc::new(EchoHandler { ctx: ctx.clone() })
        };
        let inbound = InboundRelay::new(
            Arc::clone(&registry),
            Arc::clone(&broker),
            Arc::new(factory),
            config.max_session_duration(),
        );
        let outbound = OutboundRelay::new(broker, config.request_timeout);
        let app = create_relay_router(RelayState::new(inbound, outbound))
            .layer(CorsLayer::permissive());

        Self { registry, app }
    }

    async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        tracing::info!("Server listening on http://{addr}");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal(self.registry))
            .await
            .with_context(|| format!("Server error on {addr}"))
    }
}

#[cfg(feature = "redis")]
async fn connect_broker(config: &RelayConfig) -> anyhow::Result<Arc<dyn Broker>> {
    if let Some(url) = &config.redis_url {
        let broker =
            session_relay_core::broker::RedisBroker::connect(url, &config.redis_connection)
                .await
                .context("Failed to connect to Redis")?;
        tracing::info!("Using Redis broker");
        return Ok(Arc::new(broker));
    }
    tracing::info!("Using in-memory broker");
    Ok(Arc::new(MemoryBroker::new()))
}

#[cfg(not(feature = "redis"))]
async fn connect_broker(config: &RelayConfig) -> anyhow::Result<Arc<dyn Broker>> {
    if config.redis_url.is_some() {
        tracing::warn!("RELAY_REDIS_URL is set but the redis feature is disabled");
    }
    tracing::info!("Using in-memory broker");
    Ok(Arc::new(MemoryBroker::new()))
}

/// How long shutdown waits for sessions to finish cleanup.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Wait for ctrl-c, then ask every open session to close so their
/// streams end before the server drains.
async fn shutdown_signal(registry: Arc<SessionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        return;
    }

    match registry.close_all() {
        Ok(count) => tracing::info!(sessions = count, "Shutting down"),
        Err(e) => tracing::error!("Failed to close sessions: {e}"),
    }

    drain_sessions(&registry, SHUTDOWN_DRAIN).await;
}

/// Wait for relay tasks to finalize their streams. Returns whether every
/// session was cleaned up in time.
async fn drain_sessions(registry: &SessionRegistry, within: Duration) -> bool {
    let drained = tokio::time::timeout(within, async {
        while !registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            sessions = registry.len(),
            "Shutdown drain timed out after {within:?} with sessions still open"
        );
        return false;
    }
    true
}
