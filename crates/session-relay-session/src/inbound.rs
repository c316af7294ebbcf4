//! Stream-side relay.
//!
//! Owns a session from the moment its stream opens: mints the id, binds
//! a protocol handler, subscribes to `requests:{session}`, replays each
//! relayed message into the handler and publishes the captured response
//! to `responses:{session}:{request}`. Cleanup runs exactly once, after
//! the first of deadline, disconnect or explicit close.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::FutureExt;
use session_relay_core::{
    Broker, BrokerError, ProtocolHandler, RelayedMessage, ResponseSink, SessionId,
    StreamConnection, Subscription, SyntheticRequest,
    protocol::{request_topic, response_topic},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    lifecycle::{CloseReason, CloseSignal, LifecycleSupervisor},
    registry::{RegistryError, SessionEntry, SessionRegistry},
};

/// Stream-side relay error.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Everything a protocol handler gets to know about its session.
#[derive(Clone)]
pub struct SessionContext {
    /// Session identifier.
    pub id: SessionId,
    /// The live stream this handler is bound to.
    pub stream: Arc<dyn StreamConnection>,
    /// Trigger to close the session from inside the handler.
    pub close: CloseSignal,
}

impl SessionContext {
    /// Ask for the session to be closed.
    pub fn close(&self) {
        self.close.trigger(CloseReason::HandlerClosed);
    }
}

/// Builds one protocol handler per opened session.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, ctx: &SessionContext) -> Arc<dyn ProtocolHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&SessionContext) -> Arc<dyn ProtocolHandler> + Send + Sync,
{
    fn create(&self, ctx: &SessionContext) -> Arc<dyn ProtocolHandler> {
        self(ctx)
    }
}

/// Handle to an opened session.
pub struct OpenSession {
    id: SessionId,
    close: CloseSignal,
    task: JoinHandle<CloseReason>,
}

impl OpenSession {
    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Signal used to close the session from outside.
    #[must_use]
    pub const fn close_signal(&self) -> &CloseSignal {
        &self.close
    }

    /// Wait for the session to be fully cleaned up.
    ///
    /// Returns `None` if the relay task panicked or was aborted.
    pub async fn closed(self) -> Option<CloseReason> {
        self.task.await.ok()
    }
}

/// Opens sessions and runs their relay loops.
#[derive(Clone)]
pub struct InboundRelay {
    registry: Arc<SessionRegistry>,
    broker: Arc<dyn Broker>,
    factory: Arc<dyn HandlerFactory>,
    max_duration: Duration,
}

impl InboundRelay {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        broker: Arc<dyn Broker>,
        factory: Arc<dyn HandlerFactory>,
        max_duration: Duration,
    ) -> Self {
        Self {
            registry,
            broker,
            factory,
            max_duration,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open a session on an accepted stream.
    ///
    /// The session is externally reachable once this returns. If the
    /// broker subscription cannot be established the session is torn
    /// down immediately and the stream is finalized. Dropping the returned
    /// future before it resolves does the same, finalizing with the
    /// disconnect status.
    ///
    /// # Errors
    /// Returns error if registration or subscription fails.
    pub async fn open(&self, stream: Arc<dyn StreamConnection>) -> Result<OpenSession, RelayError> {
        let id = SessionId::generate();
        let close = CloseSignal::new();
        let ctx = SessionContext {
            id: id.clone(),
            stream: Arc::clone(&stream),
            close: close.clone(),
        };
        let handler = self.factory.create(&ctx);
        let supervisor = LifecycleSupervisor::new(close.clone(), self.max_duration, Arc::clone(&stream));

        let entry = SessionEntry::new(
            Arc::clone(&handler),
            Arc::clone(&stream),
            close.clone(),
            supervisor.deadline(),
        );
        if let Err(e) = self.registry.register(id.clone(), entry) {
            stream.finish(500);
            return Err(e.into());
        }
        let mut rollback = OpenRollback {
            id: id.clone(),
            registry: Arc::clone(&self.registry),
            stream: Arc::clone(&stream),
            status: Some(CloseReason::Disconnected.terminal_status()),
        };

        let subscription = match self.broker.subscribe(&request_topic(&id)).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to subscribe, closing session");
                rollback.status = Some(CloseReason::SubscriptionLost.terminal_status());
                return Err(e.into());
            }
        };

        info!(session_id = %id, max_duration = ?self.max_duration, "Session opened");

        let task = SessionTask {
            id: id.clone(),
            handler,
            subscription,
            supervisor,
            registry: Arc::clone(&self.registry),
            broker: Arc::clone(&self.broker),
            stream,
        };

        let task = tokio::spawn(task.run());
        rollback.disarm();
        Ok(OpenSession { id, close, task })
    }
}

/// Undoes a registration when opening stops short of the relay task,
/// including when the `open` future is dropped mid-subscribe.
struct OpenRollback {
    id: SessionId,
    registry: Arc<SessionRegistry>,
    stream: Arc<dyn StreamConnection>,
    /// Terminal status for the stream; `None` once the task owns cleanup.
    status: Option<u16>,
}

impl OpenRollback {
    fn disarm(&mut self) {
        self.status = None;
    }
}

impl Drop for OpenRollback {
    fn drop(&mut self) {
        let Some(status) = self.status.take() else {
            return;
        };
        if let Err(e) = self.registry.remove(&self.id) {
            warn!(session_id = %self.id, error = %e, "Failed to remove session");
        }
        self.stream.finish(status);
        debug!(session_id = %self.id, status, "Session open abandoned");
    }
}

struct SessionTask {
    id: SessionId,
    handler: Arc<dyn ProtocolHandler>,
    subscription: Subscription,
    supervisor: LifecycleSupervisor,
    registry: Arc<SessionRegistry>,
    broker: Arc<dyn Broker>,
    stream: Arc<dyn StreamConnection>,
}

impl SessionTask {
    async fn run(mut self) -> CloseReason {
        let reason = {
            let closing = self.supervisor.closed();
            tokio::pin!(closing);

            loop {
                tokio::select! {
                    biased;

                    reason = &mut closing => break reason,
                    next = self.subscription.recv() => {
                        let Some(payload) = next else {
                            break self.supervisor.signal().trigger(CloseReason::SubscriptionLost);
                        };
                        tokio::select! {
                            biased;

                            reason = &mut closing => break reason,
                            () = relay_message(&self.id, self.handler.as_ref(), self.broker.as_ref(), payload) => {}
                        }
                    }
                }
            }
        };

        self.cleanup(reason)
    }

    fn cleanup(self, reason: CloseReason) -> CloseReason {
        let Self {
            id,
            handler,
            subscription,
            registry,
            stream,
            ..
        } = self;

        subscription.unsubscribe();
        if let Err(e) = registry.remove(&id) {
            warn!(session_id = %id, error = %e, "Failed to remove session");
        }
        drop(handler);
        stream.finish(reason.terminal_status());

        info!(session_id = %id, %reason, "Session closed");
        reason
    }
}

/// Replay one relayed message into the handler and publish its response.
///
/// Failures are logged and swallowed: one bad message never ends the
/// session, and the waiting caller observes a timeout instead.
async fn relay_message(
    session_id: &SessionId,
    handler: &dyn ProtocolHandler,
    broker: &dyn Broker,
    payload: Bytes,
) {
    let message = match RelayedMessage::decode(&payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Dropping malformed relayed message");
            return;
        }
    };

    let request_id = message.request_id.clone();
    debug!(
        session_id = %session_id,
        request_id = %request_id,
        method = %message.method,
        url = %message.url,
        "Relaying message"
    );

    let mut sink = ResponseSink::new();
    let outcome = AssertUnwindSafe(handler.handle(SyntheticRequest::from(message), &mut sink))
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(session_id = %session_id, request_id = %request_id, error = %e, "Handler failed");
            return;
        }
        Err(_) => {
            error!(session_id = %session_id, request_id = %request_id, "Handler panicked");
            return;
        }
    }

    let response = match sink.into_response().encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(session_id = %session_id, request_id = %request_id, error = %e, "Failed to encode response");
            return;
        }
    };

    let topic = response_topic(session_id, &request_id);
    match broker.publish(&topic, response).await {
        Ok(0) => debug!(topic = %topic, "No caller waiting for response"),
        Ok(_) => {}
        Err(e) => warn!(topic = %topic, error = %e, "Failed to publish response"),
    }
}
