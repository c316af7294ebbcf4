//! Per-process registry of open sessions.

use std::{collections::HashMap, sync::Arc, sync::RwLock};

use session_relay_core::{ProtocolHandler, SessionId, StreamConnection};
use tokio::time::Instant;

use crate::lifecycle::{CloseReason, CloseSignal};

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session already registered: {0}")]
    AlreadyRegistered(SessionId),
    #[error("Registry error: {0}")]
    Internal(String),
}

/// Live session state held by the registry: the streamed connection and
/// the handler bound to it.
pub struct SessionEntry {
    handler: Arc<dyn ProtocolHandler>,
    stream: Arc<dyn StreamConnection>,
    signal: CloseSignal,
    created_at: Instant,
    deadline: Instant,
}

impl SessionEntry {
    #[must_use]
    pub fn new(
        handler: Arc<dyn ProtocolHandler>,
        stream: Arc<dyn StreamConnection>,
        signal: CloseSignal,
        deadline: Instant,
    ) -> Self {
        Self {
            handler,
            stream,
            signal,
            created_at: Instant::now(),
            deadline,
        }
    }

    #[must_use]
    pub fn stream(&self) -> &Arc<dyn StreamConnection> {
        &self.stream
    }

    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Maps session ids to their handlers within one process instance.
///
/// Only the relay that owns a session writes its entry. Nothing here is
/// shared across processes; those address sessions through broker topics.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session.
    ///
    /// # Errors
    /// Returns [`RegistryError::AlreadyRegistered`] rather than replacing a
    /// live session.
    pub fn register(&self, id: SessionId, entry: SessionEntry) -> Result<(), RegistryError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| RegistryError::Internal(e.to_string()))?;

        if sessions.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        sessions.insert(id, entry);
        Ok(())
    }

    /// Look up the handler bound to a session.
    ///
    /// # Errors
    /// Returns error if the registry lock is poisoned.
    pub fn lookup(&self, id: &SessionId) -> Result<Option<Arc<dyn ProtocolHandler>>, RegistryError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| RegistryError::Internal(e.to_string()))?
            .get(id)
            .map(|entry| Arc::clone(&entry.handler)))
    }

    /// Remove a session. Removing an unknown id is a no-op.
    ///
    /// Returns whether an entry was removed.
    ///
    /// # Errors
    /// Returns error if the registry lock is poisoned.
    pub fn remove(&self, id: &SessionId) -> Result<bool, RegistryError> {
        Ok(self
            .sessions
            .write()
            .map_err(|e| RegistryError::Internal(e.to_string()))?
            .remove(id)
            .is_some())
    }

    /// Look up the live stream of a session.
    ///
    /// # Errors
    /// Returns error if the registry lock is poisoned.
    pub fn stream(&self, id: &SessionId) -> Result<Option<Arc<dyn StreamConnection>>, RegistryError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| RegistryError::Internal(e.to_string()))?
            .get(id)
            .map(|entry| Arc::clone(&entry.stream)))
    }

    /// Ask a session to close. Cleanup runs in the session's own relay task.
    ///
    /// # Errors
    /// Returns error if the registry lock is poisoned.
    pub fn close(&self, id: &SessionId) -> Result<bool, RegistryError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| RegistryError::Internal(e.to_string()))?;

        Ok(sessions.get(id).is_some_and(|entry| {
            entry.signal.trigger(CloseReason::Shutdown);
            true
        }))
    }

    /// Ask every session to close. Returns how many were signalled.
    ///
    /// # Errors
    /// Returns error if the registry lock is poisoned.
    pub fn close_all(&self) -> Result<usize, RegistryError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| RegistryError::Internal(e.to_string()))?;

        for entry in sessions.values() {
            entry.signal.trigger(CloseReason::Shutdown);
        }
        Ok(sessions.len())
    }

    /// Deadline of a registered session.
    #[must_use]
    pub fn deadline(&self, id: &SessionId) -> Option<Instant> {
        self.sessions.read().ok()?.get(id).map(SessionEntry::deadline)
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().is_ok_and(|s| s.contains_key(id))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use session_relay_core::{
        ChannelStream, HandlerError, ResponseSink, StreamFrame, SyntheticRequest,
    };

    use super::*;

    struct Noop;

    #[async_trait]
    impl ProtocolHandler for Noop {
        async fn handle(
            &self,
            _request: SyntheticRequest,
            sink: &mut ResponseSink,
        ) -> Result<(), HandlerError> {
            sink.write_head(204);
            Ok(())
        }
    }

    fn entry() -> (SessionEntry, CloseSignal) {
        let signal = CloseSignal::new();
        let (stream, _rx) = ChannelStream::new(1);
        let entry = SessionEntry::new(Arc::new(Noop), Arc::new(stream), signal.clone(), Instant::now());
        (entry, signal)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        registry.register(id.clone(), entry().0).unwrap();

        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&id).unwrap().is_some());
        assert!(registry.lookup(&SessionId::from("missing")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lookup_stream_reaches_live_connection() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        let (stream, mut rx) = ChannelStream::new(4);
        let entry = SessionEntry::new(
            Arc::new(Noop),
            Arc::new(stream),
            CloseSignal::new(),
            Instant::now(),
        );
        registry.register(id.clone(), entry).unwrap();

        let stream = registry.stream(&id).unwrap().unwrap();
        stream.send(Bytes::from("hi")).await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamFrame::Data(Bytes::from("hi"))));
        assert!(registry.stream(&SessionId::from("missing")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_refuses_to_overwrite() {
        let registry = SessionRegistry::new();
        let id = SessionId::from("dup");
        registry.register(id.clone(), entry().0).unwrap();

        let err = registry.register(id.clone(), entry().0).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(ref dup) if *dup == id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        registry.register(id.clone(), entry().0).unwrap();

        assert!(registry.remove(&id).unwrap());
        assert!(!registry.remove(&id).unwrap());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_signals_session() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        let (entry, signal) = entry();
        registry.register(id.clone(), entry).unwrap();

        assert!(registry.close(&id).unwrap());
        assert_eq!(signal.reason(), Some(CloseReason::Shutdown));
        assert!(!registry.close(&SessionId::from("missing")).unwrap());
        // Entry stays until the owning relay cleans up.
        assert!(registry.contains(&id));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = SessionRegistry::new();
        let (a, sig_a) = entry();
        let (b, sig_b) = entry();
        registry.register(SessionId::generate(), a).unwrap();
        registry.register(SessionId::generate(), b).unwrap();

        assert_eq!(registry.close_all().unwrap(), 2);
        assert!(sig_a.is_closed());
        assert!(sig_b.is_closed());
    }
}
