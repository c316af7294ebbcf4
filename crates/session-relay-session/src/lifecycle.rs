//! Session lifecycle: close triggers and their single-resolution signal.

use std::{fmt, sync::Arc, time::Duration};

use session_relay_core::StreamConnection;
use tokio::{sync::watch, time::Instant};

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Maximum session duration elapsed.
    Deadline,
    /// Client disconnected the underlying stream.
    Disconnected,
    /// Protocol handler asked to close.
    HandlerClosed,
    /// Closed from outside the session, e.g. server shutdown.
    Shutdown,
    /// Broker subscription ended; the session is unreachable.
    SubscriptionLost,
}

impl CloseReason {
    /// Status used to finalize the underlying stream.
    #[must_use]
    pub const fn terminal_status(self) -> u16 {
        match self {
            Self::Deadline | Self::HandlerClosed | Self::Shutdown => 200,
            Self::Disconnected => 499,
            Self::SubscriptionLost => 503,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deadline => "deadline",
            Self::Disconnected => "disconnected",
            Self::HandlerClosed => "handler_closed",
            Self::Shutdown => "shutdown",
            Self::SubscriptionLost => "subscription_lost",
        };
        f.write_str(s)
    }
}

/// Close signal that resolves exactly once.
///
/// The first [`CloseSignal::trigger`] wins; later triggers are no-ops and
/// report the original reason. Clones share state.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request closure. Returns the reason that actually won.
    pub fn trigger(&self, reason: CloseReason) -> CloseReason {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        self.reason().unwrap_or(reason)
    }

    /// The winning reason, if closure was requested.
    #[must_use]
    pub fn reason(&self) -> Option<CloseReason> {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until closure is requested.
    pub async fn wait(&self) -> CloseReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                return std::future::pending().await;
            }
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Races the deadline timer, the stream's disconnect observer and the
/// explicit close signal.
pub struct LifecycleSupervisor {
    signal: CloseSignal,
    deadline: Instant,
    stream: Arc<dyn StreamConnection>,
}

impl LifecycleSupervisor {
    /// Start supervising; the deadline is measured from now.
    #[must_use]
    pub fn new(
        signal: CloseSignal,
        max_duration: Duration,
        stream: Arc<dyn StreamConnection>,
    ) -> Self {
        Self {
            signal,
            deadline: Instant::now() + max_duration,
            stream,
        }
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub const fn signal(&self) -> &CloseSignal {
        &self.signal
    }

    /// Resolves with the first reason to fire. Dropping the future
    /// disarms the timer and detaches the disconnect observer.
    pub async fn closed(&self) -> CloseReason {
        tokio::select! {
            reason = self.signal.wait() => reason,
            () = tokio::time::sleep_until(self.deadline) => {
                self.signal.trigger(CloseReason::Deadline)
            }
            () = self.stream.disconnected() => {
                self.signal.trigger(CloseReason::Disconnected)
            }
        }
    }
}
