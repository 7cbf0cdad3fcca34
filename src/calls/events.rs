//! Notifications for the embedding application.

use std::time::Duration;
use tokio::sync::broadcast;

use super::signaling::Identity;
use super::state::{CallStatus, EndReason};

// The size of the broadcast channel buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotification {
    StateChanged {
        peer: Identity,
        from: CallStatus,
        to: CallStatus,
    },
    /// A call-request arrived while idle; the local user should accept or decline.
    IncomingCall { from: Identity },
    /// A call-request arrived while busy and was declined automatically.
    RejectedWhileBusy { from: Identity },
    MuteChanged { peer: Identity, muted: bool },
    /// Periodic while active.
    Duration { peer: Identity, elapsed: Duration },
    /// The session is gone and every resource it held has been released.
    Ended {
        peer: Identity,
        reason: EndReason,
        duration: Option<Duration>,
    },
}

/// Broadcasts [`CallNotification`]s to any number of subscribers.
///
/// Emitting never blocks; slow subscribers lag and lose the oldest
/// notifications.
#[derive(Debug, Clone)]
pub struct CallEventBus {
    tx: broadcast::Sender<CallNotification>,
}

impl CallEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity.max(1)).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: CallNotification) {
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
