//! Timeout and failure policy.
//!
//! Each session owns at most one armed timeout (dial or negotiation) plus the
//! duration ticker while active. Both are tokio tasks that post back into the
//! state machine's queue; both are aborted when dropped, and every firing is
//! checked against the token currently armed, so a timeout that raced a
//! transition is discarded instead of acted on.

use log::debug;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::CallFailure;
use super::manager::Input;
use super::state::{CallStatus, EndReason, SessionId};
use crate::config::CallConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// No call-accept or call-decline arrived.
    Dial,
    /// Descriptions or connectivity did not complete.
    Negotiation,
}

impl TimerKind {
    /// The state this timer is armed for.
    pub fn armed_for(&self) -> CallStatus {
        match self {
            Self::Dial => CallStatus::Dialing,
            Self::Negotiation => CallStatus::Negotiating,
        }
    }

    /// How the call ends when this timer fires.
    pub fn failure(&self) -> CallFailure {
        match self {
            Self::Dial => CallFailure::Unanswered,
            Self::Negotiation => CallFailure::NegotiationFailed,
        }
    }

    /// The timer a session entering `status` must arm, if any.
    pub fn for_status(status: CallStatus) -> Option<Self> {
        match status {
            CallStatus::Dialing => Some(Self::Dial),
            CallStatus::Negotiating => Some(Self::Negotiation),
            _ => None,
        }
    }
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial => f.write_str("dial"),
            Self::Negotiation => f.write_str("negotiation"),
        }
    }
}

/// Identifies one arming of one timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub session: SessionId,
    pub kind: TimerKind,
    pub(crate) seq: u64,
}

/// Timeout durations derived from [`CallConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub dial: Duration,
    pub negotiation: Duration,
    pub duration_tick: Option<Duration>,
}

impl TimeoutPolicy {
    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            dial: config.dial_timeout(),
            negotiation: config.negotiation_timeout(),
            duration_tick: config.duration_tick(),
        }
    }

    pub fn timeout_for(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::Dial => self.dial,
            TimerKind::Negotiation => self.negotiation,
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::from_config(&CallConfig::default())
    }
}

/// Whether ending a call for `reason` sends call-end to the peer.
///
/// Peer-initiated endings never answer back. Local failures only send if
/// this endpoint already transmitted something for the session; a local
/// hangup always does.
pub fn sends_call_end(reason: EndReason, transmitted: bool) -> bool {
    match reason {
        EndReason::LocalHangup => true,
        EndReason::LocalDecline => false,
        EndReason::Failed(
            CallFailure::Busy | CallFailure::Declined | CallFailure::RemoteHangup,
        ) => false,
        EndReason::Failed(
            CallFailure::Unanswered
            | CallFailure::NegotiationFailed
            | CallFailure::MediaAccessDenied,
        ) => transmitted,
    }
}

/// A spawned timer task, aborted on drop.
#[derive(Debug)]
pub struct ArmedTimer {
    token: Option<TimerToken>,
    handle: JoinHandle<()>,
}

impl ArmedTimer {
    /// Posts [`Input::Timeout`] once after `after`.
    pub(crate) fn timeout(
        token: TimerToken,
        after: Duration,
        inbox: mpsc::UnboundedSender<Input>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(target: "Calls/Timer", "{} timer fired for session {}", token.kind, token.session);
            let _ = inbox.send(Input::Timeout(token));
        });
        Self {
            token: Some(token),
            handle,
        }
    }

    /// Posts [`Input::Tick`] every `period` until dropped.
    pub(crate) fn ticker(
        session: SessionId,
        period: Duration,
        inbox: mpsc::UnboundedSender<Input>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if inbox.send(Input::Tick(session)).is_err() {
                    return;
                }
            }
        });
        Self {
            token: None,
            handle,
        }
    }

    pub fn token(&self) -> Option<TimerToken> {
        self.token
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
