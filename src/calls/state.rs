//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::error::CallFailure;
use super::media::MicrophoneGuard;
use super::negotiation::{PeerConnection, PeerConnectionGuard};
use super::signaling::Identity;
use super::timeout::{ArmedTimer, TimerToken};
use super::transport::CandidateBuffer;
use std::sync::Arc;

/// Identifies one session for the lifetime of a [`CallManager`](super::CallManager).
///
/// Never reused, so events and timers belonging to an old session can be told
/// apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Coarse phase of the local endpoint, `Idle` meaning no session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Dialing,
    RingingLocal,
    Negotiating,
    Active,
}

impl CallStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Outgoing call waiting for the peer to decide.
    pub fn is_calling(&self) -> bool {
        matches!(self, Self::Dialing)
    }

    pub fn is_receiving_call(&self) -> bool {
        matches!(self, Self::RingingLocal)
    }

    /// Accepted by both sides, whether or not media flows yet.
    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::Negotiating | Self::Active)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Dialing => "Dialing",
            Self::RingingLocal => "RingingLocal",
            Self::Negotiating => "Negotiating",
            Self::Active => "Active",
        };
        f.write_str(s)
    }
}

/// How a session reached idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// Local `end_call` (or `decline_call` outside of ringing).
    LocalHangup,
    /// Local `decline_call` while ringing.
    LocalDecline,
    Failed(CallFailure),
}

impl EndReason {
    pub fn failure(&self) -> Option<CallFailure> {
        match self {
            Self::Failed(f) => Some(*f),
            _ => None,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("local hangup"),
            Self::LocalDecline => f.write_str("declined locally"),
            Self::Failed(failure) => write!(f, "{failure}"),
        }
    }
}

/// Current state of a call.
#[derive(Debug, Clone, Serialize)]
pub enum CallState {
    /// Outgoing call: request sent (or about to be), waiting for the peer to decide.
    Dialing { started_at: DateTime<Utc> },
    /// Incoming call: ringing locally.
    RingingLocal { received_at: DateTime<Utc> },
    /// Description and candidate exchange in progress.
    Negotiating { since: DateTime<Utc> },
    /// Media flowing.
    Active {
        connected_at: DateTime<Utc>,
        muted: bool,
    },
    /// Terminal. The manager discards the session as soon as it gets here.
    Idle {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration: Option<Duration>,
    },
}

impl CallState {
    pub fn status(&self) -> CallStatus {
        match self {
            Self::Dialing { .. } => CallStatus::Dialing,
            Self::RingingLocal { .. } => CallStatus::RingingLocal,
            Self::Negotiating { .. } => CallStatus::Negotiating,
            Self::Active { .. } => CallStatus::Active,
            Self::Idle { .. } => CallStatus::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(self, Self::RingingLocal { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Caller received call-accept.
    RemoteAccepted,
    /// Callee picked up and has the microphone.
    LocalAccepted,
    /// Description exchange finished (caller: answer applied; callee: remote
    /// track arrived).
    Connected,
    MuteChanged { muted: bool },
    Ended {
        reason: EndReason,
        duration: Option<Duration>,
    },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The single live or pending call of a local identity.
///
/// Owns every per-call resource. Dropping the session releases the
/// microphone, closes the peer connection and cancels its timers.
#[derive(Debug)]
pub struct CallSession {
    pub id: SessionId,
    pub peer: Identity,
    pub role: CallRole,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    /// Whether this endpoint has transmitted anything for this session.
    pub(crate) signalled: bool,
    pub(crate) offer_sent: bool,
    pub(crate) remote_description_set: bool,
    pub(crate) candidates: CandidateBuffer,
    pub(crate) active_since: Option<Instant>,
    pub(crate) timer: Option<ArmedTimer>,
    pub(crate) ticker: Option<ArmedTimer>,
    pub(crate) microphone: Option<MicrophoneGuard>,
    pub(crate) connection: Option<PeerConnectionGuard>,
}

impl CallSession {
    fn new(id: SessionId, peer: Identity, role: CallRole, state: CallState) -> Self {
        Self {
            id,
            peer,
            role,
            state,
            created_at: Utc::now(),
            signalled: false,
            offer_sent: false,
            remote_description_set: false,
            candidates: CandidateBuffer::new(),
            active_since: None,
            timer: None,
            ticker: None,
            microphone: None,
            connection: None,
        }
    }

    pub fn new_outgoing(id: SessionId, peer: Identity) -> Self {
        Self::new(
            id,
            peer,
            CallRole::Caller,
            CallState::Dialing {
                started_at: Utc::now(),
            },
        )
    }

    pub fn new_incoming(id: SessionId, peer: Identity) -> Self {
        Self::new(
            id,
            peer,
            CallRole::Callee,
            CallState::RingingLocal {
                received_at: Utc::now(),
            },
        )
    }

    pub fn status(&self) -> CallStatus {
        self.state.status()
    }

    pub fn is_caller(&self) -> bool {
        self.role == CallRole::Caller
    }

    pub fn is_muted(&self) -> bool {
        matches!(self.state, CallState::Active { muted: true, .. })
    }

    /// Set only once the call is active.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CallState::Active { connected_at, .. } => Some(connected_at),
            _ => None,
        }
    }

    /// Time spent active so far, if the call ever became active.
    pub fn elapsed(&self) -> Option<Duration> {
        self.active_since.map(|since| since.elapsed())
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.connection.as_ref().map(PeerConnectionGuard::connection)
    }

    pub(crate) fn timer_token(&self) -> Option<TimerToken> {
        self.timer.as_ref().and_then(ArmedTimer::token)
    }

    /// Cancels the timeout and duration ticker.
    pub(crate) fn disarm(&mut self) {
        self.timer = None;
        self.ticker = None;
    }

    /// Releases the microphone and closes the peer connection.
    pub(crate) fn release(&mut self) {
        self.microphone = None;
        self.connection = None;
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Dialing { .. }, CallTransition::RemoteAccepted) => {
                CallState::Negotiating { since: Utc::now() }
            }
            (CallState::RingingLocal { .. }, CallTransition::LocalAccepted) => {
                CallState::Negotiating { since: Utc::now() }
            }
            (CallState::Negotiating { .. }, CallTransition::Connected) => {
                self.active_since = Some(Instant::now());
                CallState::Active {
                    connected_at: Utc::now(),
                    muted: false,
                }
            }
            (CallState::Active { connected_at, .. }, CallTransition::MuteChanged { muted }) => {
                CallState::Active {
                    connected_at: *connected_at,
                    muted,
                }
            }
            (current, CallTransition::Ended { reason, duration }) if !current.is_idle() => {
                CallState::Idle {
                    reason,
                    ended_at: Utc::now(),
                    duration,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current.status()),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

/// Point-in-time view of the current session, for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub session: SessionId,
    pub peer: Identity,
    pub role: CallRole,
    pub status: CallStatus,
    pub muted: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub buffered_candidates: usize,
    pub remote_description_set: bool,
}

impl From<&CallSession> for CallSnapshot {
    fn from(session: &CallSession) -> Self {
        Self {
            session: session.id,
            peer: session.peer.clone(),
            role: session.role,
            status: session.status(),
            muted: session.is_muted(),
            start_time: session.start_time(),
            buffered_candidates: session.buffered_candidates(),
            remote_description_set: session.remote_description_set,
        }
    }
}

/// Formats a call duration as `MM:SS`. Minutes keep counting past an hour.
pub fn format_call_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
