//! Call-related error types.

use serde::Serialize;
use thiserror::Error;

/// Why a call ended without either side hanging up normally.
///
/// Every failure is handled by forcing the session back to idle; none of
/// them is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Error)]
pub enum CallFailure {
    #[error("peer is busy")]
    Busy,

    #[error("peer declined the call")]
    Declined,

    /// Dial timeout expired. This is also how an unreachable peer or a lost
    /// call-request shows up, since the relay never reports loss.
    #[error("call was not answered")]
    Unanswered,

    #[error("microphone access denied")]
    MediaAccessDenied,

    #[error("session negotiation failed")]
    NegotiationFailed,

    #[error("remote peer hung up")]
    RemoteHangup,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Failed(#[from] CallFailure),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("already in a call with {0}")]
    AlreadyInCall(String),

    #[error("no call in progress")]
    NoActiveCall,

    #[error("operation requires {expected}, call is {actual}")]
    WrongState {
        expected: &'static str,
        actual: super::state::CallStatus,
    },

    #[error("cannot call own identity {0}")]
    SelfCall(String),

    #[error("call setup interrupted")]
    Interrupted,

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("negotiation error: {0}")]
    Negotiation(#[source] anyhow::Error),

    #[error("call manager is shut down")]
    Shutdown,
}
