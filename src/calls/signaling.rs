//! Call signaling envelopes and their JSON wire format.
//!
//! Every control message between two endpoints is a [`CallSignal`]:
//!
//! ```json
//! { "type": "ice-candidate", "from": "alice", "to": "bob",
//!   "data": { "candidate": "candidate:1 1 UDP ...", "sdpMid": "0" },
//!   "timestamp": "2024-05-01T12:00:00Z" }
//! ```
//!
//! `data` is typed by `type`: offers and answers carry a
//! [`SessionDescription`], ice-candidate carries an [`IceCandidate`], and a
//! call-decline may carry a reason. It is absent on every other type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

use super::transport::{IceCandidate, SdpType, SessionDescription};

/// Signaling message types for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingType {
    /// Caller asks the callee to ring.
    CallRequest,
    /// Callee picked up; the caller may now create an offer.
    CallAccept,
    /// Callee refused, either by hand or automatically because it is busy.
    CallDecline,
    /// Either side hangs up. Can be sent at any time.
    CallEnd,
    Offer,
    Answer,
    /// One connectivity candidate, trickled as soon as it is discovered.
    IceCandidate,
}

impl SignalingType {
    pub const ALL: [SignalingType; 7] = [
        Self::CallRequest,
        Self::CallAccept,
        Self::CallDecline,
        Self::CallEnd,
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
    ];

    /// Get the name used in the wire `type` field.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::CallRequest => "call-request",
            Self::CallAccept => "call-accept",
            Self::CallDecline => "call-decline",
            Self::CallEnd => "call-end",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    /// Parse from tag name (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.to_lowercase();
        Self::ALL.into_iter().find(|t| t.tag_name() == tag)
    }
}

impl fmt::Display for SignalingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// An endpoint identity as assigned by the embedding application.
///
/// Identities are trusted as-is; nothing here authenticates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reason attached to a call-decline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclineReason {
    /// The callee already had a session.
    Busy,
    /// The callee rejected the call.
    Declined,
    /// Any reason string this endpoint does not know.
    Other(String),
}

impl DeclineReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Busy => "busy",
            Self::Declined => "declined",
            Self::Other(s) => s,
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "busy" => Self::Busy,
            "declined" => Self::Declined,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Typed contents of the `data` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalData {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Decline(DeclineReason),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed signal json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} signal is missing its data")]
    MissingData(SignalingType),

    #[error("{kind} signal carries a {found:?} description")]
    DescriptionMismatch { kind: SignalingType, found: SdpType },

    #[error("invalid data for {kind} signal: {source}")]
    InvalidData {
        kind: SignalingType,
        #[source]
        source: serde_json::Error,
    },
}

/// One signaling envelope. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub struct CallSignal {
    kind: SignalingType,
    from: Identity,
    to: Identity,
    data: Option<SignalData>,
    timestamp: DateTime<Utc>,
}

impl CallSignal {
    fn build(
        kind: SignalingType,
        from: Identity,
        to: Identity,
        data: Option<SignalData>,
    ) -> Self {
        Self {
            kind,
            from,
            to,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn call_request(from: Identity, to: Identity) -> Self {
        Self::build(SignalingType::CallRequest, from, to, None)
    }

    pub fn call_accept(from: Identity, to: Identity) -> Self {
        Self::build(SignalingType::CallAccept, from, to, None)
    }

    pub fn call_decline(from: Identity, to: Identity, reason: DeclineReason) -> Self {
        Self::build(
            SignalingType::CallDecline,
            from,
            to,
            Some(SignalData::Decline(reason)),
        )
    }

    pub fn call_end(from: Identity, to: Identity) -> Self {
        Self::build(SignalingType::CallEnd, from, to, None)
    }

    pub fn offer(from: Identity, to: Identity, description: SessionDescription) -> Self {
        Self::build(
            SignalingType::Offer,
            from,
            to,
            Some(SignalData::Description(description)),
        )
    }

    pub fn answer(from: Identity, to: Identity, description: SessionDescription) -> Self {
        Self::build(
            SignalingType::Answer,
            from,
            to,
            Some(SignalData::Description(description)),
        )
    }

    pub fn ice_candidate(from: Identity, to: Identity, candidate: IceCandidate) -> Self {
        Self::build(
            SignalingType::IceCandidate,
            from,
            to,
            Some(SignalData::Candidate(candidate)),
        )
    }

    pub fn kind(&self) -> SignalingType {
        self.kind
    }

    pub fn sender(&self) -> &Identity {
        &self.from
    }

    pub fn recipient(&self) -> &Identity {
        &self.to
    }

    pub fn data(&self) -> Option<&SignalData> {
        self.data.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.data {
            Some(SignalData::Description(d)) => Some(d),
            _ => None,
        }
    }

    pub fn candidate(&self) -> Option<&IceCandidate> {
        match &self.data {
            Some(SignalData::Candidate(c)) => Some(c),
            _ => None,
        }
    }

    pub fn decline_reason(&self) -> Option<&DeclineReason> {
        match &self.data {
            Some(SignalData::Decline(r)) => Some(r),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, WireError> {
        let wire: WireSignal = serde_json::from_str(json)?;
        Self::try_from(wire)
    }
}

/// The untyped envelope exactly as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireSignal {
    #[serde(rename = "type")]
    kind: SignalingType,
    from: Identity,
    to: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    timestamp: DateTime<Utc>,
}

impl From<CallSignal> for WireSignal {
    fn from(signal: CallSignal) -> Self {
        let data = signal.data.map(|data| match data {
            SignalData::Description(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            SignalData::Candidate(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            SignalData::Decline(r) => json!({ "reason": r.as_str() }),
        });
        Self {
            kind: signal.kind,
            from: signal.from,
            to: signal.to,
            data,
            timestamp: signal.timestamp,
        }
    }
}

impl TryFrom<WireSignal> for CallSignal {
    type Error = WireError;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        let kind = wire.kind;
        let invalid = |source| WireError::InvalidData { kind, source };

        let data = match kind {
            SignalingType::Offer | SignalingType::Answer => {
                let value = wire.data.ok_or(WireError::MissingData(kind))?;
                let description: SessionDescription =
                    serde_json::from_value(value).map_err(invalid)?;
                let expected = if kind == SignalingType::Offer {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                if description.sdp_type != expected {
                    return Err(WireError::DescriptionMismatch {
                        kind,
                        found: description.sdp_type,
                    });
                }
                Some(SignalData::Description(description))
            }
            SignalingType::IceCandidate => {
                let value = wire.data.ok_or(WireError::MissingData(kind))?;
                Some(SignalData::Candidate(
                    serde_json::from_value(value).map_err(invalid)?,
                ))
            }
            SignalingType::CallDecline => wire
                .data
                .as_ref()
                .and_then(|v| v.get("reason"))
                .and_then(Value::as_str)
                .map(|r| SignalData::Decline(DeclineReason::parse(r))),
            // Control signals carry nothing; stray data is dropped.
            SignalingType::CallRequest | SignalingType::CallAccept | SignalingType::CallEnd => None,
        };

        Ok(Self {
            kind,
            from: wire.from,
            to: wire.to,
            data,
            timestamp: wire.timestamp,
        })
    }
}
