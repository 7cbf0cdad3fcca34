//! Call signaling and session negotiation for peer-to-peer audio calls.
//!
//! Two endpoints agree on a call over a best-effort signaling relay, exchange
//! session descriptions and ICE candidates through it, and then hand media
//! over to an external negotiation engine.
//!
//! # Architecture
//!
//! - [`CallSignal`]: the JSON envelope carried by the relay
//! - [`SignalTransport`] / [`InMemoryRelay`]: at-most-once delivery between identities
//! - [`PeerConnectionFactory`] / [`PeerConnection`]: the negotiation engine seam
//! - [`MicrophoneSource`]: local audio capture
//! - [`CallSession`] & [`CallState`]: the single live call and its state
//! - [`CallManager`]: serialized state machine driving all of the above
//! - [`sim`]: simulated engine and microphone for tests and demos
//!
//! # Call flow
//!
//! The caller sends `call-request` and waits in `Dialing`. The callee rings
//! (`RingingLocal`) until the local user accepts, then sends `call-accept`.
//! Only then does the caller create an offer; the callee answers it, both
//! sides trickle candidates, and each side goes `Active` once media can
//! flow. `call-end` from either side, a decline, a timeout or a media failure
//! returns the endpoint to `Idle` and releases everything the session held.

mod error;
pub mod events;
mod manager;
pub mod media;
pub mod negotiation;
pub mod relay;
pub mod signaling;
pub mod sim;
mod state;
pub mod timeout;
pub mod transport;

pub use error::{CallError, CallFailure};
pub use events::{CallEventBus, CallNotification};
pub use manager::{CallAdapters, CallManager};
pub use media::{AudioConstraints, AudioTrack, MicrophoneSource};
pub use negotiation::{IceServer, PeerConnection, PeerConnectionFactory, SessionEvent};
pub use relay::{InMemoryRelay, SignalTransport};
pub use signaling::{CallSignal, DeclineReason, Identity, SignalingType};
pub use state::{
    CallRole, CallSession, CallSnapshot, CallState, CallStatus, CallTransition, EndReason,
    InvalidTransition, SessionId, format_call_duration,
};
pub use transport::{IceCandidate, SessionDescription};
