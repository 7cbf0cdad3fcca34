//! Negotiation engine adapter.
//!
//! The call state machine does not move media itself. It drives an external
//! peer-connection engine through [`PeerConnection`] and decides *when* each
//! operation is allowed: offers only after call-accept (caller side), answers
//! only after the remote offer is set, remote candidates only after a remote
//! description exists. The engine reports asynchronous happenings back through
//! a [`SessionEventSender`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::manager::Input;
use super::media::AudioTrack;
use super::state::SessionId;
use super::transport::{IceCandidate, SessionDescription};

/// A STUN/TURN server handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Something that happened inside the engine or the microphone, outside of
/// any call the state machine made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A local candidate was discovered and should be trickled to the peer.
    LocalCandidate(IceCandidate),
    /// Remote audio started flowing.
    RemoteTrack,
    /// Connectivity could not be established or was lost.
    ConnectionFailed(String),
    /// The microphone track ended on its own (device unplugged, permission revoked).
    LocalTrackEnded,
}

/// Callback handle given to the engine and microphone for one session.
///
/// Events are tagged with the session they were created for, so anything a
/// torn-down session emits late is discarded.
#[derive(Debug, Clone)]
pub struct SessionEventSender {
    session: SessionId,
    inbox: mpsc::UnboundedSender<Input>,
}

impl SessionEventSender {
    pub(crate) fn new(session: SessionId, inbox: mpsc::UnboundedSender<Input>) -> Self {
        Self { session, inbox }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Returns false once the state machine is gone.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.inbox.send(Input::Session(self.session, event)).is_ok()
    }
}

/// Creates one peer connection per call session.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: SessionEventSender,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error>;
}

/// One peer connection, exclusively owned by a single call session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;

    async fn attach_local_track(&self, track: Arc<dyn AudioTrack>) -> Result<(), anyhow::Error>;

    /// Tears the connection down. Must be idempotent.
    fn close(&self);
}

/// Owns a peer connection and closes it when dropped.
pub struct PeerConnectionGuard {
    connection: Arc<dyn PeerConnection>,
}

impl PeerConnectionGuard {
    pub fn new(connection: Arc<dyn PeerConnection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        self.connection.clone()
    }
}

impl Drop for PeerConnectionGuard {
    fn drop(&mut self) {
        self.connection.close();
    }
}

impl std::fmt::Debug for PeerConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionGuard").finish_non_exhaustive()
    }
}
