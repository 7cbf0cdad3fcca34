//! In-process stand-ins for the negotiation engine and the microphone.
//!
//! They behave like a browser peer connection closely enough to drive the
//! state machine end to end: fake SDP, trickled host candidates after the
//! local description is set, a remote track once both descriptions are in
//! place. Faults can be injected per operation.

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::media::{AudioConstraints, AudioTrack, MicrophoneSource};
use super::negotiation::{
    IceServer, PeerConnection, PeerConnectionFactory, SessionEvent, SessionEventSender,
};
use super::transport::{IceCandidate, SdpType, SessionDescription};

/// An engine operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    CreateConnection,
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription,
    AddCandidate,
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Simulated [`PeerConnectionFactory`].
#[derive(Debug)]
pub struct SimulatedEngine {
    candidates: usize,
    connect: bool,
    fault: Option<SimFault>,
    connections: Mutex<Vec<Arc<SimulatedConnection>>>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            candidates: 2,
            connect: true,
            fault: None,
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of host candidates trickled after each local description.
    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates;
        self
    }

    /// Never report a remote track, as if connectivity checks kept failing.
    pub fn without_connectivity(mut self) -> Self {
        self.connect = false;
        self
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Every connection created so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<SimulatedConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_connection(&self) -> Option<Arc<SimulatedConnection>> {
        self.connections().pop()
    }
}

#[async_trait]
impl PeerConnectionFactory for SimulatedEngine {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: SessionEventSender,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error> {
        if self.fault == Some(SimFault::CreateConnection) {
            anyhow::bail!("simulated engine refused to create a connection");
        }
        let connection = Arc::new(SimulatedConnection {
            events,
            ice_servers: ice_servers.to_vec(),
            ufrag: random_token(8),
            pwd: random_token(24),
            candidates: self.candidates,
            connect: self.connect,
            fault: self.fault,
            state: Mutex::new(ConnectionState::default()),
            closes: AtomicUsize::new(0),
        });
        debug!(
            target: "Calls/Sim",
            "Created connection {} for session {}",
            connection.ufrag,
            connection.events.session()
        );
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.clone());
        Ok(connection)
    }
}

#[derive(Debug, Default)]
struct ConnectionState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    tracks: Vec<String>,
    connected: bool,
}

/// One simulated peer connection.
#[derive(Debug)]
pub struct SimulatedConnection {
    events: SessionEventSender,
    ice_servers: Vec<IceServer>,
    ufrag: String,
    pwd: String,
    candidates: usize,
    connect: bool,
    fault: Option<SimFault>,
    state: Mutex<ConnectionState>,
    closes: AtomicUsize,
}

impl SimulatedConnection {
    fn state(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, op: SimFault) -> Result<(), anyhow::Error> {
        if self.is_closed() {
            anyhow::bail!("connection is closed");
        }
        if self.fault == Some(op) {
            anyhow::bail!("simulated {op:?} failure");
        }
        Ok(())
    }

    fn sdp(&self, sdp_type: SdpType) -> String {
        let direction = match sdp_type {
            SdpType::Offer => "actpass",
            SdpType::Answer => "active",
        };
        format!(
            "v=0\r\n\
             o=- {} 2 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=ice-ufrag:{}\r\n\
             a=ice-pwd:{}\r\n\
             a=setup:{direction}\r\n\
             a=mid:0\r\n\
             a=sendrecv\r\n\
             a=rtpmap:111 opus/48000/2\r\n",
            rand::random::<u32>(),
            self.ufrag,
            self.pwd
        )
    }

    fn trickle(&self) {
        for i in 0..self.candidates {
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp {} 192.0.2.{} {} typ host",
                i + 1,
                2_122_260_223u32 - i as u32,
                10 + i,
                50_000 + i
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment(self.ufrag.clone());
            self.events.emit(SessionEvent::LocalCandidate(candidate));
        }
    }

    fn maybe_connect(&self) {
        let mut state = self.state();
        if self.connect && !state.connected && state.local.is_some() && state.remote.is_some() {
            state.connected = true;
            drop(state);
            self.events.emit(SessionEvent::RemoteTrack);
        }
    }

    /// Reports a connectivity failure, as if ICE gave up.
    pub fn fail_connectivity(&self, reason: &str) {
        self.events
            .emit(SessionEvent::ConnectionFailed(reason.to_string()));
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state().remote.clone()
    }

    pub fn attached_tracks(&self) -> Vec<String> {
        self.state().tracks.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }
}

#[async_trait]
impl PeerConnection for SimulatedConnection {
    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error> {
        self.check(SimFault::CreateOffer)?;
        Ok(SessionDescription::offer(self.sdp(SdpType::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        self.check(SimFault::CreateAnswer)?;
        let has_offer = self
            .state()
            .remote
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            anyhow::bail!("cannot create an answer without a remote offer");
        }
        Ok(SessionDescription::answer(self.sdp(SdpType::Answer)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        if self.is_closed() {
            anyhow::bail!("connection is closed");
        }
        self.state().local = Some(description);
        self.trickle();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.check(SimFault::SetRemoteDescription)?;
        self.state().remote = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        self.check(SimFault::AddCandidate)?;
        let mut state = self.state();
        if state.remote.is_none() {
            anyhow::bail!("remote candidate added before the remote description");
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn attach_local_track(&self, track: Arc<dyn AudioTrack>) -> Result<(), anyhow::Error> {
        if self.is_closed() {
            anyhow::bail!("connection is closed");
        }
        self.state().tracks.push(track.id().to_string());
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Simulated [`MicrophoneSource`].
#[derive(Debug, Default)]
pub struct SimulatedMicrophone {
    denied: AtomicBool,
    acquired: AtomicUsize,
    tracks: Mutex<Vec<Arc<SimulatedTrack>>>,
}

impl SimulatedMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone whose permission prompt is always refused.
    pub fn denied() -> Self {
        let microphone = Self::default();
        microphone.set_denied(true);
        microphone
    }

    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<Arc<SimulatedTrack>> {
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_track(&self) -> Option<Arc<SimulatedTrack>> {
        self.tracks().pop()
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.tracks().iter().filter(|t| !t.is_stopped()).count()
    }
}

#[async_trait]
impl MicrophoneSource for SimulatedMicrophone {
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
        events: SessionEventSender,
    ) -> Result<Arc<dyn AudioTrack>, anyhow::Error> {
        if self.denied.load(Ordering::SeqCst) {
            anyhow::bail!("permission denied");
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let track = Arc::new(SimulatedTrack {
            id: format!("mic-{n}"),
            constraints: *constraints,
            events,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        });
        self.tracks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(track.clone());
        Ok(track)
    }
}

#[derive(Debug)]
pub struct SimulatedTrack {
    id: String,
    constraints: AudioConstraints,
    events: SessionEventSender,
    enabled: AtomicBool,
    stops: AtomicUsize,
}

impl SimulatedTrack {
    pub fn constraints(&self) -> AudioConstraints {
        self.constraints
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_count() > 0
    }

    /// Ends the track from the device side (unplugged, permission revoked).
    pub fn revoke(&self) {
        self.events.emit(SessionEvent::LocalTrackEnded);
    }
}

impl AudioTrack for SimulatedTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}
