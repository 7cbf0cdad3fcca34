//! Call manager: owns the single call session of a local identity.
//!
//! Everything that can change a session (local commands, inbound signals,
//! engine and microphone events, timer firings) is an [`Input`] on one
//! unbounded queue, consumed by exactly one actor task. Inputs are applied in
//! arrival order. While the actor awaits the engine or the microphone it keeps
//! draining the queue: inputs that tear the session down (local end/decline,
//! call-end from the peer, the armed timeout, connection loss) abort the
//! in-flight operation and are handled next, everything else waits its turn.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::error::{CallError, CallFailure};
use super::events::{CallEventBus, CallNotification};
use super::media::{MicrophoneGuard, MicrophoneSource};
use super::negotiation::{
    PeerConnection, PeerConnectionFactory, PeerConnectionGuard, SessionEvent, SessionEventSender,
};
use super::relay::SignalTransport;
use super::signaling::{CallSignal, DeclineReason, Identity, SignalingType};
use super::state::{
    CallSession, CallSnapshot, CallStatus, CallTransition, EndReason, SessionId,
};
use super::timeout::{ArmedTimer, TimeoutPolicy, TimerKind, TimerToken, sends_call_end};
use super::transport::{IceCandidate, SessionDescription};
use crate::config::CallConfig;

type Responder<T> = oneshot::Sender<Result<T, CallError>>;

/// Local user actions, each with its reply channel.
#[derive(Debug)]
pub(crate) enum Command {
    Initiate(Identity, Responder<()>),
    Accept(Responder<()>),
    Decline(Responder<()>),
    End(Responder<()>),
    ToggleMute(Responder<bool>),
    Snapshot(Responder<Option<CallSnapshot>>),
}

/// One entry of the state machine's queue.
#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    Signal(CallSignal),
    Session(SessionId, SessionEvent),
    Timeout(TimerToken),
    Tick(SessionId),
    Shutdown,
}

/// The external components a [`CallManager`] drives.
#[derive(Clone)]
pub struct CallAdapters {
    pub transport: Arc<dyn SignalTransport>,
    pub engine: Arc<dyn PeerConnectionFactory>,
    pub microphone: Arc<dyn MicrophoneSource>,
}

impl std::fmt::Debug for CallAdapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallAdapters").finish_non_exhaustive()
    }
}

/// Handle to the call state machine of one local identity.
///
/// All methods are cheap to call concurrently; they enqueue a command and
/// wait for the state machine to process it. Dropping the handle hangs up
/// any call in progress and stops the state machine.
pub struct CallManager {
    local: Identity,
    inbox: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<CallStatus>,
    events: CallEventBus,
    pump: JoinHandle<()>,
    actor: Option<JoinHandle<()>>,
}

impl CallManager {
    /// Subscribes `local` on the transport and starts the state machine.
    pub async fn start(
        local: Identity,
        config: CallConfig,
        adapters: CallAdapters,
    ) -> Result<Self, CallError> {
        let mut signals = adapters
            .transport
            .subscribe(&local)
            .await
            .map_err(CallError::Transport)?;

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(CallStatus::Idle);
        let events = CallEventBus::new(config.event_capacity);

        let pump_inbox = inbox.clone();
        let pump = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                if pump_inbox.send(Input::Signal(signal)).is_err() {
                    break;
                }
            }
        });

        let actor = CallActor {
            local: local.clone(),
            policy: TimeoutPolicy::from_config(&config),
            config,
            transport: adapters.transport,
            engine: adapters.engine,
            microphone: adapters.microphone,
            inbox_tx: inbox.clone(),
            inbox_rx,
            deferred: VecDeque::new(),
            session: None,
            next_session: 0,
            timer_seq: 0,
            status_tx,
            events: events.clone(),
        };
        let actor = tokio::spawn(actor.run());

        info!(target: "Calls/Manager", "Call manager started for {local}");
        Ok(Self {
            local,
            inbox,
            status,
            events,
            pump,
            actor: Some(actor),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.local
    }

    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.events.subscribe()
    }

    /// Calls `peer`. Returns once the call-request has been sent; the outcome
    /// arrives as notifications.
    pub async fn initiate_call(&self, peer: impl Into<Identity>) -> Result<(), CallError> {
        let peer = peer.into();
        self.request(|tx| Command::Initiate(peer, tx)).await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(Command::Accept).await
    }

    /// Declines a ringing call. In any other state this hangs up.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.request(Command::Decline).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Command::End).await
    }

    /// Flips the mute flag of an active call and returns the new value.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleMute).await
    }

    pub async fn snapshot(&self) -> Result<Option<CallSnapshot>, CallError> {
        self.request(Command::Snapshot).await
    }

    /// Hangs up any call in progress and waits for the state machine to stop.
    pub async fn shutdown(mut self) {
        let _ = self.inbox.send(Input::Shutdown);
        if let Some(actor) = self.actor.take() {
            let _ = actor.await;
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Responder<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Input::Command(build(tx)))
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        let _ = self.inbox.send(Input::Shutdown);
        self.pump.abort();
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("local", &self.local)
            .field("status", &self.status())
            .finish()
    }
}

enum Step<T> {
    Input(Option<Input>),
    Done(T),
}

struct CallActor {
    local: Identity,
    config: CallConfig,
    policy: TimeoutPolicy,
    transport: Arc<dyn SignalTransport>,
    engine: Arc<dyn PeerConnectionFactory>,
    microphone: Arc<dyn MicrophoneSource>,
    inbox_tx: mpsc::UnboundedSender<Input>,
    inbox_rx: mpsc::UnboundedReceiver<Input>,
    /// Inputs that arrived while an operation was in flight.
    deferred: VecDeque<Input>,
    session: Option<CallSession>,
    next_session: u64,
    timer_seq: u64,
    status_tx: watch::Sender<CallStatus>,
    events: CallEventBus,
}

impl CallActor {
    async fn run(mut self) {
        loop {
            let input = match self.deferred.pop_front() {
                Some(input) => input,
                None => match self.inbox_rx.recv().await {
                    Some(input) => input,
                    None => break,
                },
            };
            if !self.handle(input).await {
                break;
            }
        }
        debug!(target: "Calls/Manager", "Call manager for {} stopped", self.local);
    }

    /// Returns false once the actor should stop.
    async fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(command) => self.on_command(command).await,
            Input::Signal(signal) => self.on_signal(signal).await,
            Input::Session(id, event) => self.on_session_event(id, event).await,
            Input::Timeout(token) => self.on_timeout(token).await,
            Input::Tick(id) => self.on_tick(id),
            Input::Shutdown => {
                if self.session.is_some() {
                    self.finish(EndReason::LocalHangup).await;
                }
                return false;
            }
        }
        true
    }

    // ---- local commands ----

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Initiate(peer, reply) => {
                let result = self.initiate(peer).await;
                let _ = reply.send(result);
            }
            Command::Accept(reply) => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            Command::Decline(reply) => {
                let result = self.decline().await;
                let _ = reply.send(result);
            }
            Command::End(reply) => {
                let result = match self.session {
                    Some(_) => {
                        self.finish(EndReason::LocalHangup).await;
                        Ok(())
                    }
                    None => Err(CallError::NoActiveCall),
                };
                let _ = reply.send(result);
            }
            Command::ToggleMute(reply) => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    async fn initiate(&mut self, peer: Identity) -> Result<(), CallError> {
        if peer == self.local {
            return Err(CallError::SelfCall(peer.to_string()));
        }
        if let Some(session) = &self.session {
            return Err(CallError::AlreadyInCall(session.peer.to_string()));
        }

        let id = self.next_session_id();
        info!(target: "Calls/Manager", "Calling {peer} (session {id})");
        self.begin(CallSession::new_outgoing(id, peer));

        self.prepare_media().await?;
        self.send_to_peer(CallSignal::call_request).await;
        Ok(())
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let status = self.current_status().ok_or(CallError::NoActiveCall)?;
        if status != CallStatus::RingingLocal {
            return Err(CallError::WrongState {
                expected: "RingingLocal",
                actual: status,
            });
        }

        self.prepare_media().await?;
        self.transition(CallTransition::LocalAccepted)?;
        self.send_to_peer(CallSignal::call_accept).await;
        Ok(())
    }

    async fn decline(&mut self) -> Result<(), CallError> {
        match self.current_status() {
            None => Err(CallError::NoActiveCall),
            Some(CallStatus::RingingLocal) => {
                self.send_to_peer(|from, to| {
                    CallSignal::call_decline(from, to, DeclineReason::Declined)
                })
                .await;
                self.finish(EndReason::LocalDecline).await;
                Ok(())
            }
            Some(_) => {
                self.finish(EndReason::LocalHangup).await;
                Ok(())
            }
        }
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        let status = session.status();
        if status != CallStatus::Active {
            return Err(CallError::WrongState {
                expected: "Active",
                actual: status,
            });
        }

        let muted = !session.is_muted();
        session.apply_transition(CallTransition::MuteChanged { muted })?;
        if let Some(microphone) = &session.microphone {
            microphone.set_muted(muted);
        }
        let peer = session.peer.clone();
        debug!(target: "Calls/Manager", "Call with {peer} muted={muted}");
        self.events.emit(CallNotification::MuteChanged { peer, muted });
        Ok(muted)
    }

    fn snapshot(&self) -> Option<CallSnapshot> {
        self.session.as_ref().map(CallSnapshot::from)
    }

    /// Opens the microphone, creates the peer connection and attaches the
    /// track. On failure the session has already been ended.
    async fn prepare_media(&mut self) -> Result<(), CallError> {
        let id = self.session.as_ref().ok_or(CallError::NoActiveCall)?.id;

        let microphone = self.microphone.clone();
        let constraints = self.config.audio;
        let events = SessionEventSender::new(id, self.inbox_tx.clone());
        let acquired = self
            .guarded(async move { microphone.acquire(&constraints, events).await })
            .await
            .ok_or(CallError::Interrupted)?;
        let track = match acquired {
            Ok(track) => track,
            Err(e) => {
                warn!(target: "Calls/Manager", "Microphone unavailable for session {id}: {e:#}");
                self.finish(EndReason::Failed(CallFailure::MediaAccessDenied))
                    .await;
                return Err(CallFailure::MediaAccessDenied.into());
            }
        };
        if let Some(session) = self.session.as_mut() {
            session.microphone = Some(MicrophoneGuard::new(track.clone()));
        }

        let engine = self.engine.clone();
        let ice_servers = self.config.ice_servers.clone();
        let events = SessionEventSender::new(id, self.inbox_tx.clone());
        let created = self
            .guarded(async move { engine.create(&ice_servers, events).await })
            .await
            .ok_or(CallError::Interrupted)?;
        let connection = match created {
            Ok(connection) => connection,
            Err(e) => return Err(self.abort_negotiation(e).await),
        };
        if let Some(session) = self.session.as_mut() {
            session.connection = Some(PeerConnectionGuard::new(connection.clone()));
        }

        let attached = self
            .guarded(async move { connection.attach_local_track(track).await })
            .await
            .ok_or(CallError::Interrupted)?;
        if let Err(e) = attached {
            return Err(self.abort_negotiation(e).await);
        }
        Ok(())
    }

    async fn abort_negotiation(&mut self, error: anyhow::Error) -> CallError {
        warn!(target: "Calls/Manager", "Negotiation engine failed: {error:#}");
        self.finish(EndReason::Failed(CallFailure::NegotiationFailed))
            .await;
        CallError::Negotiation(error)
    }

    // ---- inbound signals ----

    async fn on_signal(&mut self, signal: CallSignal) {
        if signal.recipient() != &self.local {
            warn!(
                target: "Calls/Manager",
                "Ignoring {} addressed to {}",
                signal.kind(),
                signal.recipient()
            );
            return;
        }

        let kind = signal.kind();
        if kind == SignalingType::CallRequest {
            self.on_call_request(signal.sender().clone()).await;
            return;
        }

        let Some(session) = &self.session else {
            debug!(target: "Calls/Manager", "Ignoring {kind} from {} while idle", signal.sender());
            return;
        };
        if signal.sender() != &session.peer {
            debug!(
                target: "Calls/Manager",
                "Ignoring {kind} from {}: call is with {}",
                signal.sender(),
                session.peer
            );
            return;
        }

        let status = session.status();
        let is_caller = session.is_caller();
        let remote_set = session.remote_description_set;
        let offer_sent = session.offer_sent;

        match (status, kind) {
            (_, SignalingType::CallEnd) => {
                self.finish(EndReason::Failed(CallFailure::RemoteHangup))
                    .await;
            }
            (CallStatus::Dialing, SignalingType::CallAccept) => self.on_remote_accept().await,
            (CallStatus::Dialing, SignalingType::CallDecline) => {
                let failure = match signal.decline_reason() {
                    Some(DeclineReason::Busy) => CallFailure::Busy,
                    _ => CallFailure::Declined,
                };
                self.finish(EndReason::Failed(failure)).await;
            }
            (CallStatus::Negotiating, SignalingType::Offer) if !is_caller && !remote_set => {
                if let Some(offer) = signal.description() {
                    self.on_offer(offer.clone()).await;
                }
            }
            (CallStatus::Negotiating, SignalingType::Answer)
                if is_caller && offer_sent && !remote_set =>
            {
                if let Some(answer) = signal.description() {
                    self.on_answer(answer.clone()).await;
                }
            }
            (_, SignalingType::IceCandidate) => {
                if let Some(candidate) = signal.candidate() {
                    self.on_remote_candidate(candidate.clone()).await;
                }
            }
            (status, kind) => {
                debug!(target: "Calls/Manager", "Ignoring {kind} in state {status}");
            }
        }
    }

    async fn on_call_request(&mut self, from: Identity) {
        if let Some(session) = &self.session {
            info!(
                target: "Calls/Manager",
                "Busy with {} ({}), declining call from {from}",
                session.peer,
                session.status()
            );
            let decline =
                CallSignal::call_decline(self.local.clone(), from.clone(), DeclineReason::Busy);
            self.send(decline).await;
            self.events
                .emit(CallNotification::RejectedWhileBusy { from });
            return;
        }

        let id = self.next_session_id();
        info!(target: "Calls/Manager", "Incoming call from {from} (session {id})");
        self.begin(CallSession::new_incoming(id, from.clone()));
        self.events.emit(CallNotification::IncomingCall { from });
    }

    async fn on_remote_accept(&mut self) {
        if let Err(e) = self.transition(CallTransition::RemoteAccepted) {
            warn!(target: "Calls/Manager", "Cannot accept remote answer: {e}");
            return;
        }

        let Some(offer) = self
            .engine_op(|pc| async move { pc.create_offer().await })
            .await
        else {
            return;
        };
        let local = offer.clone();
        if self
            .engine_op(move |pc| async move { pc.set_local_description(local).await })
            .await
            .is_none()
        {
            return;
        }

        self.send_to_peer(|from, to| CallSignal::offer(from, to, offer))
            .await;
        if let Some(session) = self.session.as_mut() {
            session.offer_sent = true;
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) {
        if !self.apply_remote_description(offer).await {
            return;
        }

        let Some(answer) = self
            .engine_op(|pc| async move { pc.create_answer().await })
            .await
        else {
            return;
        };
        let local = answer.clone();
        if self
            .engine_op(move |pc| async move { pc.set_local_description(local).await })
            .await
            .is_none()
        {
            return;
        }

        self.send_to_peer(|from, to| CallSignal::answer(from, to, answer))
            .await;
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if !self.apply_remote_description(answer).await {
            return;
        }
        if let Err(e) = self.transition(CallTransition::Connected) {
            warn!(target: "Calls/Manager", "Cannot activate call: {e}");
        }
    }

    /// Sets the remote description, then applies buffered candidates in
    /// receipt order. Returns false if the session is gone or ending.
    async fn apply_remote_description(&mut self, description: SessionDescription) -> bool {
        if self
            .engine_op(move |pc| async move { pc.set_remote_description(description).await })
            .await
            .is_none()
        {
            return false;
        }

        let pending = match self.session.as_mut() {
            Some(session) => {
                session.remote_description_set = true;
                session.candidates.drain()
            }
            None => return false,
        };
        if !pending.is_empty() {
            debug!(target: "Calls/Manager", "Applying {} buffered candidates", pending.len());
        }
        for candidate in pending {
            if !self.apply_candidate(candidate).await {
                return false;
            }
        }
        true
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.remote_description_set {
            session.candidates.push(candidate);
            debug!(
                target: "Calls/Manager",
                "Buffered remote candidate ({} pending)",
                session.candidates.len()
            );
            return;
        }
        self.apply_candidate(candidate).await;
    }

    /// Returns false if the operation was interrupted.
    async fn apply_candidate(&mut self, candidate: IceCandidate) -> bool {
        let Some(connection) = self.session.as_ref().and_then(CallSession::connection) else {
            return false;
        };
        match self
            .guarded(async move { connection.add_ice_candidate(candidate).await })
            .await
        {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                warn!(target: "Calls/Manager", "Failed to add remote candidate: {e:#}");
                true
            }
            None => false,
        }
    }

    // ---- engine, microphone and timers ----

    async fn on_session_event(&mut self, id: SessionId, event: SessionEvent) {
        let Some(session) = &self.session else {
            return;
        };
        if session.id != id {
            debug!(target: "Calls/Manager", "Discarding {event:?} from ended session {id}");
            return;
        }

        match event {
            SessionEvent::LocalCandidate(candidate) => {
                self.send_to_peer(|from, to| CallSignal::ice_candidate(from, to, candidate))
                    .await;
            }
            SessionEvent::RemoteTrack => {
                if session.status() == CallStatus::Negotiating && session.remote_description_set
                {
                    if let Err(e) = self.transition(CallTransition::Connected) {
                        warn!(target: "Calls/Manager", "Cannot activate call: {e}");
                    }
                }
            }
            SessionEvent::ConnectionFailed(reason) => {
                warn!(target: "Calls/Manager", "Connection to {} failed: {reason}", session.peer);
                self.finish(EndReason::Failed(CallFailure::NegotiationFailed))
                    .await;
            }
            SessionEvent::LocalTrackEnded => {
                warn!(target: "Calls/Manager", "Microphone track ended during session {id}");
                self.finish(EndReason::Failed(CallFailure::MediaAccessDenied))
                    .await;
            }
        }
    }

    async fn on_timeout(&mut self, token: TimerToken) {
        let armed = self.session.as_ref().and_then(CallSession::timer_token);
        if armed != Some(token) || self.current_status() != Some(token.kind.armed_for()) {
            debug!(target: "Calls/Manager", "Discarding stale {} timer", token.kind);
            return;
        }
        info!(target: "Calls/Manager", "{} timeout for session {}", token.kind, token.session);
        self.finish(EndReason::Failed(token.kind.failure())).await;
    }

    fn on_tick(&mut self, id: SessionId) {
        let Some(session) = &self.session else {
            return;
        };
        if session.id != id || !session.state.is_active() {
            return;
        }
        if let Some(elapsed) = session.elapsed() {
            self.events.emit(CallNotification::Duration {
                peer: session.peer.clone(),
                elapsed,
            });
        }
    }

    // ---- session lifecycle ----

    fn next_session_id(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId(self.next_session)
    }

    fn current_status(&self) -> Option<CallStatus> {
        self.session.as_ref().map(CallSession::status)
    }

    fn begin(&mut self, session: CallSession) {
        let peer = session.peer.clone();
        let status = session.status();
        self.session = Some(session);
        self.arm_for(status);
        self.status_tx.send_replace(status);
        self.events.emit(CallNotification::StateChanged {
            peer,
            from: CallStatus::Idle,
            to: status,
        });
    }

    fn transition(&mut self, transition: CallTransition) -> Result<(), CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        let from = session.status();
        session.apply_transition(transition)?;
        let to = session.status();
        if from == to {
            return Ok(());
        }

        let peer = session.peer.clone();
        self.arm_for(to);
        self.status_tx.send_replace(to);
        info!(target: "Calls/Manager", "Call with {peer}: {from} -> {to}");
        self.events
            .emit(CallNotification::StateChanged { peer, from, to });
        Ok(())
    }

    /// Replaces the session's timers with the ones `status` needs. Dropping
    /// the old ones cancels them.
    fn arm_for(&mut self, status: CallStatus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let id = session.id;

        session.timer = match TimerKind::for_status(status) {
            Some(kind) => {
                self.timer_seq += 1;
                let token = TimerToken {
                    session: id,
                    kind,
                    seq: self.timer_seq,
                };
                Some(ArmedTimer::timeout(
                    token,
                    self.policy.timeout_for(kind),
                    self.inbox_tx.clone(),
                ))
            }
            None => None,
        };
        session.ticker = match (status, self.policy.duration_tick) {
            (CallStatus::Active, Some(period)) => {
                Some(ArmedTimer::ticker(id, period, self.inbox_tx.clone()))
            }
            _ => None,
        };
    }

    /// Ends the current session, if any. Releases its resources exactly
    /// once; calling it again is a no-op.
    async fn finish(&mut self, reason: EndReason) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.disarm();
        session.release();

        let from = session.status();
        let duration = session.elapsed();
        if let Err(e) = session.apply_transition(CallTransition::Ended { reason, duration }) {
            warn!(target: "Calls/Manager", "Unexpected end transition: {e}");
        }

        if sends_call_end(reason, session.signalled) {
            self.send(CallSignal::call_end(
                self.local.clone(),
                session.peer.clone(),
            ))
            .await;
        }

        self.status_tx.send_replace(CallStatus::Idle);
        info!(target: "Calls/Manager", "Call with {} ended: {reason}", session.peer);
        self.events.emit(CallNotification::StateChanged {
            peer: session.peer.clone(),
            from,
            to: CallStatus::Idle,
        });
        self.events.emit(CallNotification::Ended {
            peer: session.peer,
            reason,
            duration,
        });
    }

    // ---- plumbing ----

    async fn send(&self, signal: CallSignal) {
        let kind = signal.kind();
        let to = signal.recipient().clone();
        if let Err(e) = self.transport.send(signal).await {
            warn!(target: "Calls/Manager", "Failed to send {kind} to {to}: {e:#}");
        }
    }

    async fn send_to_peer(&mut self, build: impl FnOnce(Identity, Identity) -> CallSignal) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.signalled = true;
        let signal = build(self.local.clone(), session.peer.clone());
        self.send(signal).await;
    }

    /// Runs one operation on the session's peer connection. An engine error
    /// fails the negotiation. `None` means the caller must stop: the session
    /// is gone, was interrupted, or has just been failed.
    async fn engine_op<T, F, Fut>(&mut self, op: F) -> Option<T>
    where
        F: FnOnce(Arc<dyn PeerConnection>) -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let Some(connection) = self.session.as_ref().and_then(CallSession::connection) else {
            warn!(target: "Calls/Manager", "No peer connection for engine operation");
            return None;
        };
        match self.guarded(op(connection)).await? {
            Ok(value) => Some(value),
            Err(e) => {
                self.abort_negotiation(e).await;
                None
            }
        }
    }

    /// Awaits `op` while watching the queue. Returns `None` if an input that
    /// ends the current session arrived first; that input is then handled
    /// next. Other inputs are deferred in arrival order.
    async fn guarded<T>(&mut self, op: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(op);
        loop {
            let step = tokio::select! {
                biased;
                input = self.inbox_rx.recv() => Step::Input(input),
                out = &mut op => Step::Done(out),
            };
            match step {
                Step::Done(out) => return Some(out),
                Step::Input(None) => return None,
                Step::Input(Some(Input::Command(Command::Snapshot(reply)))) => {
                    let _ = reply.send(Ok(self.snapshot()));
                }
                Step::Input(Some(input)) => {
                    if self.interrupts(&input) {
                        debug!(target: "Calls/Manager", "In-flight operation interrupted by {input:?}");
                        self.deferred.push_front(input);
                        return None;
                    }
                    self.deferred.push_back(input);
                }
            }
        }
    }

    fn interrupts(&self, input: &Input) -> bool {
        let Some(session) = &self.session else {
            return matches!(input, Input::Shutdown);
        };
        match input {
            Input::Shutdown => true,
            Input::Command(Command::End(_) | Command::Decline(_)) => true,
            Input::Signal(signal) => {
                signal.kind() == SignalingType::CallEnd
                    && signal.sender() == &session.peer
                    && signal.recipient() == &self.local
            }
            Input::Timeout(token) => session.timer_token() == Some(*token),
            Input::Session(
                id,
                SessionEvent::ConnectionFailed(_) | SessionEvent::LocalTrackEnded,
            ) => *id == session.id,
            _ => false,
        }
    }
}
