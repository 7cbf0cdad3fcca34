use async_trait::async_trait;
use peercall::calls::sim::{SimFault, SimulatedEngine, SimulatedMicrophone};
use peercall::calls::{
    AudioConstraints, AudioTrack, CallAdapters, CallError, CallFailure, CallManager,
    CallNotification, CallStatus, EndReason, InMemoryRelay, MicrophoneSource, SignalingType,
};
use peercall::calls::negotiation::SessionEventSender;
use peercall::config::CallConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Peer {
    manager: CallManager,
    engine: Arc<SimulatedEngine>,
    microphone: Arc<SimulatedMicrophone>,
    events: broadcast::Receiver<CallNotification>,
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quiet_config() -> CallConfig {
    CallConfig {
        duration_tick_ms: None,
        ..Default::default()
    }
}

async fn start_peer_with(
    name: &str,
    relay: &Arc<InMemoryRelay>,
    engine: SimulatedEngine,
    microphone: SimulatedMicrophone,
    config: CallConfig,
) -> Peer {
    let engine = Arc::new(engine);
    let microphone = Arc::new(microphone);
    let adapters = CallAdapters {
        transport: relay.clone(),
        engine: engine.clone(),
        microphone: microphone.clone(),
    };
    let manager = CallManager::start(name.into(), config, adapters)
        .await
        .expect("manager should start");
    let events = manager.subscribe();
    Peer {
        manager,
        engine,
        microphone,
        events,
    }
}

async fn start_peer(name: &str, relay: &Arc<InMemoryRelay>) -> Peer {
    start_peer_with(
        name,
        relay,
        SimulatedEngine::new(),
        SimulatedMicrophone::new(),
        quiet_config(),
    )
    .await
}

async fn wait_status(manager: &CallManager, status: CallStatus) {
    let mut rx = manager.watch_status();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {status}", manager.identity()))
        .expect("manager stopped");
}

async fn next_ended(
    events: &mut broadcast::Receiver<CallNotification>,
) -> (EndReason, Option<Duration>) {
    loop {
        let notification = tokio::time::timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("timed out waiting for the call to end")
            .expect("event bus closed");
        if let CallNotification::Ended {
            reason, duration, ..
        } = notification
        {
            return (reason, duration);
        }
    }
}

fn drain(events: &mut broadcast::Receiver<CallNotification>) -> Vec<CallNotification> {
    let mut out = Vec::new();
    while let Ok(notification) = events.try_recv() {
        out.push(notification);
    }
    out
}

/// Lets every queued task run without advancing time past any real timer.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn sent_kinds(relay: &InMemoryRelay) -> Vec<SignalingType> {
    relay.sent_signals().iter().map(|s| s.kind()).collect()
}

async fn connect(relay: &Arc<InMemoryRelay>, alice: &Peer, bob: &Peer) {
    alice.manager.initiate_call("bob").await.unwrap();
    wait_status(&bob.manager, CallStatus::RingingLocal).await;
    bob.manager.accept_call().await.unwrap();
    wait_status(&alice.manager, CallStatus::Active).await;
    wait_status(&bob.manager, CallStatus::Active).await;
    settle().await;
    assert!(!relay.sent_signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer("alice", &relay).await;
    let started = tokio::time::Instant::now();

    // Nobody is subscribed as bob, so the request is lost.
    alice.manager.initiate_call("bob").await.unwrap();
    assert_eq!(alice.manager.status(), CallStatus::Dialing);

    let (reason, duration) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::Unanswered));
    assert_eq!(duration, None);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(alice.manager.status(), CallStatus::Idle);

    let track = alice.microphone.last_track().expect("microphone was opened");
    assert_eq!(track.stop_count(), 1);
    assert_eq!(alice.engine.last_connection().unwrap().close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dial_timeout_hangs_up_ringing_peer() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer("alice", &relay).await;
    let mut bob = start_peer("bob", &relay).await;

    alice.manager.initiate_call("bob").await.unwrap();
    wait_status(&bob.manager, CallStatus::RingingLocal).await;

    let (reason, _) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::Unanswered));
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::RemoteHangup));
    assert_eq!(
        sent_kinds(&relay),
        vec![SignalingType::CallRequest, SignalingType::CallEnd]
    );
}

#[tokio::test(start_paused = true)]
async fn test_declined_call() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer("alice", &relay).await;
    let mut bob = start_peer("bob", &relay).await;

    alice.manager.initiate_call("bob").await.unwrap();
    wait_status(&bob.manager, CallStatus::RingingLocal).await;
    assert!(
        drain(&mut bob.events)
            .contains(&CallNotification::IncomingCall { from: "alice".into() })
    );

    bob.manager.decline_call().await.unwrap();

    let (reason, _) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::Declined));
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::LocalDecline);
    assert_eq!(bob.manager.status(), CallStatus::Idle);

    // No description was ever exchanged and bob never opened his microphone.
    assert_eq!(
        sent_kinds(&relay),
        vec![SignalingType::CallRequest, SignalingType::CallDecline]
    );
    assert_eq!(bob.microphone.acquire_count(), 0);
    assert_eq!(alice.microphone.live_tracks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_connected_call_exchanges_descriptions_and_candidates() {
    init_logging();
    let relay = InMemoryRelay::new();
    let alice = start_peer("alice", &relay).await;
    let bob = start_peer("bob", &relay).await;

    connect(&relay, &alice, &bob).await;

    // 1. Signal order: call-accept, offer, answer, candidates after the offer
    let kinds = sent_kinds(&relay);
    let position = |kind| kinds.iter().position(|k| *k == kind).unwrap();
    assert_eq!(kinds[0], SignalingType::CallRequest);
    assert!(position(SignalingType::CallAccept) < position(SignalingType::Offer));
    assert!(position(SignalingType::Offer) < position(SignalingType::Answer));
    assert!(position(SignalingType::Offer) < position(SignalingType::IceCandidate));

    // 2. Every transmitted candidate was applied by the other side, in order
    let sent_by = |name: &str| {
        relay
            .sent_signals()
            .iter()
            .filter(|s| s.kind() == SignalingType::IceCandidate && s.sender().as_str() == name)
            .filter_map(|s| s.candidate().cloned())
            .collect::<Vec<_>>()
    };
    let alice_candidates = sent_by("alice");
    let bob_candidates = sent_by("bob");
    assert_eq!(alice_candidates.len(), 2);
    assert_eq!(bob_candidates.len(), 2);
    assert_eq!(
        bob.engine.last_connection().unwrap().applied_candidates(),
        alice_candidates
    );
    assert_eq!(
        alice.engine.last_connection().unwrap().applied_candidates(),
        bob_candidates
    );

    // 3. Both sessions are active with nothing left in the buffer
    for peer in [&alice, &bob] {
        let snapshot = peer.manager.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.status, CallStatus::Active);
        assert!(snapshot.remote_description_set);
        assert_eq!(snapshot.buffered_candidates, 0);
        assert!(snapshot.start_time.is_some());
    }
    assert_eq!(
        alice.engine.last_connection().unwrap().attached_tracks(),
        vec!["mic-1".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout_on_both_sides() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer("alice", &relay).await;
    let mut bob = start_peer("bob", &relay).await;

    // The offer never arrives, and neither does either side's call-end.
    relay.set_drop_filter(|s| {
        matches!(s.kind(), SignalingType::Offer | SignalingType::CallEnd)
    });

    alice.manager.initiate_call("bob").await.unwrap();
    wait_status(&bob.manager, CallStatus::RingingLocal).await;
    bob.manager.accept_call().await.unwrap();
    wait_status(&alice.manager, CallStatus::Negotiating).await;

    let (reason, _) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::NegotiationFailed));
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::NegotiationFailed));

    // Both had transmitted, so both attempted a call-end.
    let call_ends: Vec<_> = relay
        .sent_signals()
        .into_iter()
        .filter(|s| s.kind() == SignalingType::CallEnd)
        .map(|s| s.sender().to_string())
        .collect();
    assert_eq!(call_ends.len(), 2);
    assert!(call_ends.contains(&"alice".to_string()));
    assert!(call_ends.contains(&"bob".to_string()));

    for peer in [&alice, &bob] {
        assert_eq!(peer.microphone.live_tracks(), 0);
        assert_eq!(peer.engine.last_connection().unwrap().close_count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_microphone_denied_before_any_signal() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer_with(
        "alice",
        &relay,
        SimulatedEngine::new(),
        SimulatedMicrophone::denied(),
        quiet_config(),
    )
    .await;
    let bob = start_peer("bob", &relay).await;

    let err = alice.manager.initiate_call("bob").await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Failed(CallFailure::MediaAccessDenied)
    ));
    assert_eq!(alice.manager.status(), CallStatus::Idle);

    let notifications = drain(&mut alice.events);
    assert_eq!(notifications.len(), 3);
    assert!(matches!(
        notifications[2],
        CallNotification::Ended {
            reason: EndReason::Failed(CallFailure::MediaAccessDenied),
            ..
        }
    ));

    settle().await;
    assert!(relay.sent_signals().is_empty());
    assert!(alice.engine.connections().is_empty());
    assert_eq!(bob.manager.status(), CallStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_callee_microphone_denied_sends_nothing() {
    init_logging();
    let relay = InMemoryRelay::new();
    let alice = start_peer("alice", &relay).await;
    let mut bob = start_peer_with(
        "bob",
        &relay,
        SimulatedEngine::new(),
        SimulatedMicrophone::denied(),
        quiet_config(),
    )
    .await;

    alice.manager.initiate_call("bob").await.unwrap();
    wait_status(&bob.manager, CallStatus::RingingLocal).await;

    let err = bob.manager.accept_call().await.unwrap_err();
    assert!(matches!(
        err,
        CallError::Failed(CallFailure::MediaAccessDenied)
    ));
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::MediaAccessDenied));
    assert_eq!(sent_kinds(&relay), vec![SignalingType::CallRequest]);
    assert_eq!(alice.manager.status(), CallStatus::Dialing);
}

#[tokio::test(start_paused = true)]
async fn test_local_hangup_ends_both_sides() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer("alice", &relay).await;
    let mut bob = start_peer("bob", &relay).await;
    connect(&relay, &alice, &bob).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    alice.manager.end_call().await.unwrap();

    let (reason, duration) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::LocalHangup);
    assert!(duration.unwrap() >= Duration::from_secs(5));
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::RemoteHangup));

    for peer in [&alice, &bob] {
        assert_eq!(peer.manager.status(), CallStatus::Idle);
        assert_eq!(peer.microphone.last_track().unwrap().stop_count(), 1);
        assert_eq!(peer.engine.last_connection().unwrap().close_count(), 1);
    }
    assert!(matches!(
        alice.manager.end_call().await,
        Err(CallError::NoActiveCall)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_toggle_mute_only_while_active() {
    init_logging();
    let relay = InMemoryRelay::new();
    let alice = start_peer("alice", &relay).await;
    let bob = start_peer("bob", &relay).await;

    assert!(matches!(
        alice.manager.toggle_mute().await,
        Err(CallError::NoActiveCall)
    ));
    alice.manager.initiate_call("bob").await.unwrap();
    assert!(matches!(
        alice.manager.toggle_mute().await,
        Err(CallError::WrongState {
            actual: CallStatus::Dialing,
            ..
        })
    ));
    wait_status(&bob.manager, CallStatus::RingingLocal).await;
    bob.manager.accept_call().await.unwrap();
    wait_status(&alice.manager, CallStatus::Active).await;
    settle().await;

    let sent_before = relay.sent_signals().len();
    let track = alice.microphone.last_track().unwrap();

    assert!(alice.manager.toggle_mute().await.unwrap());
    assert!(!track.is_enabled());
    assert!(alice.manager.snapshot().await.unwrap().unwrap().muted);

    assert!(!alice.manager.toggle_mute().await.unwrap());
    assert!(track.is_enabled());

    // Muting is purely local.
    settle().await;
    assert_eq!(relay.sent_signals().len(), sent_before);
    assert_eq!(alice.manager.status(), CallStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_duration_ticks_while_active() {
    init_logging();
    let relay = InMemoryRelay::new();
    let config = CallConfig {
        duration_tick_ms: Some(1000),
        ..Default::default()
    };
    let mut alice = start_peer_with(
        "alice",
        &relay,
        SimulatedEngine::new(),
        SimulatedMicrophone::new(),
        config.clone(),
    )
    .await;
    let bob = start_peer_with(
        "bob",
        &relay,
        SimulatedEngine::new(),
        SimulatedMicrophone::new(),
        config,
    )
    .await;
    connect(&relay, &alice, &bob).await;
    drain(&mut alice.events);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let ticks: Vec<Duration> = drain(&mut alice.events)
        .into_iter()
        .filter_map(|n| match n {
            CallNotification::Duration { elapsed, .. } => Some(elapsed),
            _ => None,
        })
        .collect();
    assert_eq!(ticks.len(), 3);
    assert!(ticks.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(ticks[2].as_secs(), 3);

    alice.manager.end_call().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(
        !drain(&mut alice.events)
            .iter()
            .any(|n| matches!(n, CallNotification::Duration { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_engine_failure_fails_negotiation() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer_with(
        "alice",
        &relay,
        SimulatedEngine::new().with_fault(SimFault::CreateOffer),
        SimulatedMicrophone::new(),
        quiet_config(),
    )
    .await;
    let mut bob = start_peer("bob", &relay).await;

    alice.manager.initiate_call("bob").await.unwrap();
    wait_status(&bob.manager, CallStatus::RingingLocal).await;
    bob.manager.accept_call().await.unwrap();

    let (reason, _) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::NegotiationFailed));
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::RemoteHangup));
    assert!(!sent_kinds(&relay).contains(&SignalingType::Offer));
}

#[tokio::test(start_paused = true)]
async fn test_lost_connectivity_and_revoked_microphone_end_the_call() {
    init_logging();
    let relay = InMemoryRelay::new();
    let mut alice = start_peer("alice", &relay).await;
    let mut bob = start_peer("bob", &relay).await;

    connect(&relay, &alice, &bob).await;
    alice
        .engine
        .last_connection()
        .unwrap()
        .fail_connectivity("ICE failed");
    let (reason, _) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::NegotiationFailed));
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::RemoteHangup));

    connect(&relay, &alice, &bob).await;
    bob.microphone.last_track().unwrap().revoke();
    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::MediaAccessDenied));
    let (reason, _) = next_ended(&mut alice.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::RemoteHangup));
    assert_eq!(bob.microphone.live_tracks(), 0);
}

/// Takes `delay` to open the microphone.
struct SlowMicrophone {
    inner: SimulatedMicrophone,
    delay: Duration,
}

#[async_trait]
impl MicrophoneSource for SlowMicrophone {
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
        events: SessionEventSender,
    ) -> Result<Arc<dyn AudioTrack>, anyhow::Error> {
        tokio::time::sleep(self.delay).await;
        self.inner.acquire(constraints, events).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_call_interrupts_setup() {
    init_logging();
    let relay = InMemoryRelay::new();
    let microphone = Arc::new(SlowMicrophone {
        inner: SimulatedMicrophone::new(),
        delay: Duration::from_secs(10),
    });
    let manager = CallManager::start(
        "alice".into(),
        quiet_config(),
        CallAdapters {
            transport: relay.clone(),
            engine: Arc::new(SimulatedEngine::new()),
            microphone: microphone.clone(),
        },
    )
    .await
    .unwrap();
    let mut events = manager.subscribe();

    let (initiated, ended) = tokio::join!(manager.initiate_call("bob"), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.end_call().await
    });

    assert!(matches!(initiated, Err(CallError::Interrupted)));
    ended.unwrap();
    let (reason, _) = next_ended(&mut events).await;
    assert_eq!(reason, EndReason::LocalHangup);
    assert_eq!(manager.status(), CallStatus::Idle);
    assert_eq!(microphone.inner.acquire_count(), 0);
    assert_eq!(sent_kinds(&relay), vec![SignalingType::CallEnd]);
}

#[tokio::test(start_paused = true)]
async fn test_initiate_rejects_self_and_second_call() {
    init_logging();
    let relay = InMemoryRelay::new();
    let alice = start_peer("alice", &relay).await;

    assert!(matches!(
        alice.manager.initiate_call("alice").await,
        Err(CallError::SelfCall(_))
    ));
    assert!(matches!(
        alice.manager.accept_call().await,
        Err(CallError::NoActiveCall)
    ));

    alice.manager.initiate_call("bob").await.unwrap();
    assert!(matches!(
        alice.manager.initiate_call("carol").await,
        Err(CallError::AlreadyInCall(peer)) if peer == "bob"
    ));
    assert!(matches!(
        alice.manager.accept_call().await,
        Err(CallError::WrongState { expected: "RingingLocal", .. })
    ));

    // Declining outside of ringing hangs up.
    alice.manager.decline_call().await.unwrap();
    assert_eq!(alice.manager.status(), CallStatus::Idle);
    assert_eq!(
        sent_kinds(&relay),
        vec![SignalingType::CallRequest, SignalingType::CallEnd]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_hangs_up_active_call() {
    init_logging();
    let relay = InMemoryRelay::new();
    let alice = start_peer("alice", &relay).await;
    let mut bob = start_peer("bob", &relay).await;
    connect(&relay, &alice, &bob).await;

    let microphone = alice.microphone.clone();
    alice.manager.shutdown().await;

    let (reason, _) = next_ended(&mut bob.events).await;
    assert_eq!(reason, EndReason::Failed(CallFailure::RemoteHangup));
    assert_eq!(microphone.live_tracks(), 0);
}

#[tokio::test]
async fn test_start_fails_when_subscribe_fails() {
    let relay = InMemoryRelay::new();
    let result = CallManager::start(
        "".into(),
        CallConfig::default(),
        CallAdapters {
            transport: relay,
            engine: Arc::new(SimulatedEngine::new()),
            microphone: Arc::new(SimulatedMicrophone::new()),
        },
    )
    .await;
    assert!(matches!(result, Err(CallError::Transport(_))));
}
