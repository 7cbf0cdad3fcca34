use chrono::Local;
use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use peercall::calls::sim::{SimulatedEngine, SimulatedMicrophone};
use peercall::calls::{
    CallAdapters, CallManager, CallNotification, CallStatus, InMemoryRelay, format_call_duration,
};
use peercall::config::CallConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

// Runs two (or three) simulated endpoints over an in-process relay.
//
// Usage:
//   cargo run                              # alice calls bob, bob answers
//   cargo run -- decline                   # bob declines
//   cargo run -- unanswered --dial-timeout 3
//   cargo run -- busy                      # carol calls bob mid-call
//   cargo run -- denied                    # alice has no microphone
//   cargo run -- --config peercall.json    # load timeouts and ICE servers

#[derive(Parser, Debug)]
#[command(name = "peercall", about = "Simulated peer-to-peer audio calls")]
struct Args {
    #[arg(value_enum, default_value_t = Scenario::Connect)]
    scenario: Scenario,

    /// JSON call configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long the connected call lasts before alice hangs up.
    #[arg(long, default_value_t = 3)]
    talk_secs: u64,

    /// Overrides the configured dial timeout, in seconds.
    #[arg(long)]
    dial_timeout: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Connect,
    Decline,
    Unanswered,
    Busy,
    Denied,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let mut config = match &args.config {
        Some(path) => CallConfig::from_file(path)?,
        None => CallConfig::default(),
    };
    if let Some(secs) = args.dial_timeout {
        config.dial_timeout_secs = secs;
    }
    info!("Running {:?} scenario", args.scenario);

    let relay = InMemoryRelay::new();
    let alice_mic = match args.scenario {
        Scenario::Denied => SimulatedMicrophone::denied(),
        _ => SimulatedMicrophone::new(),
    };
    let alice = start_peer("alice", &config, &relay, alice_mic).await?;
    let bob = Arc::new(start_peer("bob", &config, &relay, SimulatedMicrophone::new()).await?);
    let _loggers = [log_notifications(&alice), log_notifications(&bob)];

    match args.scenario {
        Scenario::Connect => {
            answer_incoming(bob.clone(), true);
            alice.initiate_call("bob").await?;
            wait_for(&alice, CallStatus::Active, config.dial_timeout()).await?;
            tokio::time::sleep(Duration::from_secs(args.talk_secs)).await;
            let muted = alice.toggle_mute().await?;
            info!("alice muted: {muted}");
            tokio::time::sleep(Duration::from_secs(1)).await;
            alice.end_call().await?;
            wait_for(&bob, CallStatus::Idle, Duration::from_secs(5)).await?;
        }
        Scenario::Decline => {
            answer_incoming(bob.clone(), false);
            alice.initiate_call("bob").await?;
            wait_for(&alice, CallStatus::Idle, config.dial_timeout()).await?;
        }
        Scenario::Unanswered => {
            alice.initiate_call("bob").await?;
            let limit = config.dial_timeout() + Duration::from_secs(5);
            wait_for(&alice, CallStatus::Idle, limit).await?;
            wait_for(&bob, CallStatus::Idle, Duration::from_secs(5)).await?;
        }
        Scenario::Busy => {
            answer_incoming(bob.clone(), true);
            alice.initiate_call("bob").await?;
            wait_for(&alice, CallStatus::Active, config.dial_timeout()).await?;

            let carol = start_peer("carol", &config, &relay, SimulatedMicrophone::new()).await?;
            let _carol_log = log_notifications(&carol);
            carol.initiate_call("bob").await?;
            wait_for(&carol, CallStatus::Idle, config.dial_timeout()).await?;
            alice.end_call().await?;
        }
        Scenario::Denied => match alice.initiate_call("bob").await {
            Ok(()) => warn!("alice was able to call without a microphone"),
            Err(e) => info!("alice could not call: {e}"),
        },
    }

    // Let the notification loggers catch up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

async fn start_peer(
    name: &str,
    config: &CallConfig,
    relay: &Arc<InMemoryRelay>,
    microphone: SimulatedMicrophone,
) -> Result<CallManager, anyhow::Error> {
    let adapters = CallAdapters {
        transport: relay.clone(),
        engine: Arc::new(SimulatedEngine::new()),
        microphone: Arc::new(microphone),
    };
    Ok(CallManager::start(name.into(), config.clone(), adapters).await?)
}

async fn wait_for(
    manager: &CallManager,
    status: CallStatus,
    limit: Duration,
) -> Result<(), anyhow::Error> {
    let mut rx = manager.watch_status();
    tokio::time::timeout(limit, rx.wait_for(|s| *s == status))
        .await
        .map_err(|_| anyhow::anyhow!("{} did not reach {status}", manager.identity()))?
        .map_err(|_| anyhow::anyhow!("{} stopped", manager.identity()))?;
    Ok(())
}

/// Accepts or declines every incoming call on `manager`.
fn answer_incoming(manager: Arc<CallManager>, accept: bool) -> JoinHandle<()> {
    let mut rx = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CallNotification::IncomingCall { from }) => {
                    let result = if accept {
                        manager.accept_call().await
                    } else {
                        manager.decline_call().await
                    };
                    if let Err(e) = result {
                        warn!("{} could not answer {from}: {e}", manager.identity());
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_notifications(manager: &CallManager) -> JoinHandle<()> {
    let name = manager.identity().clone();
    let mut rx = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CallNotification::Duration { peer, elapsed }) => {
                    info!("[{name}] in call with {peer}: {}", format_call_duration(elapsed));
                }
                Ok(CallNotification::Ended {
                    peer,
                    reason,
                    duration,
                }) => {
                    let talked = duration.map(format_call_duration).unwrap_or_default();
                    info!("[{name}] call with {peer} ended: {reason} {talked}");
                }
                Ok(notification) => info!("[{name}] {notification:?}"),
                Err(RecvError::Lagged(n)) => warn!("[{name}] missed {n} notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
