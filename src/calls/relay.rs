//! Signal transport: best-effort delivery of [`CallSignal`]s between identities.
//!
//! The relay is a dumb pipe. It gives at-most-once delivery, no ordering across
//! channels and no durability: a signal sent while the recipient is not
//! subscribed is gone for good. Callers must never assume a send arrived.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

use super::signaling::{CallSignal, Identity};

/// Default per-identity inbound queue depth for [`InMemoryRelay`].
pub const DEFAULT_INBOX_CAPACITY: usize = 64;

/// Out-of-band channel carrying signaling envelopes.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Opens the inbound stream for `identity`. The stream stays open for the
    /// lifetime of the transport.
    async fn subscribe(
        &self,
        identity: &Identity,
    ) -> Result<mpsc::Receiver<CallSignal>, anyhow::Error>;

    /// Fire-and-forget send. `Ok` means the signal left this endpoint, not
    /// that it was delivered.
    async fn send(&self, signal: CallSignal) -> Result<(), anyhow::Error>;
}

type DropFilter = Arc<dyn Fn(&CallSignal) -> bool + Send + Sync>;

/// In-process relay that routes signals between identities in the same process.
///
/// Every signal is encoded to its JSON wire form and decoded again on
/// delivery, so both ends only ever see what a remote relay would carry.
pub struct InMemoryRelay {
    inboxes: DashMap<Identity, mpsc::Sender<CallSignal>>,
    capacity: usize,
    drop_filter: RwLock<Option<DropFilter>>,
    sent: Mutex<Vec<CallSignal>>,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }
}

impl InMemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inboxes: DashMap::new(),
            capacity,
            drop_filter: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Drops every signal for which `filter` returns true, simulating loss.
    pub fn set_drop_filter(&self, filter: impl Fn(&CallSignal) -> bool + Send + Sync + 'static) {
        if let Ok(mut guard) = self.drop_filter.write() {
            *guard = Some(Arc::new(filter));
        }
    }

    pub fn clear_drop_filter(&self) {
        if let Ok(mut guard) = self.drop_filter.write() {
            *guard = None;
        }
    }

    /// Closes the inbound stream of `identity`; later signals to it are lost.
    pub fn unsubscribe(&self, identity: &Identity) {
        self.inboxes.remove(identity);
    }

    pub fn is_subscribed(&self, identity: &Identity) -> bool {
        self.inboxes
            .get(identity)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Every signal handed to [`SignalTransport::send`], delivered or not, in
    /// send order.
    pub fn sent_signals(&self) -> Vec<CallSignal> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn should_drop(&self, signal: &CallSignal) -> bool {
        self.drop_filter
            .read()
            .ok()
            .and_then(|f| f.as_ref().map(|f| f(signal)))
            .unwrap_or(false)
    }
}

#[async_trait]
impl SignalTransport for InMemoryRelay {
    async fn subscribe(
        &self,
        identity: &Identity,
    ) -> Result<mpsc::Receiver<CallSignal>, anyhow::Error> {
        if identity.as_str().is_empty() {
            anyhow::bail!("cannot subscribe an empty identity");
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.inboxes.insert(identity.clone(), tx).is_some() {
            debug!(target: "Calls/Relay", "Replacing existing subscription for {identity}");
        }
        Ok(rx)
    }

    async fn send(&self, signal: CallSignal) -> Result<(), anyhow::Error> {
        let frame = signal.to_json()?;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(signal.clone());
        }

        if self.should_drop(&signal) {
            debug!(target: "Calls/Relay", "Dropped {} for {} (filter)", signal.kind(), signal.recipient());
            return Ok(());
        }

        let Some(inbox) = self.inboxes.get(signal.recipient()).map(|e| e.value().clone()) else {
            debug!(
                target: "Calls/Relay",
                "Dropped {} for {}: not subscribed",
                signal.kind(),
                signal.recipient()
            );
            return Ok(());
        };

        let delivered = CallSignal::from_json(&frame)?;
        if let Err(e) = inbox.try_send(delivered) {
            warn!(target: "Calls/Relay", "Dropped {} for {}: {e}", signal.kind(), signal.recipient());
        }
        Ok(())
    }
}
