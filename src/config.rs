use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::calls::events::DEFAULT_EVENT_CAPACITY;
use crate::calls::media::AudioConstraints;
use crate::calls::negotiation::IceServer;

/// Free public STUN servers used when nothing else is configured.
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// How long a caller waits for call-accept or call-decline.
    pub dial_timeout_secs: u64,
    /// How long the description/candidate exchange may take.
    pub negotiation_timeout_secs: u64,
    /// Period of duration notifications while active; `None` disables them.
    pub duration_tick_ms: Option<u64>,
    pub ice_servers: Vec<IceServer>,
    pub audio: AudioConstraints,
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
            negotiation_timeout_secs: 20,
            duration_tick_ms: Some(1000),
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
            audio: AudioConstraints::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CallConfig {
    pub fn from_json_str(json: &str) -> Result<Self, anyhow::Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn duration_tick(&self) -> Option<Duration> {
        self.duration_tick_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
