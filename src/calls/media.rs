//! Local microphone acquisition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::negotiation::SessionEventSender;

/// Processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A live local audio track.
pub trait AudioTrack: Send + Sync {
    fn id(&self) -> &str;

    /// Enables or disables sending audio without releasing the device.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Releases the capture device. Must be idempotent.
    fn stop(&self);
}

/// Source of microphone tracks (the platform's media devices).
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Opens the microphone. An error means access was denied or no device
    /// is available. The track may later report
    /// [`SessionEvent::LocalTrackEnded`](super::negotiation::SessionEvent::LocalTrackEnded)
    /// through `events`.
    async fn acquire(
        &self,
        constraints: &AudioConstraints,
        events: SessionEventSender,
    ) -> Result<Arc<dyn AudioTrack>, anyhow::Error>;
}

/// Holds the microphone for one session and stops the track when dropped.
///
/// Dropping the session is therefore enough to release the device on every
/// exit path.
pub struct MicrophoneGuard {
    track: Arc<dyn AudioTrack>,
}

impl MicrophoneGuard {
    pub fn new(track: Arc<dyn AudioTrack>) -> Self {
        Self { track }
    }

    pub fn track(&self) -> Arc<dyn AudioTrack> {
        self.track.clone()
    }

    pub fn set_muted(&self, muted: bool) {
        self.track.set_enabled(!muted);
    }
}

impl Drop for MicrophoneGuard {
    fn drop(&mut self) {
        self.track.stop();
    }
}

impl std::fmt::Debug for MicrophoneGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneGuard")
            .field("track", &self.track.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingTrack {
        enabled: AtomicBool,
        stops: AtomicUsize,
    }

    impl AudioTrack for CountingTrack {
        fn id(&self) -> &str {
            "mic-test"
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

    #[test]
    fn test_guard_stops_track_once_on_drop() {
        let track = Arc::new(CountingTrack {
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        });
        let guard = MicrophoneGuard::new(track.clone());

        guard.set_muted(true);
        assert!(!track.is_enabled());
        guard.set_muted(false);
        assert!(track.is_enabled());
        assert_eq!(track.stops.load(Ordering::SeqCst), 0);

        drop(guard);
        assert_eq!(track.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_constraints_enable_processing() {
        let c = AudioConstraints::default();
        assert!(c.echo_cancellation && c.noise_suppression && c.auto_gain_control);

        let parsed: AudioConstraints =
            serde_json::from_str(r#"{"noise_suppression": false}"#).unwrap();
        assert!(parsed.echo_cancellation);
        assert!(!parsed.noise_suppression);
    }
}
