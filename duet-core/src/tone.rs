//! Looping call tones
//!
//! One player serves both roles: the ringtone on the callee side and the
//! ringback on the caller side. Primary playback failures fall back to the
//! sink's fallback tone on every iteration.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Tone errors
#[derive(Error, Debug)]
pub enum ToneError {
    /// Output device refused playback
    #[error("Playback failed: {0}")]
    Playback(String),
}

/// Which tone to play
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToneRole {
    /// Incoming call
    Ringtone,
    /// Outgoing call waiting for an answer
    Ringback,
}

/// Audio output for tones
#[async_trait]
pub trait ToneSink: Send + Sync {
    /// Play one cycle of the primary tone
    async fn play(&self, role: ToneRole) -> Result<(), ToneError>;

    /// Play one cycle of the fallback tone
    async fn play_fallback(&self, role: ToneRole) -> Result<(), ToneError>;
}

/// Sink that plays nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentToneSink;

#[async_trait]
impl ToneSink for SilentToneSink {
    async fn play(&self, role: ToneRole) -> Result<(), ToneError> {
        tracing::trace!(role = ?role, "Silent tone");
        Ok(())
    }

    async fn play_fallback(&self, _role: ToneRole) -> Result<(), ToneError> {
        Ok(())
    }
}

/// Tone loop timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    /// Time between ringtone cycles
    #[serde(with = "humantime_serde")]
    pub ringtone_interval: Duration,
    /// Time between ringback cycles
    #[serde(with = "humantime_serde")]
    pub ringback_interval: Duration,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            ringtone_interval: Duration::from_secs(3),
            ringback_interval: Duration::from_secs(4),
        }
    }
}

impl ToneConfig {
    fn interval(&self, role: ToneRole) -> Duration {
        match role {
            ToneRole::Ringtone => self.ringtone_interval,
            ToneRole::Ringback => self.ringback_interval,
        }
    }
}

/// Plays a tone on a fixed interval until stopped
pub struct LoopingTone {
    sink: Arc<dyn ToneSink>,
    config: ToneConfig,
    current: Mutex<Option<(ToneRole, JoinHandle<()>)>>,
}

impl LoopingTone {
    /// Create a player over `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn ToneSink>, config: ToneConfig) -> Self {
        Self {
            sink,
            config,
            current: Mutex::new(None),
        }
    }

    /// Start looping `role`, replacing whatever was playing
    pub fn start(&self, role: ToneRole) {
        let sink = Arc::clone(&self.sink);
        let interval = self.config.interval(role);
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = sink.play(role).await {
                    tracing::debug!(role = ?role, error = %e, "Tone playback failed, using fallback");
                    if let Err(e) = sink.play_fallback(role).await {
                        tracing::warn!(role = ?role, error = %e, "Fallback tone failed");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        if let Some((_, previous)) = self.current.lock().replace((role, task)) {
            previous.abort();
        }
        tracing::debug!(role = ?role, "Tone started");
    }

    /// Stop the current tone, if any
    pub fn stop(&self) {
        if let Some((role, task)) = self.current.lock().take() {
            task.abort();
            tracing::debug!(role = ?role, "Tone stopped");
        }
    }

    /// Role currently playing
    #[must_use]
    pub fn current_role(&self) -> Option<ToneRole> {
        self.current.lock().as_ref().map(|(role, _)| *role)
    }
}

impl Drop for LoopingTone {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        played: AtomicUsize,
        fallbacks: AtomicUsize,
        fail_primary: bool,
    }

    #[async_trait]
    impl ToneSink for CountingSink {
        async fn play(&self, _role: ToneRole) -> Result<(), ToneError> {
            self.played.fetch_add(1, Ordering::SeqCst);
            if self.fail_primary {
                return Err(ToneError::Playback("no output".to_string()));
            }
            Ok(())
        }

        async fn play_fallback(&self, _role: ToneRole) -> Result<(), ToneError> {
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tone_loops_until_stopped() {
        let sink = Arc::new(CountingSink::default());
        let tone = LoopingTone::new(sink.clone(), ToneConfig::default());

        tone.start(ToneRole::Ringback);
        tokio::time::sleep(Duration::from_millis(8_500)).await;
        assert_eq!(sink.played.load(Ordering::SeqCst), 3);

        tone.stop();
        assert!(tone.current_role().is_none());
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.played.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_on_primary_failure() {
        let sink = Arc::new(CountingSink {
            fail_primary: true,
            ..Default::default()
        });
        let tone = LoopingTone::new(sink.clone(), ToneConfig::default());

        tone.start(ToneRole::Ringtone);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(sink.fallbacks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_replaces_previous_role() {
        let tone = LoopingTone::new(Arc::new(SilentToneSink), ToneConfig::default());
        tone.start(ToneRole::Ringtone);
        tone.start(ToneRole::Ringback);
        assert_eq!(tone.current_role(), Some(ToneRole::Ringback));
    }

    #[test]
    fn test_config_from_json() {
        let config: ToneConfig = serde_json::from_str(r#"{"ringtone_interval":"2s"}"#).unwrap();
        assert_eq!(config.ringtone_interval, Duration::from_secs(2));
        assert_eq!(config.ringback_interval, Duration::from_secs(4));
    }
}
