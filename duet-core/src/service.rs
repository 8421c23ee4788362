//! Endpoint orchestration
//!
//! Wires a signaling transport, media backend and history store into one
//! running endpoint and owns the inbound signaling loop.

use crate::call::{CallError, CallManager, CallManagerConfig};
use crate::directory::{Presence, ProfileDirectory};
use crate::history::{HistoryRecorder, HistoryStore, MemoryHistoryStore};
use crate::identity::PeerIdentity;
use crate::media::MediaSessionManager;
use crate::signaling::{SignalingChannel, SignalingTransport};
use crate::tone::ToneSink;
use crate::types::{CallEvent, CallState};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// A running call endpoint
pub struct CallService<I: PeerIdentity> {
    channel: Arc<SignalingChannel<I>>,
    manager: CallManager<I>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<I: PeerIdentity> CallService<I> {
    /// Start building a service for `local` over `transport`
    pub fn builder(
        local: I,
        transport: Arc<dyn SignalingTransport<I>>,
        media: Arc<dyn MediaSessionManager>,
    ) -> CallServiceBuilder<I> {
        CallServiceBuilder {
            local,
            transport,
            media,
            config: CallManagerConfig::default(),
            store: None,
            directory: None,
            presence: None,
            tone_sink: None,
        }
    }

    /// Begin consuming inbound signals
    ///
    /// # Errors
    ///
    /// Returns error if the service is already running
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut slot = self.receive_loop.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(ServiceError::InitError("service already started".to_string()));
        }
        *slot = Some(self.channel.spawn());
        tracing::info!(local = %self.channel.local_identity(), "Call service started");
        Ok(())
    }

    /// End any active call and stop the signaling loop
    pub async fn shutdown(&self) {
        match self.manager.state().await {
            CallState::Incoming => {
                if let Err(e) = self.manager.reject().await {
                    tracing::debug!(error = %e, "Reject on shutdown failed");
                }
            }
            CallState::Calling | CallState::InCall => {
                if let Err(e) = self.manager.end().await {
                    tracing::debug!(error = %e, "Hangup on shutdown failed");
                }
            }
            CallState::Idle => {}
        }
        if let Some(task) = self.receive_loop.lock().take() {
            task.abort();
        }
        tracing::info!(local = %self.channel.local_identity(), "Call service stopped");
    }

    /// Whether the signaling loop is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.receive_loop
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Call state machine
    #[must_use]
    pub fn calls(&self) -> &CallManager<I> {
        &self.manager
    }

    /// Signaling channel
    #[must_use]
    pub fn channel(&self) -> &Arc<SignalingChannel<I>> {
        &self.channel
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.manager.subscribe_events()
    }
}

impl<I: PeerIdentity> Drop for CallService<I> {
    fn drop(&mut self) {
        if let Some(task) = self.receive_loop.lock().take() {
            task.abort();
        }
    }
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder<I: PeerIdentity> {
    local: I,
    transport: Arc<dyn SignalingTransport<I>>,
    media: Arc<dyn MediaSessionManager>,
    config: CallManagerConfig,
    store: Option<Arc<dyn HistoryStore>>,
    directory: Option<Arc<dyn ProfileDirectory>>,
    presence: Option<Arc<dyn Presence>>,
    tone_sink: Option<Arc<dyn ToneSink>>,
}

impl<I: PeerIdentity> CallServiceBuilder<I> {
    /// Set call manager configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist history to `store`
    #[must_use]
    pub fn with_history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Resolve participant profiles through `directory`
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn ProfileDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Use `presence` for missed-call proxying
    #[must_use]
    pub fn with_presence(mut self, presence: Arc<dyn Presence>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Play tones through `sink`
    #[must_use]
    pub fn with_tone_sink(mut self, sink: Arc<dyn ToneSink>) -> Self {
        self.tone_sink = Some(sink);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if the call manager cannot attach to the channel
    pub fn build(self) -> Result<CallService<I>, ServiceError> {
        let channel = Arc::new(SignalingChannel::new(self.local, self.transport));

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryHistoryStore::new()));
        let mut recorder = HistoryRecorder::new(store);
        if let Some(directory) = self.directory {
            recorder = recorder.with_directory(directory);
        }

        let mut builder = CallManager::builder(Arc::clone(&channel), self.media)
            .config(self.config)
            .history(recorder);
        if let Some(presence) = self.presence {
            builder = builder.presence(presence);
        }
        if let Some(sink) = self.tone_sink {
            builder = builder.tone_sink(sink);
        }
        let manager = builder.build()?;

        Ok(CallService {
            channel,
            manager,
            receive_loop: Mutex::new(None),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use crate::media::{SimulatedMediaConfig, SimulatedMediaManager};
    use crate::transport::MemoryRelay;

    fn service(relay: &MemoryRelay<UserId>, user: &str) -> CallService<UserId> {
        let transport = Arc::new(relay.connect(UserId::new(user)));
        let media = Arc::new(SimulatedMediaManager::new(SimulatedMediaConfig::default()));
        CallService::builder(UserId::new(user), transport, media)
            .with_presence(Arc::new(relay.clone()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let relay = MemoryRelay::new();
        let svc = service(&relay, "alice");
        svc.start().unwrap();
        assert!(svc.is_running());
        assert!(matches!(svc.start(), Err(ServiceError::InitError(_))));
        svc.shutdown().await;
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn test_manager_is_registered_on_channel() {
        let relay = MemoryRelay::new();
        let svc = service(&relay, "alice");
        assert!(svc.channel().has_handler());
        assert_eq!(svc.calls().local_identity(), &UserId::new("alice"));
        assert_eq!(svc.calls().state().await, CallState::Idle);
    }
}
