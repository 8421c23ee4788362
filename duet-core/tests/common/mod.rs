//! Two-endpoint harness over an in-memory relay with shared history

#![allow(dead_code)]

use duet_core::media::{SimulatedMediaConfig, SimulatedMediaManager};
use duet_core::{
    CallEvent, CallHistoryRecord, CallManager, CallManagerConfig, CallService, CallState,
    HistoryStore, MemoryHistoryStore, MemoryRelay, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

/// Let relay loops and spawned tasks run; advances paused time slightly
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub struct Harness {
    pub relay: MemoryRelay<UserId>,
    pub store: Arc<MemoryHistoryStore>,
    pub config: CallManagerConfig,
}

pub struct Endpoint {
    pub user: UserId,
    pub service: CallService<UserId>,
    pub media: Arc<SimulatedMediaManager>,
    pub events: broadcast::Receiver<CallEvent<UserId>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallManagerConfig::default())
    }

    pub fn with_config(config: CallManagerConfig) -> Self {
        Self {
            relay: MemoryRelay::new(),
            store: Arc::new(MemoryHistoryStore::new()),
            config,
        }
    }

    pub fn endpoint(&self, name: &str) -> Endpoint {
        self.endpoint_with_media(name, SimulatedMediaConfig::default())
    }

    pub fn endpoint_with_media(&self, name: &str, media: SimulatedMediaConfig) -> Endpoint {
        let user = UserId::new(name);
        let transport = Arc::new(self.relay.connect(user.clone()));
        let media = Arc::new(SimulatedMediaManager::new(media));
        let store: Arc<dyn HistoryStore> = self.store.clone();
        let service = CallService::builder(user.clone(), transport, media.clone())
            .with_config(self.config.clone())
            .with_history_store(store)
            .with_presence(Arc::new(self.relay.clone()))
            .build()
            .unwrap();
        service.start().unwrap();
        let events = service.subscribe_events();
        Endpoint {
            user,
            service,
            media,
            events,
        }
    }

    pub async fn records_for(&self, owner: &str) -> Vec<CallHistoryRecord> {
        self.store.list_by_owner(owner).await.unwrap()
    }
}

impl Endpoint {
    pub fn calls(&self) -> &CallManager<UserId> {
        self.service.calls()
    }

    pub async fn state(&self) -> CallState {
        self.calls().state().await
    }

    /// Everything emitted since the last drain, skipping duration ticks
    pub fn drain_events(&mut self) -> Vec<CallEvent<UserId>> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(CallEvent::DurationTick { .. }) => {}
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}
