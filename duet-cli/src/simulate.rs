//! Scripted call scenarios between in-process endpoints
//!
//! Everything runs over a `MemoryRelay` with simulated devices, so the
//! scenarios need no relay server, camera or network.

use crate::report::describe_event;
use anyhow::Result;
use clap::ValueEnum;
use duet_core::media::{DeviceAccess, SimulatedMediaConfig};
use duet_core::tone::SilentToneSink;
use duet_core::{
    CallHistoryRecord, CallManagerConfig, CallService, HistoryStore, MediaType, MemoryHistoryStore,
    MemoryRelay, SimulatedMediaManager, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const PAUSE: Duration = Duration::from_millis(500);

/// Scripted scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Bob answers, they talk, Alice hangs up
    Answered,
    /// Nobody answers before the ring timeout
    Unanswered,
    /// Bob declines
    Rejected,
    /// Carol calls Bob while he talks to Alice
    Busy,
    /// Bob's camera permission is denied when he answers
    Denied,
    /// Alice calls someone who is not connected
    Offline,
    /// The peer connection drops mid-call
    Dropped,
}

struct Party {
    user: UserId,
    service: CallService<UserId>,
    media: Arc<SimulatedMediaManager>,
    printer: JoinHandle<()>,
}

impl Drop for Party {
    fn drop(&mut self) {
        self.printer.abort();
    }
}

/// Shared relay and history for one run
pub struct Simulation {
    relay: MemoryRelay<UserId>,
    store: Arc<MemoryHistoryStore>,
    config: CallManagerConfig,
}

impl Simulation {
    pub fn new(config: CallManagerConfig) -> Self {
        Self {
            relay: MemoryRelay::new(),
            store: Arc::new(MemoryHistoryStore::new()),
            config,
        }
    }

    fn party(&self, name: &str, media_config: SimulatedMediaConfig) -> Result<Party> {
        let user = UserId::new(name);
        let media = Arc::new(SimulatedMediaManager::new(media_config));
        let service = CallService::builder(
            user.clone(),
            Arc::new(self.relay.connect(user.clone())),
            media.clone(),
        )
        .with_config(self.config.clone())
        .with_history_store(self.store.clone())
        .with_presence(Arc::new(self.relay.clone()))
        .with_tone_sink(Arc::new(SilentToneSink))
        .build()?;
        service.start()?;

        let mut events = service.subscribe_events();
        let label = name.to_string();
        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Some(line) = describe_event(&event) {
                    println!("[{label:>5}] {line}");
                }
            }
        });

        Ok(Party {
            user,
            service,
            media,
            printer,
        })
    }

    /// Run `scenario` and return every history record written
    pub async fn run(
        &self,
        scenario: Scenario,
        media_type: MediaType,
        talk_time: Duration,
    ) -> Result<Vec<CallHistoryRecord>> {
        let bob_media = match scenario {
            Scenario::Denied => SimulatedMediaConfig {
                camera: DeviceAccess::Denied,
                ..SimulatedMediaConfig::default()
            },
            _ => SimulatedMediaConfig::default(),
        };
        let alice = self.party("alice", SimulatedMediaConfig::default())?;
        let bob = self.party("bob", bob_media)?;
        let ring_out = self.config.ring_timeout + PAUSE;

        tracing::info!(?scenario, %media_type, "Running scenario");
        match scenario {
            Scenario::Answered => {
                alice.service.calls().initiate(bob.user.clone(), media_type).await?;
                tokio::time::sleep(PAUSE).await;
                bob.service.calls().accept().await?;
                tokio::time::sleep(talk_time).await;
                alice.service.calls().end().await?;
            }
            Scenario::Unanswered => {
                alice.service.calls().initiate(bob.user.clone(), media_type).await?;
                tokio::time::sleep(ring_out).await;
            }
            Scenario::Rejected => {
                alice.service.calls().initiate(bob.user.clone(), media_type).await?;
                tokio::time::sleep(PAUSE).await;
                bob.service.calls().reject().await?;
            }
            Scenario::Busy => {
                let carol = self.party("carol", SimulatedMediaConfig::default())?;
                alice.service.calls().initiate(bob.user.clone(), media_type).await?;
                tokio::time::sleep(PAUSE).await;
                bob.service.calls().accept().await?;
                tokio::time::sleep(PAUSE).await;
                carol.service.calls().initiate(bob.user.clone(), media_type).await?;
                tokio::time::sleep(talk_time).await;
                alice.service.calls().end().await?;
                tokio::time::sleep(PAUSE).await;
            }
            Scenario::Denied => {
                alice.service.calls().initiate(bob.user.clone(), MediaType::Video).await?;
                tokio::time::sleep(PAUSE).await;
                if let Err(e) = bob.service.calls().accept().await {
                    println!("[  bob] ❌ Could not accept: {e}");
                }
                tokio::time::sleep(ring_out).await;
            }
            Scenario::Offline => {
                alice.service.calls().initiate(UserId::new("dave"), media_type).await?;
                tokio::time::sleep(ring_out).await;
            }
            Scenario::Dropped => {
                let call_id = alice.service.calls().initiate(bob.user.clone(), media_type).await?;
                tokio::time::sleep(PAUSE).await;
                bob.service.calls().accept().await?;
                tokio::time::sleep(talk_time).await;
                alice.media.fail_call(call_id, "ICE connection failed");
            }
        }
        tokio::time::sleep(PAUSE).await;

        alice.service.shutdown().await;
        bob.service.shutdown().await;
        tracing::debug!(
            alice_live = alice.media.live_track_count(),
            bob_live = bob.media.live_track_count(),
            "Scenario finished"
        );
        Ok(self.store.all())
    }

    /// Records owned by `owner`, newest first
    pub async fn records_for(&self, owner: &str) -> Result<Vec<CallHistoryRecord>> {
        Ok(self.store.list_by_owner(owner).await?)
    }
}
