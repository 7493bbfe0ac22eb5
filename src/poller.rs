//! Snapshot Poller - application-side reader of the registry
//!
//! Reads the registry on a fixed cadence (50 ms by default), independent of
//! the driver's 100 Hz sampling, and publishes each snapshot on a watch
//! channel. Consumers always see the latest snapshot and may skip older ones.
//!
//! ```text
//! Registry ─[snapshot() every interval]→ SnapshotPoller ─[watch]→ consumers
//! ```
//!
//! The poller stops when its handle is shut down or dropped. The handle keeps
//! a receiver of its own, so publishing never fails while it is alive.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use statum::{machine, state};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controller::{ControllerIdentity, ControllerState, RegistryReader};

// One published view of the registry
#[derive(Clone, Debug, PartialEq)]
pub struct PolledSnapshot {
    pub sequence: u64,
    pub controllers: Vec<(ControllerIdentity, ControllerState)>,
    pub timestamp: DateTime<Local>,
}

impl Default for PolledSnapshot {
    fn default() -> Self {
        Self {
            sequence: 0,
            controllers: Vec::new(),
            timestamp: Local::now(),
        }
    }
}

impl PolledSnapshot {
    pub fn get(&self, id: ControllerIdentity) -> Option<&ControllerState> {
        self.controllers
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, state)| state)
    }
}

// Registry contents read during one cycle
#[derive(Debug, Clone)]
pub struct SnapshotBatch {
    pub controllers: Vec<(ControllerIdentity, ControllerState)>,
    pub taken_at: DateTime<Local>,
}

// Poller settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub poll_interval_ms: u64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
        }
    }
}

// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("Failed to initialize poller: {0}")]
    InitializationError(String),

    #[error("Failed to publish snapshot: {0}")]
    PublishError(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum PollState {
    Waiting,
    Sampling(SnapshotBatch),
}

#[machine]
#[derive(Debug)]
pub struct SnapshotPoller<S: PollState> {
    // Read half of the registry
    registry: RegistryReader,

    settings: PollerSettings,

    // Watch channel sender
    snapshot_sender: watch::Sender<PolledSnapshot>,

    // Sequence number of the last published snapshot
    sequence: u64,

    // Identities seen in the last published snapshot
    last_connected: Vec<ControllerIdentity>,
}

impl<S: PollState> SnapshotPoller<S> {
    pub fn subscribe(&self) -> watch::Receiver<PolledSnapshot> {
        self.snapshot_sender.subscribe()
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }
}

impl SnapshotPoller<Waiting> {
    pub fn create(
        registry: RegistryReader,
        settings: Option<PollerSettings>,
    ) -> Result<Self, PollerError> {
        let settings = settings.unwrap_or_default();
        if settings.poll_interval_ms == 0 {
            return Err(PollerError::InitializationError(
                "poll interval must be at least 1 ms".to_string(),
            ));
        }
        info!("Creating Snapshot Poller with settings: {:?}", settings);

        let (snapshot_sender, _) = watch::channel(PolledSnapshot::default());
        debug!("Created watch channel for registry snapshots");

        Ok(Self::new(registry, settings, snapshot_sender, 0, Vec::new()))
    }

    // Read the registry and transition to Sampling
    pub fn sample(self) -> SnapshotPoller<Sampling> {
        let controllers = self.registry.snapshot();
        debug!("Sampled {} connected controllers", controllers.len());

        let batch = SnapshotBatch {
            controllers,
            taken_at: Local::now(),
        };
        self.transition_with(batch)
    }
}

impl SnapshotPoller<Sampling> {
    // Publish the sampled batch and go back to Waiting
    pub fn publish(mut self) -> Result<SnapshotPoller<Waiting>, PollerError> {
        let batch = match self.get_state_data() {
            Some(batch) => batch.clone(),
            None => {
                error!("No snapshot batch in state data, this should not happen");
                return Err(PollerError::PublishError("missing batch".to_string()));
            }
        };

        let connected: Vec<ControllerIdentity> =
            batch.controllers.iter().map(|(id, _)| *id).collect();
        if connected != self.last_connected {
            info!(
                "Connected controllers changed: {:?} -> {:?}",
                self.last_connected, connected
            );
            self.last_connected = connected;
        }

        self.sequence += 1;
        let snapshot = PolledSnapshot {
            sequence: self.sequence,
            controllers: batch.controllers,
            timestamp: batch.taken_at,
        };

        self.snapshot_sender
            .send(snapshot)
            .map_err(|e| PollerError::PublishError(e.to_string()))?;

        Ok(self.transition())
    }
}

/// Handle to a running poller task.
pub struct PollerHandle {
    snapshot_receiver: watch::Receiver<PolledSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Spawns the poller on the current tokio runtime.
    pub fn spawn(
        registry: RegistryReader,
        settings: Option<PollerSettings>,
    ) -> Result<Self, PollerError> {
        info!("Spawning Snapshot Poller with settings: {:?}", settings);

        let poller = SnapshotPoller::create(registry, settings)?;
        let snapshot_receiver = poller.subscribe();
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                info!("Snapshot Poller task started");
                match run_poller_loop(poller, cancel).await {
                    Ok(()) => info!("Snapshot Poller task finished"),
                    Err(e) => error!("Poller task terminated with error: {}", e),
                }
            })
        };

        Ok(Self {
            snapshot_receiver,
            cancel,
            task: Some(task),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<PolledSnapshot> {
        self.snapshot_receiver.clone()
    }

    /// Stops the poller and waits for its task to end.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Poller task failed: {}", e);
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_poller_loop(
    mut poller: SnapshotPoller<Waiting>,
    cancel: CancellationToken,
) -> Result<(), PollerError> {
    let interval_ms = poller.settings().poll_interval_ms;
    info!("Starting poller loop with {}ms interval", interval_ms);

    let mut interval_timer =
        tokio::time::interval(tokio::time::Duration::from_millis(interval_ms));
    interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    // Stats for performance monitoring
    let mut cycles: u64 = 0;
    let mut last_stats_time = Local::now();
    let stats_interval = chrono::Duration::seconds(30);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Poller cancelled after {} cycles", cycles);
                return Ok(());
            }
            _ = interval_timer.tick() => {}
        }

        poller = match poller.sample().publish() {
            Ok(poller) => poller,
            Err(e) => return Err(e),
        };
        cycles += 1;

        let now = Local::now();
        if now - last_stats_time > stats_interval {
            let elapsed_seconds = (now - last_stats_time).num_seconds().max(1);
            info!(
                "Poller stats: {} cycles in {} seconds ({:.2} cycles/sec)",
                cycles,
                elapsed_seconds,
                cycles as f64 / elapsed_seconds as f64
            );
            cycles = 0;
            last_stats_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Registry;
    use std::sync::Arc;

    #[test]
    fn zero_interval_is_rejected() {
        let reader = RegistryReader::new(Arc::new(Registry::new()));
        let result = SnapshotPoller::create(
            reader,
            Some(PollerSettings {
                poll_interval_ms: 0,
            }),
        );
        assert!(matches!(result, Err(PollerError::InitializationError(_))));
    }

    #[test]
    fn one_cycle_publishes_registry_contents() {
        let registry = Arc::new(Registry::new());
        let id = ControllerIdentity::new(1, 0);
        registry.register(id).unwrap();

        let poller = SnapshotPoller::create(RegistryReader::new(Arc::clone(&registry)), None)
            .unwrap();
        let receiver = poller.subscribe();
        let poller = poller.sample().publish().unwrap();

        let snapshot = receiver.borrow().clone();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.get(id), Some(&ControllerState::default()));

        registry.unregister(id);
        poller.sample().publish().unwrap();
        let snapshot = receiver.borrow().clone();
        assert_eq!(snapshot.sequence, 2);
        assert!(snapshot.controllers.is_empty());
    }

    #[test]
    fn publish_without_subscribers_fails() {
        let poller =
            SnapshotPoller::create(RegistryReader::new(Arc::new(Registry::new())), None).unwrap();
        assert!(matches!(
            poller.sample().publish(),
            Err(PollerError::PublishError(_))
        ));
    }

    #[tokio::test]
    async fn spawned_poller_tracks_registry() {
        let registry = Arc::new(Registry::new());
        let handle = PollerHandle::spawn(
            RegistryReader::new(Arc::clone(&registry)),
            Some(PollerSettings {
                poll_interval_ms: 5,
            }),
        )
        .unwrap();
        let mut receiver = handle.subscribe();

        let id = ControllerIdentity::new(2, 1);
        registry.register(id).unwrap();

        let snapshot = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            receiver.wait_for(|snapshot| snapshot.get(id).is_some()),
        )
        .await
        .expect("poller did not publish in time")
        .unwrap()
        .clone();
        assert!(snapshot.sequence >= 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn poller_outlives_dropped_subscribers() {
        let registry = Arc::new(Registry::new());
        let handle = PollerHandle::spawn(
            RegistryReader::new(Arc::clone(&registry)),
            Some(PollerSettings {
                poll_interval_ms: 5,
            }),
        )
        .unwrap();
        drop(handle.subscribe());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let mut receiver = handle.subscribe();
        let seen = receiver.borrow_and_update().sequence;

        let next = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            receiver.wait_for(|snapshot| snapshot.sequence > seen),
        )
        .await
        .expect("poller stopped publishing")
        .unwrap()
        .sequence;
        assert!(next > seen);

        handle.shutdown().await;
    }
}
