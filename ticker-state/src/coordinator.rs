//! Periodic checkpointing.
//!
//! The coordinator never touches lane state directly. On every interval tick
//! it asks the source to inject a barrier into each lane's queue; lanes answer
//! with a `LaneSnapshot` once every event ahead of the barrier is applied. When
//! all lanes have answered for the same barrier the snapshots form a consistent
//! cut and are persisted as one `Checkpoint`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as WindowLength;
use ticker_core::metrics::{CHECKPOINTS_COMPLETED, CHECKPOINT_DURATION_MS};
use ticker_core::{Checkpoint, CheckpointId, LaneSnapshot, Result};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::CheckpointStore;

struct Pending {
    first_seen: Instant,
    snapshots: Vec<LaneSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorReport {
    pub completed: u64,
    pub failed: u64,
    pub last_completed: Option<CheckpointId>,
}

pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    lanes: usize,
    interval: Duration,
    pending: BTreeMap<CheckpointId, Pending>,
    report: CoordinatorReport,
}

impl CheckpointCoordinator {
    pub fn new(store: Arc<dyn CheckpointStore>, lanes: usize, interval: Duration) -> Self {
        Self {
            store,
            lanes,
            interval,
            pending: BTreeMap::new(),
            report: CoordinatorReport::default(),
        }
    }

    /// Loads and validates the newest checkpoint.
    ///
    /// Structural inconsistencies surface as `Error::StateCorruption`.
    pub async fn restore(&self, window_length: WindowLength) -> Result<Option<Checkpoint>> {
        let Some(cp) = self.store.latest().await? else {
            info!("no checkpoint found, starting fresh");
            return Ok(None);
        };
        cp.validate(window_length)?;
        info!(
            checkpoint = cp.id,
            position = cp.position.0,
            windows = cp.windows.len(),
            "restoring from checkpoint"
        );
        Ok(Some(cp))
    }

    /// Records one lane's answer to a barrier; returns the checkpoint once
    /// every lane has answered.
    pub fn on_lane_snapshot(&mut self, snapshot: LaneSnapshot) -> Option<Checkpoint> {
        let id = snapshot.checkpoint_id;
        if self.report.last_completed.map_or(false, |last| id <= last) {
            warn!(checkpoint = id, lane = snapshot.lane, "snapshot for a superseded checkpoint ignored");
            return None;
        }
        let pending = self.pending.entry(id).or_insert_with(|| Pending {
            first_seen: Instant::now(),
            snapshots: Vec::with_capacity(self.lanes),
        });
        if pending.snapshots.iter().any(|s| s.lane == snapshot.lane) {
            warn!(checkpoint = id, lane = snapshot.lane, "duplicate lane snapshot ignored");
            return None;
        }
        pending.snapshots.push(snapshot);
        if pending.snapshots.len() < self.lanes {
            return None;
        }

        let pending = self.pending.remove(&id)?;
        // older barriers can no longer complete consistently
        self.pending.retain(|other, _| *other > id);
        let position = pending.snapshots[0].position;
        if pending.snapshots.iter().any(|s| s.position != position) {
            error!(checkpoint = id, "lanes disagree on barrier position, checkpoint discarded");
            self.report.failed += 1;
            return None;
        }
        CHECKPOINT_DURATION_MS.observe(pending.first_seen.elapsed().as_secs_f64() * 1_000.0);
        let mut snapshots = pending.snapshots;
        snapshots.sort_by_key(|s| s.lane);
        Some(Checkpoint::from_lanes(id, position, snapshots))
    }

    /// Writes a completed checkpoint. The coordinator is the store's only
    /// writer and persists one checkpoint at a time.
    pub async fn persist(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let id = checkpoint.id;
        match self.store.save(&checkpoint).await {
            Ok(()) => {
                self.report.completed += 1;
                self.report.last_completed = Some(id);
                CHECKPOINTS_COMPLETED.inc();
                info!(
                    checkpoint = id,
                    position = checkpoint.position.0,
                    windows = checkpoint.windows.len(),
                    "checkpoint completed"
                );
                Ok(())
            }
            Err(e) => {
                self.report.failed += 1;
                Err(e)
            }
        }
    }

    /// Drives the interval timer and collects lane snapshots until every lane
    /// has hung up.
    pub async fn run(
        mut self,
        triggers: mpsc::Sender<()>,
        mut snapshots: mpsc::Receiver<LaneSnapshot>,
    ) -> CoordinatorReport {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                snap = snapshots.recv() => {
                    let Some(snap) = snap else { break };
                    if let Some(cp) = self.on_lane_snapshot(snap) {
                        if let Err(e) = self.persist(cp).await {
                            error!(error = %e, "failed to persist checkpoint");
                        }
                    }
                }
                _ = ticker.tick() => {
                    if triggers.try_send(()).is_err() {
                        debug!("checkpoint trigger skipped, previous one still pending or source stopped");
                    }
                }
            }
        }
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "incomplete checkpoints discarded at shutdown");
        }
        self.report
    }
}
