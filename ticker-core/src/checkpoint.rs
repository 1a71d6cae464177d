use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, WindowKey};

/// Monotonically increasing identifier of a checkpoint (barrier epoch).
pub type CheckpointId = u64;

/// Opaque resume position of the generator: the number of events produced so far.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct GeneratorPosition(pub u64);

/// Serialized state of one open accumulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowSnapshot {
    pub window: WindowKey,
    pub state: serde_json::Value,
}

/// Open windows owned by one lane at a barrier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaneSnapshot {
    pub checkpoint_id: CheckpointId,
    pub lane: usize,
    pub position: GeneratorPosition,
    pub windows: Vec<WindowSnapshot>,
}

/// A complete, consistent cut of the pipeline: every lane's open windows as of
/// the moment the generator stood at `position`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    pub position: GeneratorPosition,
    /// Lane count at snapshot time. Restores re-partition, so it may differ.
    pub lanes: usize,
    pub windows: Vec<WindowSnapshot>,
}

impl Checkpoint {
    pub fn from_lanes(
        id: CheckpointId,
        position: GeneratorPosition,
        lanes: Vec<LaneSnapshot>,
    ) -> Self {
        let lane_count = lanes.len();
        let mut windows: Vec<WindowSnapshot> =
            lanes.into_iter().flat_map(|l| l.windows).collect();
        windows.sort_by(|a, b| a.window.cmp(&b.window));
        Self {
            id,
            created_at: Utc::now(),
            position,
            lanes: lane_count,
            windows,
        }
    }

    /// Structural checks that do not depend on the accumulator type.
    ///
    /// Rejects windows of the wrong length, windows not floor-aligned to the
    /// configured length, and duplicate `(key, start)` entries.
    pub fn validate(&self, window_length: Duration) -> Result<()> {
        let size_ms = window_length.num_milliseconds();
        let mut prev: Option<&WindowKey> = None;
        for snap in &self.windows {
            let w = &snap.window;
            if w.length() != window_length {
                return Err(Error::StateCorruption(format!(
                    "checkpoint {}: window {}@{} has length {}ms, expected {}ms",
                    self.id,
                    w.key,
                    w.start,
                    w.length().num_milliseconds(),
                    size_ms
                )));
            }
            if size_ms > 0 && w.start.timestamp_millis().rem_euclid(size_ms) != 0 {
                return Err(Error::StateCorruption(format!(
                    "checkpoint {}: window {}@{} is not aligned to {}ms",
                    self.id, w.key, w.start, size_ms
                )));
            }
            if prev.map_or(false, |p| p.key == w.key && p.start == w.start) {
                return Err(Error::StateCorruption(format!(
                    "checkpoint {}: duplicate window {}@{}",
                    self.id, w.key, w.start
                )));
            }
            prev = Some(w);
        }
        Ok(())
    }
}
