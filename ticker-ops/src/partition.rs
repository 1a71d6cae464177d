use ticker_core::Event;

/// Routes every event of a key to the same lane.
///
/// seahash is stable across processes and platforms, so a restarted pipeline
/// with the same lane count routes keys exactly as before.
#[derive(Debug, Clone, Copy)]
pub struct KeyPartitioner {
    lanes: usize,
}

impl KeyPartitioner {
    pub fn new(lanes: usize) -> Self {
        Self { lanes: lanes.max(1) }
    }

    pub fn lanes(&self) -> usize {
        self.lanes
    }

    pub fn lane_for_key(&self, key: &str) -> usize {
        (seahash::hash(key.as_bytes()) % self.lanes as u64) as usize
    }

    pub fn lane(&self, event: &Event) -> usize {
        self.lane_for_key(&event.key)
    }
}
