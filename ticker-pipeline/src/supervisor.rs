use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ticker_core::metrics::PIPELINE_HEALTHY;
use ticker_core::Error;
use tracing::error;

/// Shared view of which lanes have been halted.
///
/// A lane halts itself when its sink fails for good; the source consults the
/// flags to stop routing events to it.
#[derive(Clone)]
pub struct Supervisor {
    halted: Arc<Vec<AtomicBool>>,
}

impl Supervisor {
    pub fn new(lanes: usize) -> Self {
        PIPELINE_HEALTHY.set(1);
        Self {
            halted: Arc::new((0..lanes).map(|_| AtomicBool::new(false)).collect()),
        }
    }

    pub fn halt(&self, lane: usize, cause: &Error) {
        if let Some(flag) = self.halted.get(lane) {
            if !flag.swap(true, Ordering::SeqCst) {
                error!(lane, error = %cause, "lane halted, ingestion for its keys stopped");
            }
        }
        PIPELINE_HEALTHY.set(0);
    }

    pub fn is_halted(&self, lane: usize) -> bool {
        self.halted.get(lane).map_or(false, |f| f.load(Ordering::SeqCst))
    }

    pub fn any_halted(&self) -> bool {
        self.halted.iter().any(|f| f.load(Ordering::SeqCst))
    }

    pub fn halted_lanes(&self) -> Vec<usize> {
        (0..self.halted.len()).filter(|l| self.is_halted(*l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halting_marks_only_that_lane() {
        let s = Supervisor::new(3);
        assert!(!s.any_halted());
        s.halt(1, &Error::TransientSink("down".into()));
        s.halt(1, &Error::TransientSink("still down".into()));
        assert!(s.is_halted(1));
        assert!(!s.is_halted(0));
        assert_eq!(s.halted_lanes(), vec![1]);
    }
}
