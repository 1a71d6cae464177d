//! ticker-ops: the operators between the generator and the sinks.
//!
//! - `RateLimitedGenerator`: paced, deterministic source of ticker prices
//! - `KeyPartitioner`: stable key -> lane routing
//! - `TumblingWindowAggregator`: per-lane processing-time windows
//! - `AggregateFunction` / `Average`: the mergeable accumulator contract

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod generator;
pub mod partition;
pub mod time;
pub mod window;

pub use generator::{RateLimitedGenerator, RateLimiter};
pub use partition::KeyPartitioner;
pub use time::{Clock, ManualClock, SystemClock};
pub use window::TumblingWindowAggregator;

/// Incremental aggregation over one window.
///
/// `merge` must be associative and commutative with `create()` as identity;
/// restore relies on it when two snapshots land on the same window.
pub trait AggregateFunction: Send + Sync + 'static {
    type Acc: Clone + Send + Serialize + DeserializeOwned + 'static;

    fn create(&self) -> Self::Acc;
    fn add(&self, acc: &mut Self::Acc, value: f64);
    fn merge(&self, a: Self::Acc, b: Self::Acc) -> Self::Acc;
    /// `None` when the window saw nothing and must not be emitted.
    fn finalize(&self, acc: &Self::Acc) -> Option<f64>;
    /// Rejects accumulator states that `add`/`merge` could never produce.
    fn check(&self, _acc: &Self::Acc) -> Result<(), String> {
        Ok(())
    }
}

/// Running sum and count of a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub sum: f64,
    pub count: i64,
}

impl Accumulator {
    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            sum: self.sum + other.sum,
            count: self.count + other.count,
        }
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Arithmetic mean of the window's values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Average;

impl AggregateFunction for Average {
    type Acc = Accumulator;

    fn create(&self) -> Accumulator {
        Accumulator::default()
    }

    fn add(&self, acc: &mut Accumulator, value: f64) {
        acc.add(value);
    }

    fn merge(&self, a: Accumulator, b: Accumulator) -> Accumulator {
        a.merge(b)
    }

    fn finalize(&self, acc: &Accumulator) -> Option<f64> {
        acc.average()
    }

    fn check(&self, acc: &Accumulator) -> Result<(), String> {
        if acc.count < 0 {
            return Err(format!("negative count {}", acc.count));
        }
        if !acc.sum.is_finite() {
            return Err(format!("non-finite sum {}", acc.sum));
        }
        if acc.count == 0 && acc.sum != 0.0 {
            return Err(format!("sum {} with zero count", acc.sum));
        }
        Ok(())
    }
}
