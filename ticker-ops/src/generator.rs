use std::sync::Arc;
use std::time::Duration;

use ticker_core::config::GeneratorConfig;
use ticker_core::metrics::EVENTS_GENERATED;
use ticker_core::{Event, GeneratorPosition};
use tokio::time::Instant;

use crate::time::Clock;

/// Paces callers to a fixed rate.
///
/// A token bucket holding a single token: permits are spaced exactly one
/// interval apart and idle time does not bank a burst, so after `t` seconds at
/// most `rate * t + 1` permits have been granted.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    next_permit: Option<Instant>,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Self {
        let rate = u64::from(rate.max(1));
        // round up so rounding never lets the rate be exceeded
        let nanos = (1_000_000_000 + rate - 1) / rate;
        Self {
            interval: Duration::from_nanos(nanos),
            next_permit: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits for the next permit. Cancel-safe: nothing is consumed until the wait completes.
    pub async fn acquire(&mut self) {
        if let Some(next) = self.next_permit {
            tokio::time::sleep_until(next).await;
        }
        self.grant(Instant::now());
    }

    fn grant(&mut self, now: Instant) {
        let granted = self.next_permit.map_or(now, |next| next.max(now));
        self.next_permit = Some(granted + self.interval);
    }
}

/// Infinite, restartable stream of synthetic ticker prices.
///
/// Keys rotate through the key space. The value of the event at position `n`
/// is a pure function of `(seed, n)`, so resuming from a saved position
/// replays exactly the events produced before a crash.
pub struct RateLimitedGenerator {
    key_space: Vec<String>,
    min: f64,
    max: f64,
    seed: u64,
    position: u64,
    max_events: Option<u64>,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl RateLimitedGenerator {
    pub fn new(cfg: &GeneratorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            key_space: cfg.key_space.clone(),
            min: cfg.value_range[0],
            max: cfg.value_range[1],
            seed: cfg.seed,
            position: 0,
            max_events: cfg.max_events,
            limiter: RateLimiter::per_second(cfg.rate_per_second),
            clock,
        }
    }

    pub fn resume_from(mut self, position: GeneratorPosition) -> Self {
        self.position = position.0;
        self
    }

    /// Number of events produced so far; the next event has this index.
    pub fn position(&self) -> GeneratorPosition {
        GeneratorPosition(self.position)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_events.map_or(false, |max| self.position >= max)
    }

    pub fn key_at(&self, position: u64) -> &str {
        let idx = (position % self.key_space.len() as u64) as usize;
        &self.key_space[idx]
    }

    pub fn value_at(&self, position: u64) -> f64 {
        let mut rng = fastrand::Rng::with_seed(self.seed ^ position.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        self.min + rng.f64() * (self.max - self.min)
    }

    /// Waits for a rate-limiter permit and yields the next event, or `None`
    /// once `max_events` have been produced.
    pub async fn next_event(&mut self) -> Option<Event> {
        if self.is_exhausted() {
            return None;
        }
        self.limiter.acquire().await;
        let event = Event::new(
            self.key_at(self.position).to_string(),
            self.value_at(self.position),
            self.clock.now(),
        );
        self.position += 1;
        EVENTS_GENERATED.inc();
        Some(event)
    }
}
