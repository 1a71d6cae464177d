use std::time::Duration;

use async_trait::async_trait;
use ticker_core::config::DispatchConfig;
use ticker_core::metrics::{SINK_BATCH_LATENCY_MS, SINK_FAILURES, SINK_RETRIES};
use ticker_core::{AggregateResult, Error, OutputRecord, Result, SinkTarget, WindowEmitter, WindowKey};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Exponential backoff between delivery attempts of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: usize, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: 2.0,
        }
    }

    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self::exponential(
            cfg.max_attempts,
            Duration::from_millis(cfg.initial_backoff_ms),
            Duration::from_millis(cfg.max_backoff_ms),
        )
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }

    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// Serializes finalized results and delivers them in batches, at least once.
///
/// Results are delivered in the order the lane emitted them. A batch is sent
/// when it is full or when `flush_if_due` finds it older than the flush
/// interval. Transient failures are retried with backoff; once the budget is
/// spent the batch stays buffered and `Error::SustainedSink` is returned.
pub struct SinkDispatcher<T: SinkTarget> {
    lane: usize,
    target: T,
    policy: RetryPolicy,
    batch_size: usize,
    flush_interval: Duration,
    buffer: Vec<Vec<u8>>,
    last_flush: Instant,
    delivered: u64,
}

impl<T: SinkTarget> SinkDispatcher<T> {
    pub fn new(lane: usize, target: T, cfg: &DispatchConfig) -> Self {
        Self {
            lane,
            target,
            policy: RetryPolicy::from_config(cfg),
            batch_size: cfg.batch_size.max(1),
            flush_interval: Duration::from_millis(cfg.flush_interval_ms),
            buffer: Vec::new(),
            last_flush: Instant::now(),
            delivered: 0,
        }
    }

    /// Results buffered but not yet delivered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Results acknowledged by the target.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub async fn dispatch(&mut self, result: &AggregateResult) -> Result<()> {
        let line = serde_json::to_vec(&OutputRecord::from(result))?;
        self.buffer.push(line);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush_if_due(&mut self) -> Result<()> {
        if !self.buffer.is_empty() && self.last_flush.elapsed() >= self.flush_interval {
            self.flush().await?;
        }
        Ok(())
    }

    /// Delivers everything buffered, retrying transient failures.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(());
        }
        let sink = self.target.name();
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.target.write(&self.buffer).await {
                Ok(()) => self.target.flush().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    SINK_BATCH_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    self.delivered += self.buffer.len() as u64;
                    debug!(lane = self.lane, sink, records = self.buffer.len(), attempt, "batch delivered");
                    self.buffer.clear();
                    self.last_flush = Instant::now();
                    return Ok(());
                }
                Err(e) if e.is_transient() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    SINK_RETRIES.with_label_values(&[sink]).inc();
                    warn!(lane = self.lane, sink, attempt, ?delay, error = %e, "sink write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    SINK_FAILURES.with_label_values(&[sink]).inc();
                    error!(lane = self.lane, sink, attempt, error = %e, "sink delivery failed");
                    return Err(if e.is_transient() {
                        Error::SustainedSink {
                            sink: sink.to_string(),
                            attempts: attempt,
                            last: e.to_string(),
                        }
                    } else {
                        e
                    });
                }
            }
        }
    }
}

#[async_trait]
impl<T: SinkTarget> WindowEmitter for SinkDispatcher<T> {
    async fn on_window_close(&mut self, _window: &WindowKey, result: AggregateResult) -> Result<()> {
        self.dispatch(&result).await
    }
}
