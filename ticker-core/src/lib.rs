//! ticker-core: data model, errors and the seams between pipeline stages.
//!
//! - `Event`, `WindowKey`, `AggregateResult`, `OutputRecord`
//! - Traits: `WindowEmitter` (aggregator -> dispatcher), `SinkTarget` (dispatcher -> storage)
//! - `config`: typed pipeline configuration, TOML or host property groups
//! - `checkpoint`: the persisted recovery model
//! - `metrics`: prometheus registry shared by every crate
//!
//! Quick example:
//! ```no_run
//! use ticker_core::{AggregateResult, Result, WindowEmitter, WindowKey};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! struct PrintEmitter;
//! #[async_trait::async_trait]
//! impl WindowEmitter for PrintEmitter {
//!     async fn on_window_close(&mut self, _w: &WindowKey, r: AggregateResult) -> Result<()> {
//!         println!("{} {}", r.key, r.average);
//!         Ok(())
//!     }
//! }
//! # Ok(()) }
//! ```

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod record;

pub use checkpoint::{Checkpoint, CheckpointId, GeneratorPosition, LaneSnapshot, WindowSnapshot};
pub use config::{ApplicationProperties, PipelineConfig, SinkTargetConfig};
pub use record::{AggregateResult, Event, OutputRecord, WindowKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid setting; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A delivery hiccup worth retrying.
    #[error("transient sink error: {0}")]
    TransientSink(String),
    /// The retry budget for a batch is exhausted.
    #[error("sink {sink} failed after {attempts} attempts: {last}")]
    SustainedSink {
        sink: String,
        attempts: usize,
        last: String,
    },
    /// Restored state is inconsistent; the pipeline must not start on it.
    #[error("accumulator state corruption: {0}")]
    StateCorruption(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether a failed delivery may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientSink(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives one finalized result per closed window.
#[async_trait::async_trait]
pub trait WindowEmitter: Send {
    async fn on_window_close(&mut self, window: &WindowKey, result: AggregateResult) -> Result<()>;
}

/// Collecting emitter, handy for tests and in-process consumers.
#[async_trait::async_trait]
impl WindowEmitter for Vec<AggregateResult> {
    async fn on_window_close(&mut self, _window: &WindowKey, result: AggregateResult) -> Result<()> {
        self.push(result);
        Ok(())
    }
}

/// Destination of serialized result batches.
///
/// A failed `write` may have persisted part of the batch; callers retry the
/// whole batch, so targets must tolerate duplicates.
#[async_trait::async_trait]
pub trait SinkTarget: Send {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;
    async fn write(&mut self, batch: &[Vec<u8>]) -> Result<()>;
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: SinkTarget + ?Sized> SinkTarget for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    async fn write(&mut self, batch: &[Vec<u8>]) -> Result<()> {
        (**self).write(batch).await
    }
    async fn flush(&mut self) -> Result<()> {
        (**self).flush().await
    }
}
