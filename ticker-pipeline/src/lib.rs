//! ticker-pipeline: wires generator, lanes, dispatchers and the checkpoint
//! coordinator into a running pipeline.
//!
//! Quick example:
//! ```no_run
//! use ticker_core::{PipelineConfig, SinkTargetConfig};
//! use ticker_pipeline::Pipeline;
//! # #[tokio::main]
//! # async fn main() -> ticker_core::Result<()> {
//! let cfg = PipelineConfig {
//!     sink: Some(SinkTargetConfig::file("./out")),
//!     ..Default::default()
//! };
//! let report = Pipeline::new(cfg)?
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! println!("{} results", report.results_emitted());
//! # Ok(()) }
//! ```

use std::future::Future;
use std::sync::Arc;

use ticker_core::{CheckpointId, Error, GeneratorPosition, PipelineConfig, Result, SinkTarget, WindowSnapshot};
use ticker_io::SinkDispatcher;
use ticker_ops::{Average, Clock, KeyPartitioner, RateLimitedGenerator, SystemClock, TumblingWindowAggregator};
use ticker_state::{CheckpointCoordinator, CheckpointStore, FileCheckpointStore, InMemoryStore};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub mod lane;
pub mod source;
pub mod supervisor;

pub use lane::{Lane, LaneMessage, LaneReport};
pub use source::{Source, SourceSummary};
pub use supervisor::Supervisor;

const LANE_QUEUE: usize = 1_024;

/// Builds the sink target of one lane.
pub type TargetFactory = Arc<dyn Fn(usize) -> Result<Box<dyn SinkTarget>> + Send + Sync>;

/// Outcome of one `Pipeline::run`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub restored_from: Option<CheckpointId>,
    /// Events produced during this run.
    pub events_generated: u64,
    pub dropped_events: u64,
    pub final_position: GeneratorPosition,
    pub checkpoints_completed: u64,
    pub lanes: Vec<LaneReport>,
    pub halted_lanes: Vec<usize>,
}

impl PipelineReport {
    pub fn is_healthy(&self) -> bool {
        self.halted_lanes.is_empty()
    }

    pub fn results_emitted(&self) -> u64 {
        self.lanes.iter().map(|l| l.results).sum()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    targets: TargetFactory,
}

impl Pipeline {
    /// Validates the config and wires the default store, clock and sink targets.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn CheckpointStore> = match &config.checkpoint.dir {
            Some(dir) => Arc::new(FileCheckpointStore::new(dir, config.checkpoint.retained)),
            None => Arc::new(InMemoryStore::with_retention(config.checkpoint.retained)),
        };
        let sink = config
            .sink
            .clone()
            .ok_or_else(|| Error::Configuration("no sink target configured".into()))?;
        let targets: TargetFactory = Arc::new(move |lane| ticker_io::build_target(&sink, lane));
        Ok(Self {
            config,
            store,
            clock: Arc::new(SystemClock::new()),
            targets,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_targets<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> Result<Box<dyn SinkTarget>> + Send + Sync + 'static,
    {
        self.targets = Arc::new(factory);
        self
    }

    /// Runs until `shutdown` resolves or a bounded generator is exhausted.
    ///
    /// Restores from the newest checkpoint first; a corrupt checkpoint fails
    /// the run before any event is produced. Dropping the returned future
    /// aborts every lane.
    pub async fn run<S>(self, shutdown: S) -> Result<PipelineReport>
    where
        S: Future<Output = ()> + Send,
    {
        let lanes = self.config.parallelism;
        let window_length = self.config.window.length();
        let coordinator = CheckpointCoordinator::new(self.store.clone(), lanes, self.config.checkpoint.interval());

        let restored = coordinator.restore(window_length).await?;
        let (position, last_checkpoint) = restored.as_ref().map_or((GeneratorPosition::default(), 0), |cp| (cp.position, cp.id));
        let mut per_lane = partition_windows(restored.map(|cp| cp.windows).unwrap_or_default(), lanes);

        let supervisor = Supervisor::new(lanes);
        let (snap_tx, snap_rx) = mpsc::channel(lanes.max(1) * 2);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let mut lane_txs = Vec::with_capacity(lanes);
        let mut tasks = JoinSet::new();
        for lane in 0..lanes {
            let mut aggregator = TumblingWindowAggregator::new(lane, window_length, Average);
            aggregator.restore(std::mem::take(&mut per_lane[lane]))?;
            let target = (self.targets)(lane)?;
            let dispatcher = SinkDispatcher::new(lane, target, &self.config.dispatch);
            let (tx, rx) = mpsc::channel(LANE_QUEUE);
            lane_txs.push(tx);
            let worker = Lane::new(aggregator, dispatcher, self.clock.clone());
            tasks.spawn(worker.run(rx, snap_tx.clone(), supervisor.clone()));
        }
        drop(snap_tx);

        let generator = RateLimitedGenerator::new(&self.config.generator, self.clock.clone()).resume_from(position);
        let source = Source::new(generator, lane_txs, supervisor.clone(), last_checkpoint);
        info!(
            lanes,
            position = position.0,
            restored = %restored_label(last_checkpoint),
            "pipeline started"
        );

        let lanes_done = async move {
            let summary = source.run(shutdown, trigger_rx).await;
            let mut reports = Vec::with_capacity(lanes);
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(report) => reports.push(report),
                    Err(e) => warn!(error = %e, "lane task failed"),
                }
            }
            reports.sort_by_key(|r| r.lane);
            (summary, reports)
        };
        let (coordinator_report, (summary, lane_reports)) = tokio::join!(coordinator.run(trigger_tx, snap_rx), lanes_done);

        let report = PipelineReport {
            restored_from: (last_checkpoint > 0).then_some(last_checkpoint),
            events_generated: summary.generated,
            dropped_events: summary.dropped,
            final_position: summary.position,
            checkpoints_completed: coordinator_report.completed,
            lanes: lane_reports,
            halted_lanes: supervisor.halted_lanes(),
        };
        if report.is_healthy() {
            info!(
                events = report.events_generated,
                results = report.results_emitted(),
                checkpoints = report.checkpoints_completed,
                "pipeline finished"
            );
        } else {
            warn!(
                halted = ?report.halted_lanes,
                dropped = report.dropped_events,
                "pipeline finished degraded"
            );
        }
        Ok(report)
    }
}

fn restored_label(id: CheckpointId) -> String {
    if id == 0 {
        "none".to_string()
    } else {
        id.to_string()
    }
}

/// Groups checkpointed windows by the lane that owns their key under the
/// current lane count.
fn partition_windows(windows: Vec<WindowSnapshot>, lanes: usize) -> Vec<Vec<WindowSnapshot>> {
    let partitioner = KeyPartitioner::new(lanes);
    let mut out: Vec<Vec<WindowSnapshot>> = (0..partitioner.lanes()).map(|_| Vec::new()).collect();
    for snap in windows {
        out[partitioner.lane_for_key(&snap.window.key)].push(snap);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use ticker_core::{SinkTargetConfig, WindowKey};

    fn snap(key: &str) -> WindowSnapshot {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        WindowSnapshot {
            window: WindowKey::tumbling(key, at, Duration::seconds(10)),
            state: serde_json::json!({"sum": 1.0, "count": 1}),
        }
    }

    #[test]
    fn windows_follow_their_key_lane() {
        let keys = ["AAPL", "AMZN", "MSFT", "INTC", "TBV"];
        let grouped = partition_windows(keys.iter().map(|k| snap(k)).collect(), 3);
        assert_eq!(grouped.len(), 3);
        let p = KeyPartitioner::new(3);
        for (lane, snaps) in grouped.iter().enumerate() {
            assert!(snaps.iter().all(|s| p.lane_for_key(&s.window.key) == lane));
        }
        assert_eq!(grouped.iter().map(Vec::len).sum::<usize>(), keys.len());
    }

    #[test]
    fn new_rejects_invalid_config() {
        let cfg = PipelineConfig {
            parallelism: 0,
            sink: Some(SinkTargetConfig::file("/tmp/ticker")),
            ..Default::default()
        };
        assert!(matches!(Pipeline::new(cfg), Err(Error::Configuration(_))));
        assert!(matches!(
            Pipeline::new(PipelineConfig::default()),
            Err(Error::Configuration(_))
        ));
    }
}
