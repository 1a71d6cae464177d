use std::future::Future;

use ticker_core::metrics::DROPPED_EVENTS;
use ticker_core::{CheckpointId, Event, GeneratorPosition};
use ticker_ops::{KeyPartitioner, RateLimitedGenerator};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::lane::LaneMessage;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub generated: u64,
    pub dropped: u64,
    pub position: GeneratorPosition,
}

enum Step {
    Stop,
    Checkpoint,
    TriggersClosed,
    Event(Event),
    Exhausted,
}

/// The single producer: paces the generator, routes events to lanes and
/// injects checkpoint barriers between them.
pub struct Source {
    generator: RateLimitedGenerator,
    partitioner: KeyPartitioner,
    lanes: Vec<mpsc::Sender<LaneMessage>>,
    supervisor: Supervisor,
    last_checkpoint: CheckpointId,
    summary: SourceSummary,
}

impl Source {
    pub fn new(
        generator: RateLimitedGenerator,
        lanes: Vec<mpsc::Sender<LaneMessage>>,
        supervisor: Supervisor,
        last_checkpoint: CheckpointId,
    ) -> Self {
        let partitioner = KeyPartitioner::new(lanes.len());
        Self {
            generator,
            partitioner,
            lanes,
            supervisor,
            last_checkpoint,
            summary: SourceSummary::default(),
        }
    }

    /// Runs until `shutdown` resolves or the generator is exhausted, then
    /// takes a final checkpoint and tells every lane to drain.
    pub async fn run<S>(mut self, shutdown: S, mut triggers: mpsc::Receiver<()>) -> SourceSummary
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut triggers_open = true;
        loop {
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => Step::Stop,
                t = triggers.recv(), if triggers_open => match t {
                    Some(()) => Step::Checkpoint,
                    None => Step::TriggersClosed,
                },
                ev = self.generator.next_event() => match ev {
                    Some(ev) => Step::Event(ev),
                    None => Step::Exhausted,
                },
            };
            match step {
                Step::Stop => {
                    info!(position = self.generator.position().0, "shutdown requested");
                    break;
                }
                Step::Exhausted => {
                    info!(position = self.generator.position().0, "generator exhausted");
                    break;
                }
                Step::Checkpoint => self.inject_barrier().await,
                Step::TriggersClosed => triggers_open = false,
                Step::Event(ev) => self.route(ev).await,
            }
        }

        self.inject_barrier().await;
        for tx in &self.lanes {
            let _ = tx.send(LaneMessage::Drain).await;
        }
        self.summary.position = self.generator.position();
        self.summary
    }

    async fn route(&mut self, event: Event) {
        self.summary.generated += 1;
        let lane = self.partitioner.lane(&event);
        if self.supervisor.is_halted(lane) {
            self.drop_event();
            return;
        }
        if self.lanes[lane].send(LaneMessage::Event(event)).await.is_err() {
            // the lane exited between the check and the send
            self.drop_event();
        }
    }

    fn drop_event(&mut self) {
        self.summary.dropped += 1;
        DROPPED_EVENTS.with_label_values(&["lane_halted"]).inc();
    }

    /// Every lane sees the barrier after the same prefix of the event stream.
    async fn inject_barrier(&mut self) {
        if self.supervisor.any_halted() {
            warn!("checkpoint skipped, a lane is halted");
            return;
        }
        self.last_checkpoint += 1;
        let id = self.last_checkpoint;
        let position = self.generator.position();
        debug!(checkpoint = id, position = position.0, "injecting barrier");
        for tx in &self.lanes {
            let _ = tx.send(LaneMessage::Barrier { id, position }).await;
        }
    }
}
