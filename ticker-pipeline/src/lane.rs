//! One lane: a single task owning the accumulators of its key partition.
//!
//! The lane consumes its inbox in order, so a barrier is answered only after
//! every event queued ahead of it has been applied. A periodic tick closes
//! windows that ended while no events arrived and flushes due batches.

use std::sync::Arc;
use std::time::Duration;

use ticker_core::metrics::LANE_RECORDS;
use ticker_core::{CheckpointId, Event, GeneratorPosition, LaneSnapshot, Result, SinkTarget};
use ticker_io::SinkDispatcher;
use ticker_ops::{AggregateFunction, Clock, TumblingWindowAggregator};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::supervisor::Supervisor;

pub const LANE_TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum LaneMessage {
    Event(Event),
    /// Flush pending results, snapshot open windows as of `position`, then
    /// continue. A lane whose flush fails halts without answering.
    Barrier {
        id: CheckpointId,
        position: GeneratorPosition,
    },
    /// Force-close every window, flush and stop.
    Drain,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaneReport {
    pub lane: usize,
    pub events: u64,
    /// Window results handed to the dispatcher.
    pub results: u64,
    /// Results acknowledged by the sink target.
    pub delivered: u64,
    /// Set when the lane stopped on an unrecoverable error.
    pub halted: Option<String>,
}

pub struct Lane<F: AggregateFunction> {
    aggregator: TumblingWindowAggregator<F>,
    dispatcher: SinkDispatcher<Box<dyn SinkTarget>>,
    clock: Arc<dyn Clock>,
    report: LaneReport,
}

impl<F: AggregateFunction> Lane<F> {
    pub fn new(
        aggregator: TumblingWindowAggregator<F>,
        dispatcher: SinkDispatcher<Box<dyn SinkTarget>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let report = LaneReport {
            lane: aggregator.lane(),
            ..Default::default()
        };
        Self {
            aggregator,
            dispatcher,
            clock,
            report,
        }
    }

    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<LaneMessage>,
        snapshots: mpsc::Sender<LaneSnapshot>,
        supervisor: Supervisor,
    ) -> LaneReport {
        let lane = self.report.lane;
        let lane_label = lane.to_string();
        let mut ticker = tokio::time::interval(LANE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome: Result<()> = loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(LaneMessage::Event(event)) => {
                        LANE_RECORDS.with_label_values(&[lane_label.as_str(), "receive"]).inc();
                        self.report.events += 1;
                        let now = self.clock.now();
                        match self.aggregator.on_event(&event, now, &mut self.dispatcher).await {
                            Ok(emitted) => self.add_emitted(emitted as u64, &lane_label),
                            Err(e) => break Err(e),
                        }
                    }
                    Some(LaneMessage::Barrier { id, position }) => {
                        // results of windows closed before the barrier are in
                        // neither the snapshot nor the sink until flushed
                        if let Err(e) = self.dispatcher.flush().await {
                            break Err(e);
                        }
                        match self.aggregator.snapshot(id, position) {
                            Ok(snap) => {
                                debug!(lane, checkpoint = id, windows = snap.windows.len(), "barrier snapshot");
                                if snapshots.send(snap).await.is_err() {
                                    debug!(lane, "coordinator gone, snapshot dropped");
                                }
                            }
                            Err(e) => error!(lane, checkpoint = id, error = %e, "snapshot failed"),
                        }
                    }
                    Some(LaneMessage::Drain) | None => break self.drain(&lane_label).await,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick(&lane_label).await {
                        break Err(e);
                    }
                }
            }
        };

        if let Err(e) = outcome {
            supervisor.halt(lane, &e);
            self.report.halted = Some(e.to_string());
        }
        self.report.delivered = self.dispatcher.delivered();
        info!(
            lane,
            events = self.report.events,
            results = self.report.results,
            delivered = self.report.delivered,
            "lane stopped"
        );
        self.report
    }

    async fn on_tick(&mut self, lane_label: &str) -> Result<()> {
        let now = self.clock.now();
        let emitted = self.aggregator.advance(now, &mut self.dispatcher).await?;
        self.add_emitted(emitted as u64, lane_label);
        self.dispatcher.flush_if_due().await
    }

    async fn drain(&mut self, lane_label: &str) -> Result<()> {
        let emitted = self.aggregator.drain(&mut self.dispatcher).await?;
        self.add_emitted(emitted as u64, lane_label);
        self.dispatcher.flush().await
    }

    fn add_emitted(&mut self, n: u64, lane_label: &str) {
        if n > 0 {
            self.report.results += n;
            LANE_RECORDS.with_label_values(&[lane_label, "emit"]).inc_by(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use ticker_core::config::DispatchConfig;
    use ticker_core::OutputRecord;
    use ticker_ops::{Average, ManualClock};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<OutputRecord>>>);

    #[async_trait]
    impl SinkTarget for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }
        async fn write(&mut self, batch: &[Vec<u8>]) -> Result<()> {
            let mut guard = self.0.lock();
            for line in batch {
                guard.push(serde_json::from_slice(line)?);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn barrier_flushes_closed_results_before_snapshot() {
        let t0 = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(t0);
        let sink = Recorder::default();
        let cfg = DispatchConfig {
            batch_size: 100,
            flush_interval_ms: 60_000,
            ..Default::default()
        };
        let dispatcher = SinkDispatcher::new(0, Box::new(sink.clone()) as Box<dyn SinkTarget>, &cfg);
        let aggregator = TumblingWindowAggregator::new(0, chrono::Duration::seconds(10), Average);
        let lane = Lane::new(aggregator, dispatcher, Arc::new(clock.clone()));

        let (tx, rx) = mpsc::channel(16);
        let (snap_tx, mut snap_rx) = mpsc::channel(4);
        let handle = tokio::spawn(lane.run(rx, snap_tx, Supervisor::new(1)));

        tx.send(LaneMessage::Event(Event::new("AAPL", 10.0, t0))).await.unwrap();
        tx.send(LaneMessage::Event(Event::new("AAPL", 20.0, t0))).await.unwrap();
        tokio::time::sleep(LANE_TICK).await;
        clock.advance(chrono::Duration::seconds(10));
        tokio::time::sleep(LANE_TICK * 2).await;
        // closed but still batched
        assert!(sink.0.lock().is_empty());

        tx.send(LaneMessage::Event(Event::new("AAPL", 30.0, clock.now()))).await.unwrap();
        tx.send(LaneMessage::Barrier {
            id: 1,
            position: GeneratorPosition(3),
        })
        .await
        .unwrap();
        let snap = snap_rx.recv().await.unwrap();
        assert_eq!(snap.checkpoint_id, 1);
        assert_eq!(snap.windows.len(), 1);
        assert_eq!(snap.windows[0].window.start, t0 + chrono::Duration::seconds(10));
        assert_eq!(
            *sink.0.lock(),
            vec![OutputRecord {
                ticker: "AAPL".into(),
                price: 15.0,
                event_time: t0,
            }]
        );

        tx.send(LaneMessage::Drain).await.unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.events, 3);
        assert_eq!(report.results, 2);
        assert_eq!(report.delivered, 2);
        assert!(report.halted.is_none());
    }
}
