//! Processing-time tumbling windows for one lane.
//!
//! A window is open while it sits in the index and accepts values. Once the
//! lane clock reaches its end it is removed from the index (no further adds
//! can reach it), finalized, and emitted at most once. Windows that never
//! received a value are dropped without emitting anything.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use ticker_core::metrics::{EMPTY_WINDOWS, OPEN_WINDOWS, WINDOWS_EMITTED};
use ticker_core::{
    AggregateResult, CheckpointId, Error, Event, GeneratorPosition, LaneSnapshot, Result, WindowEmitter,
    WindowKey, WindowSnapshot,
};
use tracing::{debug, instrument};

use crate::AggregateFunction;

pub struct TumblingWindowAggregator<F: AggregateFunction> {
    lane: usize,
    length: Duration,
    func: F,
    windows: BTreeMap<WindowKey, F::Acc>,
}

impl<F: AggregateFunction> TumblingWindowAggregator<F> {
    pub fn new(lane: usize, length: Duration, func: F) -> Self {
        Self {
            lane,
            length,
            func,
            windows: BTreeMap::new(),
        }
    }

    pub fn lane(&self) -> usize {
        self.lane
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// The window an arrival for `key` at processing time `now` belongs to.
    pub fn assign(&self, key: &str, now: DateTime<Utc>) -> WindowKey {
        WindowKey::tumbling(key, now, self.length)
    }

    /// Closes due windows, then folds the event into its window. Returns the
    /// number of results emitted while closing.
    ///
    /// Assignment uses the arrival time, never the event's own timestamp, so a
    /// late event can not reopen a window that was already emitted.
    pub async fn on_event<E>(&mut self, event: &Event, now: DateTime<Utc>, emitter: &mut E) -> Result<usize>
    where
        E: WindowEmitter + ?Sized,
    {
        let emitted = self.advance(now, emitter).await?;
        self.add(&event.key, event.value, now);
        Ok(emitted)
    }

    /// Folds a value into the window open at `now`, creating it if needed.
    pub fn add(&mut self, key: &str, value: f64, now: DateTime<Utc>) {
        let window = self.assign(key, now);
        let func = &self.func;
        let acc = self.windows.entry(window).or_insert_with(|| func.create());
        func.add(acc, value);
        self.update_gauge();
    }

    /// Finalizes and emits every window whose end is at or before `now`.
    /// Returns the number of results emitted.
    #[instrument(name = "window_advance", skip_all, fields(lane = self.lane))]
    pub async fn advance<E>(&mut self, now: DateTime<Utc>, emitter: &mut E) -> Result<usize>
    where
        E: WindowEmitter + ?Sized,
    {
        let due: Vec<WindowKey> = self.windows.keys().filter(|w| w.is_closed_at(now)).cloned().collect();
        self.close_all(due, emitter).await
    }

    /// Force-closes every open window regardless of its end. Used on shutdown.
    #[instrument(name = "window_drain", skip_all, fields(lane = self.lane))]
    pub async fn drain<E>(&mut self, emitter: &mut E) -> Result<usize>
    where
        E: WindowEmitter + ?Sized,
    {
        let all: Vec<WindowKey> = self.windows.keys().cloned().collect();
        let emitted = self.close_all(all, emitter).await?;
        debug!(lane = self.lane, emitted, "windows drained");
        Ok(emitted)
    }

    // BTreeMap order is (key, start), so each key's windows close oldest first.
    async fn close_all<E>(&mut self, windows: Vec<WindowKey>, emitter: &mut E) -> Result<usize>
    where
        E: WindowEmitter + ?Sized,
    {
        let mut emitted = 0;
        for window in windows {
            let Some(acc) = self.windows.remove(&window) else {
                continue;
            };
            self.update_gauge();
            match self.func.finalize(&acc) {
                Some(average) => {
                    let result = AggregateResult {
                        key: window.key.clone(),
                        window_start: window.start,
                        average,
                    };
                    emitter.on_window_close(&window, result).await?;
                    WINDOWS_EMITTED.inc();
                    emitted += 1;
                }
                None => EMPTY_WINDOWS.inc(),
            }
        }
        Ok(emitted)
    }

    /// Serializes every open accumulator for a checkpoint barrier.
    pub fn snapshot(&self, checkpoint_id: CheckpointId, position: GeneratorPosition) -> Result<LaneSnapshot> {
        let windows = self
            .windows
            .iter()
            .map(|(window, acc)| {
                Ok(WindowSnapshot {
                    window: window.clone(),
                    state: serde_json::to_value(acc)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(LaneSnapshot {
            checkpoint_id,
            lane: self.lane,
            position,
            windows,
        })
    }

    /// Loads checkpointed windows, merging with any accumulator already open
    /// for the same window.
    pub fn restore(&mut self, snapshots: impl IntoIterator<Item = WindowSnapshot>) -> Result<()> {
        for snap in snapshots {
            let window = snap.window;
            if window.length() != self.length {
                return Err(Error::StateCorruption(format!(
                    "window {}@{} has length {}ms, expected {}ms",
                    window.key,
                    window.start,
                    window.length().num_milliseconds(),
                    self.length.num_milliseconds()
                )));
            }
            let acc: F::Acc = serde_json::from_value(snap.state).map_err(|e| {
                Error::StateCorruption(format!("window {}@{}: {e}", window.key, window.start))
            })?;
            self.func
                .check(&acc)
                .map_err(|e| Error::StateCorruption(format!("window {}@{}: {e}", window.key, window.start)))?;
            let merged = match self.windows.remove(&window) {
                Some(existing) => self.func.merge(existing, acc),
                None => acc,
            };
            self.windows.insert(window, merged);
        }
        self.update_gauge();
        Ok(())
    }

    fn update_gauge(&self) {
        OPEN_WINDOWS
            .with_label_values(&[&self.lane.to_string()])
            .set(self.windows.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Accumulator, Average};

    fn t(secs: i64) -> DateTime<Utc> {
        // aligned to 10s
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn ms(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + millis).unwrap()
    }

    fn agg() -> TumblingWindowAggregator<Average> {
        TumblingWindowAggregator::new(0, Duration::seconds(10), Average)
    }

    #[tokio::test]
    async fn averages_one_window() {
        let mut w = agg();
        let mut out: Vec<AggregateResult> = Vec::new();
        for (i, v) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            w.on_event(&Event::new("AAPL", v, t(0)), t(i as i64), &mut out).await.unwrap();
        }
        assert_eq!(w.advance(t(9), &mut out).await.unwrap(), 0);
        assert_eq!(w.advance(t(10), &mut out).await.unwrap(), 1);
        assert_eq!(
            out,
            vec![AggregateResult {
                key: "AAPL".into(),
                window_start: t(0),
                average: 20.0
            }]
        );
    }

    #[tokio::test]
    async fn boundary_event_opens_next_window() {
        let mut w = agg();
        let mut out: Vec<AggregateResult> = Vec::new();
        w.on_event(&Event::new("AAPL", 1.0, t(0)), ms(9_999), &mut out).await.unwrap();
        w.on_event(&Event::new("AAPL", 3.0, t(0)), ms(10_000), &mut out).await.unwrap();
        // the arrival at the boundary closed the first window
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].average, 1.0);
        w.advance(t(20), &mut out).await.unwrap();
        assert_eq!(out[1].window_start, t(10));
        assert_eq!(out[1].average, 3.0);
    }

    #[tokio::test]
    async fn each_window_emits_once() {
        let mut w = agg();
        let mut out: Vec<AggregateResult> = Vec::new();
        w.add("AAPL", 5.0, t(1));
        w.advance(t(10), &mut out).await.unwrap();
        w.advance(t(10), &mut out).await.unwrap();
        w.advance(t(30), &mut out).await.unwrap();
        w.drain(&mut out).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn late_event_goes_to_arrival_window() {
        let mut w = agg();
        let mut out: Vec<AggregateResult> = Vec::new();
        w.on_event(&Event::new("AAPL", 1.0, t(0)), t(5), &mut out).await.unwrap();
        w.advance(t(10), &mut out).await.unwrap();
        // carries a timestamp from the closed window but arrives later
        w.on_event(&Event::new("AAPL", 9.0, t(2)), t(12), &mut out).await.unwrap();
        w.drain(&mut out).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].window_start, t(10));
        assert_eq!(out[1].average, 9.0);
    }

    #[tokio::test]
    async fn per_key_results_have_increasing_starts() {
        let mut w = agg();
        let mut out: Vec<AggregateResult> = Vec::new();
        for s in 0..45 {
            w.on_event(&Event::new("AAPL", s as f64, t(s)), t(s), &mut out).await.unwrap();
            w.on_event(&Event::new("GOOG", 1.0, t(s)), t(s), &mut out).await.unwrap();
        }
        w.drain(&mut out).await.unwrap();
        for key in ["AAPL", "GOOG"] {
            let starts: Vec<_> = out.iter().filter(|r| r.key == key).map(|r| r.window_start).collect();
            assert_eq!(starts.len(), 5);
            assert!(starts.windows(2).all(|p| p[0] < p[1]));
        }
        let first_aapl = out.iter().find(|r| r.key == "AAPL").unwrap();
        assert_eq!(first_aapl.average, 4.5);
    }

    #[tokio::test]
    async fn empty_window_emits_nothing() {
        let mut w = agg();
        let mut out: Vec<AggregateResult> = Vec::new();
        w.restore(vec![WindowSnapshot {
            window: WindowKey::tumbling("AAPL", t(0), Duration::seconds(10)),
            state: serde_json::to_value(Accumulator::default()).unwrap(),
        }])
        .unwrap();
        assert_eq!(w.open_windows(), 1);
        assert_eq!(w.advance(t(10), &mut out).await.unwrap(), 0);
        assert!(out.is_empty());
        assert_eq!(w.open_windows(), 0);
    }

    #[tokio::test]
    async fn snapshot_restore_merges_collisions() {
        let mut a = agg();
        a.add("AAPL", 10.0, t(1));
        a.add("AAPL", 20.0, t(2));
        let snap = a.snapshot(3, GeneratorPosition(2)).unwrap();
        assert_eq!(snap.lane, 0);
        assert_eq!(snap.windows.len(), 1);

        let mut b = agg();
        b.add("AAPL", 60.0, t(3));
        b.restore(snap.windows).unwrap();
        let mut out: Vec<AggregateResult> = Vec::new();
        b.drain(&mut out).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].average, 30.0);
    }

    #[test]
    fn restore_rejects_bad_state() {
        let mut w = agg();
        let window = WindowKey::tumbling("AAPL", t(0), Duration::seconds(10));
        let garbage = WindowSnapshot {
            window: window.clone(),
            state: serde_json::json!({"total": "x"}),
        };
        assert!(matches!(w.restore(vec![garbage]), Err(Error::StateCorruption(_))));

        let negative = WindowSnapshot {
            window,
            state: serde_json::json!({"sum": 1.0, "count": -3}),
        };
        assert!(matches!(w.restore(vec![negative]), Err(Error::StateCorruption(_))));

        let wrong_len = WindowSnapshot {
            window: WindowKey::tumbling("AAPL", t(0), Duration::seconds(60)),
            state: serde_json::json!({"sum": 1.0, "count": 1}),
        };
        assert!(matches!(w.restore(vec![wrong_len]), Err(Error::StateCorruption(_))));
    }
}
