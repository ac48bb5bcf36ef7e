//! Geofence workers - evaluate devices off the ingest path
//!
//! Ingest stores a position and enqueues an `EvalJob`; a pool of workers
//! runs the evaluation pass. Jobs are sharded by device id so every device
//! maps to exactly one worker, which keeps passes for one device in arrival
//! order while different devices run in parallel.
//!
//! The ingest side holds the shard's submit lock across the position write
//! and the enqueue, so store order and queue order agree.
//!
//! No job is lost: when a shard queue is full the job is folded into the
//! shard's backlog (oldest and newest position time per device) and the
//! worker runs it once its queue is empty. The engine keeps a per-device
//! cursor, so one catch-up pass covers every window the device reported
//! since its last pass.

use crate::domain::{DeviceId, Transition};
use crate::infra::metrics::Metrics;
use crate::services::alert_recorder::{AlertRecorder, RecordOutcome};
use crate::services::transition_detector::{EvaluationError, RangeStart, TransitionDetector};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard, Notify};
use tracing::{debug, info, warn};

/// A request to evaluate one device
#[derive(Debug, Clone)]
pub struct EvalJob {
    pub device_id: DeviceId,
    /// Capture time of the position that triggered the job
    pub position_at: DateTime<Utc>,
    /// When the job was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

impl EvalJob {
    pub fn new(device_id: DeviceId, position_at: DateTime<Utc>) -> Self {
        Self { device_id, position_at, enqueued_at: Instant::now() }
    }
}

/// What one evaluation pass produced
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PassReport {
    pub transitions: Vec<Transition>,
    pub recorded: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Detector and recorder wired together
pub struct GeofenceEngine {
    detector: TransitionDetector,
    recorder: AlertRecorder,
    metrics: Arc<Metrics>,
    /// Capture time of the newest position evaluated per device
    cursors: Mutex<FxHashMap<DeviceId, DateTime<Utc>>>,
}

impl GeofenceEngine {
    pub fn new(detector: TransitionDetector, recorder: AlertRecorder, metrics: Arc<Metrics>) -> Self {
        Self { detector, recorder, metrics, cursors: Mutex::new(FxHashMap::default()) }
    }

    /// Run one full evaluation of the device's two newest positions
    ///
    /// A store failure while reading aborts the pass without side effects.
    /// A failed alert write is counted and the remaining transitions are
    /// still recorded.
    pub async fn run_pass(&self, device_id: DeviceId) -> Result<PassReport, EvaluationError> {
        let start = Instant::now();
        let transitions = self.check(device_id, self.detector.evaluate(device_id).await)?;
        Ok(self.finish(device_id, transitions, start).await)
    }

    /// Evaluate every position the device reported up to `until`
    ///
    /// Picks up after the device's cursor, so windows whose own job was
    /// merged into the backlog are still classified in capture order.
    /// Without a cursor the pass starts at `since`, the oldest position the
    /// caller knows is unevaluated. A job already covered by an earlier pass
    /// is a no-op. The cursor only moves when every alert of the pass was
    /// written.
    pub async fn catch_up(
        &self,
        device_id: DeviceId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<PassReport, EvaluationError> {
        let cursor = self.cursors.lock().get(&device_id).copied();
        let range_start = match cursor {
            Some(cursor) if cursor >= until => {
                debug!(device_id = %device_id, until = %until.to_rfc3339(), "geofence_job_covered");
                return Ok(PassReport::default());
            }
            Some(cursor) => RangeStart::After(cursor),
            None => RangeStart::From(since.min(until)),
        };

        let start = Instant::now();
        let evaluated = self.detector.evaluate_range(device_id, range_start, until).await;
        let (transitions, through) = self.check(device_id, evaluated)?;
        let report = self.finish(device_id, transitions, start).await;

        if let (Some(through), 0) = (through, report.failed) {
            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(device_id).or_insert(through);
            *cursor = (*cursor).max(through);
        }
        Ok(report)
    }

    fn check<T>(
        &self,
        device_id: DeviceId,
        result: Result<T, EvaluationError>,
    ) -> Result<T, EvaluationError> {
        result.map_err(|e| {
            warn!(device_id = %device_id, error = %e, "geofence_pass_aborted");
            self.metrics.record_evaluation_aborted();
            e
        })
    }

    async fn finish(
        &self,
        device_id: DeviceId,
        transitions: Vec<Transition>,
        start: Instant,
    ) -> PassReport {
        let mut report = PassReport::default();
        for transition in &transitions {
            match self.recorder.record(transition).await {
                Ok(RecordOutcome::Recorded(_)) => report.recorded += 1,
                Ok(RecordOutcome::Duplicate) => report.duplicates += 1,
                Err(_) => report.failed += 1,
            }
        }
        report.transitions = transitions;

        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_evaluation(latency_us);
        debug!(
            device_id = %device_id,
            transitions = %report.transitions.len(),
            recorded = %report.recorded,
            latency_us = %latency_us,
            "geofence_pass_complete"
        );
        report
    }
}

/// Jobs that did not fit in a shard queue, merged per device into the
/// (oldest, newest) trigger times
#[derive(Default)]
struct Backlog {
    pending: Mutex<FxHashMap<DeviceId, (DateTime<Utc>, DateTime<Utc>)>>,
    notify: Notify,
}

impl Backlog {
    fn defer(&self, job: &EvalJob) {
        let at = job.position_at;
        self.pending
            .lock()
            .entry(job.device_id)
            .and_modify(|(oldest, newest)| {
                *oldest = (*oldest).min(at);
                *newest = (*newest).max(at);
            })
            .or_insert((at, at));
        self.notify.notify_one();
    }

    fn take(&self) -> Vec<(DeviceId, (DateTime<Utc>, DateTime<Utc>))> {
        self.pending.lock().drain().collect()
    }
}

/// Worker that owns one shard's queue
pub struct GeofenceWorker {
    shard: usize,
    engine: Arc<GeofenceEngine>,
    job_rx: mpsc::Receiver<EvalJob>,
    backlog: Arc<Backlog>,
}

impl GeofenceWorker {
    fn new(
        shard: usize,
        engine: Arc<GeofenceEngine>,
        job_rx: mpsc::Receiver<EvalJob>,
        backlog: Arc<Backlog>,
    ) -> Self {
        Self { shard, engine, job_rx, backlog }
    }

    /// Run the worker until every sender is dropped and the backlog is empty
    ///
    /// Queued jobs go first; the backlog only holds reports newer than
    /// everything that was queued when they arrived.
    pub async fn run(mut self) {
        info!(shard = %self.shard, "geofence_worker_started");

        loop {
            tokio::select! {
                biased;
                job = self.job_rx.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
                _ = self.backlog.notify.notified() => self.drain_backlog().await,
            }
        }
        self.drain_backlog().await;

        info!(shard = %self.shard, "geofence_worker_stopped");
    }

    async fn process(&self, job: EvalJob) {
        let queue_delay_us = job.enqueued_at.elapsed().as_micros() as u64;
        if queue_delay_us > 100_000 {
            warn!(
                shard = %self.shard,
                device_id = %job.device_id,
                queue_delay_us = %queue_delay_us,
                "geofence_queue_delay_high"
            );
        }

        // Errors are logged and counted inside the engine
        let _ = self.engine.catch_up(job.device_id, job.position_at, job.position_at).await;
    }

    async fn drain_backlog(&self) {
        for (device_id, (since, until)) in self.backlog.take() {
            debug!(shard = %self.shard, device_id = %device_id, "geofence_backlog_pass");
            let _ = self.engine.catch_up(device_id, since, until).await;
        }
    }
}

/// How `GeofenceDispatcher::submit` handled a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    /// Queue full; merged into the shard backlog
    Deferred,
    /// Worker is gone (shutdown)
    Closed,
}

impl Dispatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dispatch::Queued => "queued",
            Dispatch::Deferred => "deferred",
            Dispatch::Closed => "closed",
        }
    }
}

struct Shard {
    sender: AsyncMutex<mpsc::Sender<EvalJob>>,
    backlog: Arc<Backlog>,
}

/// Routes evaluation jobs to the worker that owns the device
pub struct GeofenceDispatcher {
    shards: Vec<Shard>,
    metrics: Arc<Metrics>,
    last_full_warn: Mutex<Option<Instant>>,
}

impl GeofenceDispatcher {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for a device, stable for the life of the process
    pub fn shard_for(&self, device_id: DeviceId) -> usize {
        let mut hasher = FxHasher::default();
        device_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Lock the device's shard for submission
    ///
    /// Hold the guard across the position write and `submit` so that
    /// concurrent reports for the same device enqueue in store order.
    pub async fn shard_sender(&self, device_id: DeviceId) -> MutexGuard<'_, mpsc::Sender<EvalJob>> {
        self.shards[self.shard_for(device_id)].sender.lock().await
    }

    /// Enqueue a job without blocking the caller
    ///
    /// A full queue defers the job to the shard backlog instead of
    /// dropping it.
    pub fn submit(&self, sender: &mpsc::Sender<EvalJob>, job: EvalJob) -> Dispatch {
        match sender.try_send(job) {
            Ok(()) => Dispatch::Queued,
            Err(TrySendError::Full(job)) => {
                self.shards[self.shard_for(job.device_id)].backlog.defer(&job);
                self.metrics.record_eval_job_deferred();
                let mut last = self.last_full_warn.lock();
                if last.map_or(true, |at| at.elapsed() > Duration::from_secs(1)) {
                    warn!(device_id = %job.device_id, "geofence_queue_full: job deferred to backlog");
                    *last = Some(Instant::now());
                }
                Dispatch::Deferred
            }
            Err(TrySendError::Closed(job)) => {
                warn!(device_id = %job.device_id, "geofence_job_queue_closed");
                Dispatch::Closed
            }
        }
    }
}

/// Create the sharded job queues and their workers
///
/// Returns the dispatcher (for ingest) and the workers (to be spawned).
/// `shards` is clamped to at least one.
pub fn create_geofence_workers(
    engine: Arc<GeofenceEngine>,
    metrics: Arc<Metrics>,
    shards: usize,
    queue_capacity: usize,
) -> (GeofenceDispatcher, Vec<GeofenceWorker>) {
    let shards = shards.max(1);
    let mut senders = Vec::with_capacity(shards);
    let mut workers = Vec::with_capacity(shards);

    for shard in 0..shards {
        let (job_tx, job_rx) = mpsc::channel(queue_capacity.max(1));
        let backlog = Arc::new(Backlog::default());
        senders.push(Shard { sender: AsyncMutex::new(job_tx), backlog: backlog.clone() });
        workers.push(GeofenceWorker::new(shard, engine.clone(), job_rx, backlog));
    }

    let dispatcher =
        GeofenceDispatcher { shards: senders, metrics, last_full_warn: Mutex::new(None) };
    (dispatcher, workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewZone, Position, TransitionKind};
    use crate::store::{MemoryStore, SpatialStore};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn zone_a() -> NewZone {
        NewZone {
            name: "Zone A".to_string(),
            center_latitude: 4.6548,
            center_longitude: -74.0543,
            radius_meters: 50.0,
            alert_on_entry: true,
            alert_on_exit: true,
        }
    }

    fn engine(store: Arc<MemoryStore>, metrics: Arc<Metrics>) -> Arc<GeofenceEngine> {
        let timeout = Duration::from_millis(500);
        Arc::new(GeofenceEngine::new(
            TransitionDetector::new(store.clone(), timeout, metrics.clone()),
            AlertRecorder::new(store, timeout, metrics.clone()),
            metrics,
        ))
    }

    #[tokio::test]
    async fn test_run_pass_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        store.create_zone(zone_a()).await.unwrap();
        let d = DeviceId(7);
        store.append_position(Position::new(d, 4.6548, -74.0543, t(0))).await.unwrap();

        let metrics = Arc::new(Metrics::new());
        let engine = engine(store.clone(), metrics.clone());

        let first = engine.run_pass(d).await.unwrap();
        assert_eq!(first.recorded, 1);
        let second = engine.run_pass(d).await.unwrap();
        assert_eq!(second.recorded, 0);
        assert_eq!(second.duplicates, 1);

        assert_eq!(store.alert_count(), 1);
        assert_eq!(metrics.evaluations_total(), 2);
    }

    #[tokio::test]
    async fn test_run_pass_abort_counts() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let metrics = Arc::new(Metrics::new());
        let engine = engine(store, metrics.clone());

        assert!(engine.run_pass(DeviceId(1)).await.is_err());
        assert_eq!(metrics.evaluations_aborted(), 1);
        assert_eq!(metrics.evaluations_total(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_does_not_block_other_zones() {
        let store = Arc::new(MemoryStore::new());
        store.create_zone(zone_a()).await.unwrap();
        store.create_zone(NewZone { name: "Zone B".to_string(), ..zone_a() }).await.unwrap();
        let d = DeviceId(3);
        store.append_position(Position::new(d, 4.6548, -74.0543, t(0))).await.unwrap();
        store.set_alert_writes_failing(true);

        let metrics = Arc::new(Metrics::new());
        let report = engine(store, metrics.clone()).run_pass(d).await.unwrap();
        assert_eq!(report.transitions.len(), 2);
        assert_eq!(report.failed, 2);
        assert_eq!(metrics.alerts_failed(), 2);
    }

    #[tokio::test]
    async fn test_shard_assignment_is_stable() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let (dispatcher, workers) = create_geofence_workers(engine(store, metrics.clone()), metrics, 4, 8);
        assert_eq!(workers.len(), 4);
        assert_eq!(dispatcher.shard_count(), 4);

        for id in 0..100 {
            let shard = dispatcher.shard_for(DeviceId(id));
            assert!(shard < 4);
            assert_eq!(shard, dispatcher.shard_for(DeviceId(id)));
        }
    }

    #[tokio::test]
    async fn test_catch_up_skips_covered_jobs() {
        let store = Arc::new(MemoryStore::new());
        store.create_zone(zone_a()).await.unwrap();
        let d = DeviceId(2);
        store.append_position(Position::new(d, 4.6570, -74.0500, t(0))).await.unwrap();
        store.append_position(Position::new(d, 4.6548, -74.0543, t(10))).await.unwrap();

        let metrics = Arc::new(Metrics::new());
        let engine = engine(store.clone(), metrics.clone());

        let report = engine.catch_up(d, t(10), t(10)).await.unwrap();
        assert_eq!(report.recorded, 1);
        // An older job that was merged into this pass does nothing
        assert_eq!(engine.catch_up(d, t(0), t(0)).await.unwrap(), PassReport::default());
        assert_eq!(metrics.evaluations_total(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_on_next_job() {
        let store = Arc::new(MemoryStore::new());
        store.create_zone(zone_a()).await.unwrap();
        let d = DeviceId(4);
        store.append_position(Position::new(d, 4.6570, -74.0500, t(0))).await.unwrap();
        store.append_position(Position::new(d, 4.6548, -74.0543, t(10))).await.unwrap();

        let metrics = Arc::new(Metrics::new());
        let engine = engine(store.clone(), metrics.clone());
        engine.catch_up(d, t(0), t(0)).await.unwrap();

        store.set_alert_writes_failing(true);
        assert_eq!(engine.catch_up(d, t(10), t(10)).await.unwrap().failed, 1);

        store.set_alert_writes_failing(false);
        store.append_position(Position::new(d, 4.6549, -74.0542, t(20))).await.unwrap();
        let report = engine.catch_up(d, t(20), t(20)).await.unwrap();
        assert_eq!(report.recorded, 1);
        assert_eq!(report.transitions[0].at, t(10));
        assert_eq!(store.alert_count(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_defers_to_backlog() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let (dispatcher, _workers) =
            create_geofence_workers(engine(store, metrics.clone()), metrics.clone(), 1, 1);

        let d = DeviceId(1);
        let sender = dispatcher.shard_sender(d).await;
        assert_eq!(dispatcher.submit(&sender, EvalJob::new(d, t(0))), Dispatch::Queued);
        assert_eq!(dispatcher.submit(&sender, EvalJob::new(d, t(2))), Dispatch::Deferred);
        assert_eq!(dispatcher.submit(&sender, EvalJob::new(d, t(1))), Dispatch::Deferred);
        assert_eq!(metrics.eval_jobs_deferred(), 2);

        // Merged per device into the oldest and newest trigger
        assert_eq!(dispatcher.shards[0].backlog.take(), vec![(d, (t(1), t(2)))]);
    }

    #[tokio::test]
    async fn test_closed_queue_reports_closed() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let (dispatcher, workers) =
            create_geofence_workers(engine(store, metrics.clone()), metrics.clone(), 1, 4);
        drop(workers);

        let d = DeviceId(1);
        let sender = dispatcher.shard_sender(d).await;
        assert_eq!(dispatcher.submit(&sender, EvalJob::new(d, t(0))), Dispatch::Closed);
    }

    /// Store positions and enqueue their jobs the way ingest does
    async fn report_all(
        store: &MemoryStore,
        dispatcher: &GeofenceDispatcher,
        d: DeviceId,
        route: &[(f64, f64)],
    ) {
        for (i, (lat, lon)) in route.iter().enumerate() {
            let position = Position::new(d, *lat, *lon, t(i as i64 * 10));
            let sender = dispatcher.shard_sender(d).await;
            store.append_position(position.clone()).await.unwrap();
            dispatcher.submit(&sender, EvalJob::new(d, position.captured_at));
        }
    }

    async fn alert_kinds(store: &MemoryStore, d: DeviceId) -> Vec<(TransitionKind, DateTime<Utc>)> {
        let alerts = store.list_alerts(Some(d), 10).await.unwrap();
        alerts.iter().rev().map(|a| (a.kind, a.position_at)).collect()
    }

    const OUT: (f64, f64) = (4.6570, -74.0500);
    const IN: (f64, f64) = (4.6548, -74.0543);

    #[tokio::test]
    async fn test_queued_reports_each_get_their_window() {
        let store = Arc::new(MemoryStore::new());
        store.create_zone(zone_a()).await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let (dispatcher, workers) =
            create_geofence_workers(engine(store.clone(), metrics.clone()), metrics.clone(), 2, 16);

        // Every job is queued before any worker runs
        let d = DeviceId(9);
        report_all(&store, &dispatcher, d, &[OUT, IN, IN]).await;

        let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();
        drop(dispatcher);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(alert_kinds(&store, d).await, vec![(TransitionKind::Entered, t(10))]);
    }

    #[tokio::test]
    async fn test_full_queue_loses_no_crossing() {
        let store = Arc::new(MemoryStore::new());
        store.create_zone(zone_a()).await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let (dispatcher, workers) =
            create_geofence_workers(engine(store.clone(), metrics.clone()), metrics.clone(), 1, 1);

        let d = DeviceId(9);
        report_all(&store, &dispatcher, d, &[OUT, IN, IN, OUT, IN]).await;
        assert_eq!(metrics.eval_jobs_deferred(), 4);

        let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();
        drop(dispatcher);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            alert_kinds(&store, d).await,
            vec![
                (TransitionKind::Entered, t(10)),
                (TransitionKind::Exited, t(30)),
                (TransitionKind::Entered, t(40)),
            ]
        );
    }

    #[tokio::test]
    async fn test_worker_processes_jobs_in_order() {
        let store = Arc::new(MemoryStore::new());
        store.create_zone(zone_a()).await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let (dispatcher, workers) =
            create_geofence_workers(engine(store.clone(), metrics.clone()), metrics.clone(), 2, 16);
        let handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

        let d = DeviceId(9);
        report_all(&store, &dispatcher, d, &[IN, OUT, IN]).await;

        drop(dispatcher);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            alert_kinds(&store, d).await,
            vec![
                (TransitionKind::Entered, t(0)),
                (TransitionKind::Exited, t(10)),
                (TransitionKind::Entered, t(20)),
            ]
        );
    }
}
