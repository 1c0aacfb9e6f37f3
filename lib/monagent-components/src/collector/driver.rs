use std::{sync::Arc, time::Duration};

use monagent_core::{
    data_model::{Dimensions, Measurement},
    observability::MetricsBuilder,
    time::Clock,
};
use monagent_error::{error_chain_string, generic_error, GenericError};
use tokio::{
    select,
    sync::Mutex,
    time::{interval, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    status::{write_status_file, CheckState, CheckStatus, EmitterStatus, StatusHandle, StatusSnapshot},
    telemetry::Telemetry,
    Check, CollectorConfiguration,
};
use crate::{
    aggregate::AggregatorHandle,
    forwarder::{Transaction, TransactionManager},
};

const COLLECTION_TIME_METRIC: &str = "collector.collection_time_sec";
const EMIT_TIME_METRIC: &str = "collector.emit_time_sec";

/// Where the collector is within a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollectorState {
    /// Waiting for the next run.
    Idle,

    /// Running checks and flushing the aggregator.
    Collecting,

    /// Decorating measurements and encoding them into transactions.
    BuildingPayload,

    /// Handing transactions to the forwarder.
    Emitting,
}

struct CheckSlot {
    name: String,
    check: Arc<Mutex<Box<dyn Check>>>,
}

/// Runs checks on a fixed period and hands their measurements to the forwarder.
///
/// Every run goes through the same steps: each check is run in turn, on its own task and under a timeout, so that a
/// failing, panicking, or hung check only loses its own output. The shared aggregator, if any, is flushed. The
/// collector then adds measurements of its own timings, merges the default dimensions into everything, splits the
/// result into transactions, and appends them to the forwarder's queue. Finally, a status snapshot of the run is
/// published.
///
/// Runs never overlap, and shutdown is checked between checks: a check that has started is allowed to finish, but no
/// further checks are started.
pub struct Collector {
    config: CollectorConfiguration,
    default_dimensions: Dimensions,
    checks: Vec<CheckSlot>,
    aggregator: Option<AggregatorHandle>,
    forwarder: Arc<TransactionManager>,
    clock: Arc<dyn Clock>,
    state: CollectorState,
    run_count: u64,
    last_emit_time: Option<Duration>,
    status: StatusHandle,
    telemetry: Telemetry,
}

impl Collector {
    /// Creates a collector with no checks, emitting to `forwarder`.
    pub fn new(config: CollectorConfiguration, forwarder: Arc<TransactionManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_dimensions: config.default_dimensions(),
            config,
            checks: Vec::new(),
            aggregator: None,
            forwarder,
            clock,
            state: CollectorState::Idle,
            run_count: 0,
            last_emit_time: None,
            status: StatusHandle::default(),
            telemetry: Telemetry::new(&MetricsBuilder::for_component("collector")),
        }
    }

    /// Flushes `aggregator` on every run.
    pub fn with_aggregator(mut self, aggregator: AggregatorHandle) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    /// Adds a check. Checks run in the order they were added.
    ///
    /// # Errors
    ///
    /// If a check with the same name was already added, an error is returned.
    pub fn add_check<C: Check + 'static>(&mut self, check: C) -> Result<(), GenericError> {
        let name = check.name().to_string();
        if self.checks.iter().any(|slot| slot.name == name) {
            return Err(generic_error!("Check '{}' is already registered.", name));
        }

        debug!(check = %name, "Registered check.");
        self.checks.push(CheckSlot {
            name,
            check: Arc::new(Mutex::new(Box::new(check))),
        });
        Ok(())
    }

    /// Returns the current state.
    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// Returns a handle for reading the latest status snapshot.
    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    fn transition(&mut self, next: CollectorState) {
        trace!(from = ?self.state, to = ?next, "Collector state transition.");
        self.state = next;
    }

    /// Performs a single run, and returns its status snapshot.
    pub async fn run_once(&mut self, shutdown: &CancellationToken) -> Arc<StatusSnapshot> {
        let collection_started = Instant::now();
        self.transition(CollectorState::Collecting);

        let mut measurements = Vec::new();
        let mut check_statuses = Vec::with_capacity(self.checks.len());
        for slot in &self.checks {
            if shutdown.is_cancelled() {
                debug!(
                    remaining = self.checks.len() - check_statuses.len(),
                    "Shutdown requested. Skipping remaining checks."
                );
                break;
            }

            let (status, output) = run_check(slot, self.config.check_timeout()).await;
            if matches!(status.state, CheckState::Failed(_)) {
                self.telemetry.check_failed();
            }
            check_statuses.push(status);
            measurements.extend(output);
        }

        if let Some(aggregator) = &self.aggregator {
            measurements.extend(aggregator.flush());
        }
        let collection_time = collection_started.elapsed();

        self.transition(CollectorState::BuildingPayload);
        let timestamp = self.clock.unix_timestamp();
        measurements.push(self_measurement(COLLECTION_TIME_METRIC, timestamp, collection_time));
        // Emission of this run has not happened yet, so the previous run's duration is reported.
        if let Some(emit_time) = self.last_emit_time {
            measurements.push(self_measurement(EMIT_TIME_METRIC, timestamp, emit_time));
        }
        for measurement in &mut measurements {
            measurement.merge_default_dimensions(&self.default_dimensions);
        }
        let measurement_count = measurements.len();
        let (transactions, dropped) = build_transactions(measurements, self.config.max_batch_size());

        self.transition(CollectorState::Emitting);
        let emit_started = Instant::now();
        let transaction_count = transactions.len();
        let mut evicted = 0;
        for tx in transactions {
            evicted += self.forwarder.append(tx).evicted;
        }
        let emit_time = emit_started.elapsed();

        self.last_emit_time = Some(emit_time);
        self.run_count += 1;
        self.telemetry.run_completed(collection_time, emit_time);

        debug!(
            run_count = self.run_count,
            measurements = measurement_count,
            transactions = transaction_count,
            ?collection_time,
            "Collector run complete."
        );

        let snapshot = self.status.store(StatusSnapshot {
            run_count: self.run_count,
            timestamp: self.clock.unix_timestamp(),
            collection_time: collection_time.as_secs_f64(),
            emit_time: emit_time.as_secs_f64(),
            check_statuses,
            emitter_statuses: vec![EmitterStatus {
                name: "forwarder".to_string(),
                measurements: measurement_count - dropped,
                transactions: transaction_count,
                evicted,
                dropped,
            }],
        });

        if let Some(path) = self.config.status_path() {
            if let Err(e) = write_status_file(path, &snapshot).await {
                warn!(error = %error_chain_string(&e), "Failed to persist collector status.");
            }
        }

        self.transition(CollectorState::Idle);
        snapshot
    }

    /// Runs on the configured interval until `shutdown` is cancelled, then stops every check.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            checks = self.checks.len(),
            interval = ?self.config.interval(),
            "Collector started."
        );

        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once(&shutdown).await;
                }
            }
        }

        self.stop().await;
        info!(runs = self.run_count, "Collector stopped.");
    }

    /// Stops every check.
    pub async fn stop(&mut self) {
        for slot in &self.checks {
            slot.check.lock().await.stop();
        }
    }
}

/// Runs a single check on its own task, returning its status and, if it succeeded, its measurements.
async fn run_check(slot: &CheckSlot, check_timeout: Duration) -> (CheckStatus, Vec<Measurement>) {
    let check = Arc::clone(&slot.check);
    let started = Instant::now();

    let task = tokio::spawn(async move {
        let mut check = check.lock_owned().await;
        let result = match timeout(check_timeout, check.run()).await {
            Ok(result) => result,
            Err(_) => Err(generic_error!("Check timed out after {:?}.", check_timeout)),
        };

        // Drained whether or not the run succeeded, so a failed run cannot leak into the next one.
        let metrics = check.get_metrics();
        let events = check.get_events();
        (result, metrics, events)
    });

    let (state, metrics, events) = match task.await {
        Ok((Ok(()), metrics, events)) => (CheckState::Ok, metrics, events),
        Ok((Err(e), _, _)) => {
            let error = error_chain_string(&e);
            error!(check = %slot.name, %error, "Check failed.");
            (CheckState::Failed(error), Vec::new(), Vec::new())
        }
        Err(e) => {
            let error = format!("Check panicked: {}", e);
            error!(check = %slot.name, %error, "Check failed.");
            (CheckState::Failed(error), Vec::new(), Vec::new())
        }
    };

    for event in &events {
        debug!(check = %slot.name, title = %event.title, timestamp = event.timestamp, "Check reported event.");
    }

    let status = CheckStatus {
        name: slot.name.clone(),
        state,
        metrics: metrics.len(),
        events: events.len(),
        duration_secs: started.elapsed().as_secs_f64(),
    };
    (status, metrics)
}

fn self_measurement(name: &str, timestamp: u64, duration: Duration) -> Measurement {
    Measurement::new(name, timestamp, duration.as_secs_f64()).with_dimension("component", "collector")
}

/// Splits `measurements` into transactions of at most `max_batch_size` measurements.
///
/// Returns the transactions and the number of measurements that could not be encoded.
fn build_transactions(mut measurements: Vec<Measurement>, max_batch_size: usize) -> (Vec<Transaction>, usize) {
    let before = measurements.len();
    measurements.retain(|measurement| measurement.value.is_finite());
    let mut dropped = before - measurements.len();
    if dropped > 0 {
        warn!(dropped, "Dropping measurements with non-finite values.");
    }

    let mut transactions = Vec::with_capacity(measurements.len().div_ceil(max_batch_size));
    for batch in measurements.chunks(max_batch_size) {
        match Transaction::from_measurements(batch) {
            Ok(tx) => transactions.push(tx),
            Err(e) => {
                error!(error = %e, measurements = batch.len(), "Failed to encode batch.");
                dropped += batch.len();
            }
        }
    }

    (transactions, dropped)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex,
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use monagent_core::{
        data_model::{payload::decode_batch, Event},
        time::ManualClock,
    };

    use super::*;
    use crate::{
        aggregate::{AggregateConfiguration, Aggregator},
        forwarder::{DeliveryEndpoint, ForwarderConfiguration},
    };

    const NOW: u64 = 1_700_000_000;

    #[derive(Default)]
    struct RecordingEndpoint {
        received: StdMutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl DeliveryEndpoint for RecordingEndpoint {
        fn name(&self) -> &str {
            "recording"
        }

        async fn post(&self, payload: Bytes) -> Result<(), GenericError> {
            self.received.lock().unwrap().push(payload);
            Ok(())
        }
    }

    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Sleep(Duration),
    }

    struct TestCheck {
        name: &'static str,
        behavior: Behavior,
        produces: Vec<Measurement>,
        events: Vec<Event>,
        buffered: Vec<Measurement>,
        stopped: Arc<AtomicBool>,
    }

    impl TestCheck {
        fn new(name: &'static str, behavior: Behavior) -> Self {
            Self {
                name,
                behavior,
                produces: Vec::new(),
                events: Vec::new(),
                buffered: Vec::new(),
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn producing(mut self, measurements: Vec<Measurement>) -> Self {
            self.produces = measurements;
            self
        }

        fn with_event(mut self, event: Event) -> Self {
            self.events.push(event);
            self
        }
    }

    #[async_trait]
    impl Check for TestCheck {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&mut self) -> Result<(), GenericError> {
            self.buffered.extend(self.produces.iter().cloned());
            match self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail => Err(generic_error!("permission denied")),
                Behavior::Panic => panic!("check exploded"),
                Behavior::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(())
                }
            }
        }

        fn get_metrics(&mut self) -> Vec<Measurement> {
            std::mem::take(&mut self.buffered)
        }

        fn get_events(&mut self) -> Vec<Event> {
            self.events.clone()
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        collector: Collector,
        forwarder: Arc<TransactionManager>,
        endpoint: Arc<RecordingEndpoint>,
        clock: ManualClock,
    }

    impl Harness {
        fn new(config: CollectorConfiguration) -> Self {
            let endpoint = Arc::new(RecordingEndpoint::default());
            let delivery: Arc<dyn DeliveryEndpoint> = endpoint.clone();
            let forwarder = Arc::new(TransactionManager::new(
                &ForwarderConfiguration::with_defaults(),
                delivery,
            ));
            let clock = ManualClock::new(NOW);
            let collector = Collector::new(config, Arc::clone(&forwarder), Arc::new(clock.clone()));

            Self {
                collector,
                forwarder,
                endpoint,
                clock,
            }
        }

        async fn delivered(&self) -> Vec<Measurement> {
            self.forwarder.flush(&CancellationToken::new()).await;
            self.endpoint
                .received
                .lock()
                .unwrap()
                .drain(..)
                .flat_map(|payload| decode_batch(&payload).unwrap())
                .collect()
        }
    }

    fn names(measurements: &[Measurement]) -> Vec<&str> {
        measurements.iter().map(|m| m.name.as_str()).collect()
    }

    #[tokio::test]
    async fn failing_checks_are_isolated() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults());
        let collector = &mut harness.collector;
        collector
            .add_check(
                TestCheck::new("cpu", Behavior::Succeed).producing(vec![Measurement::new("cpu.idle_perc", NOW, 97.0)]),
            )
            .unwrap();
        collector
            .add_check(
                TestCheck::new("disk", Behavior::Fail).producing(vec![Measurement::new("disk.space_used_perc", NOW, 1.0)]),
            )
            .unwrap();
        collector
            .add_check(TestCheck::new("broken", Behavior::Panic))
            .unwrap();
        collector
            .add_check(
                TestCheck::new("mem", Behavior::Succeed).producing(vec![Measurement::new("mem.free_mb", NOW, 512.0)]),
            )
            .unwrap();

        let snapshot = collector.run_once(&CancellationToken::new()).await;
        assert_eq!(collector.state(), CollectorState::Idle);
        assert_eq!(snapshot.run_count, 1);
        assert_eq!(snapshot.check_statuses.len(), 4);
        assert_eq!(snapshot.check("cpu").unwrap().state, CheckState::Ok);
        assert_eq!(
            snapshot.check("disk").unwrap().state,
            CheckState::Failed("permission denied".to_string())
        );
        assert!(matches!(&snapshot.check("broken").unwrap().state, CheckState::Failed(e) if e.contains("panicked")));
        assert_eq!(snapshot.check("mem").unwrap().metrics, 1);

        let delivered = harness.delivered().await;
        assert_eq!(
            names(&delivered),
            vec!["cpu.idle_perc", "mem.free_mb", COLLECTION_TIME_METRIC]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_check_times_out() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults().with_check_timeout(Duration::from_secs(5)));
        harness
            .collector
            .add_check(TestCheck::new("slow", Behavior::Sleep(Duration::from_secs(60))))
            .unwrap();

        let snapshot = harness.collector.run_once(&CancellationToken::new()).await;
        let status = snapshot.check("slow").unwrap();
        assert!(matches!(&status.state, CheckState::Failed(e) if e.contains("timed out")));
        assert!(status.duration_secs < 60.0);
    }

    #[tokio::test]
    async fn self_measurements_and_default_dimensions() {
        let config = CollectorConfiguration::with_defaults()
            .with_hostname("web-1")
            .with_dimension("service", "monitoring");
        let mut harness = Harness::new(config);
        harness
            .collector
            .add_check(TestCheck::new("cpu", Behavior::Succeed).producing(vec![
                Measurement::new("cpu.idle_perc", NOW, 97.0).with_dimension("service", "compute"),
            ]))
            .unwrap();

        harness.collector.run_once(&CancellationToken::new()).await;
        let first = harness.delivered().await;
        assert_eq!(names(&first), vec!["cpu.idle_perc", COLLECTION_TIME_METRIC]);

        let cpu = &first[0];
        assert_eq!(cpu.dimensions["service"], "compute");
        assert_eq!(cpu.dimensions["hostname"], "web-1");

        let collection_time = &first[1];
        assert_eq!(collection_time.timestamp, NOW);
        assert_eq!(collection_time.dimensions["component"], "collector");
        assert_eq!(collection_time.dimensions["service"], "monitoring");

        harness.clock.advance(15);
        harness.collector.run_once(&CancellationToken::new()).await;
        let second = harness.delivered().await;
        assert_eq!(
            names(&second),
            vec!["cpu.idle_perc", COLLECTION_TIME_METRIC, EMIT_TIME_METRIC]
        );
        assert!(second.iter().all(|m| m.timestamp == NOW + 15 || m.name == "cpu.idle_perc"));
    }

    #[tokio::test]
    async fn measurements_are_batched() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults().with_max_batch_size(2));
        let produced = (0..5)
            .map(|i| Measurement::new(format!("net.bytes_in.{}", i), NOW, i as f64))
            .collect();
        harness
            .collector
            .add_check(TestCheck::new("net", Behavior::Succeed).producing(produced))
            .unwrap();

        let snapshot = harness.collector.run_once(&CancellationToken::new()).await;
        assert_eq!(harness.forwarder.len(), 3);
        assert_eq!(snapshot.emitter_statuses[0].transactions, 3);
        assert_eq!(snapshot.emitter_statuses[0].measurements, 6);
        assert_eq!(harness.delivered().await.len(), 6);
    }

    #[tokio::test]
    async fn non_finite_values_are_dropped() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults());
        harness
            .collector
            .add_check(TestCheck::new("odd", Behavior::Succeed).producing(vec![
                Measurement::new("odd.nan", NOW, f64::NAN),
                Measurement::new("odd.fine", NOW, 1.0),
            ]))
            .unwrap();

        let snapshot = harness.collector.run_once(&CancellationToken::new()).await;
        assert_eq!(snapshot.emitter_statuses[0].dropped, 1);
        assert_eq!(
            names(&harness.delivered().await),
            vec!["odd.fine", COLLECTION_TIME_METRIC]
        );
    }

    #[tokio::test]
    async fn aggregator_is_flushed_every_run() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults());
        let aggregator = AggregatorHandle::new(Aggregator::new(
            &AggregateConfiguration::with_defaults().with_interval_secs(10),
            Arc::new(harness.clock.clone()),
        ));
        harness.collector = Collector::new(
            CollectorConfiguration::with_defaults(),
            Arc::clone(&harness.forwarder),
            Arc::new(harness.clock.clone()),
        )
        .with_aggregator(aggregator.clone());

        aggregator.gauge("cpu.pct", 42.0, Dimensions::from([("host".to_string(), "a".to_string())]));
        harness.collector.run_once(&CancellationToken::new()).await;

        let delivered = harness.delivered().await;
        assert_eq!(names(&delivered), vec!["cpu.pct", COLLECTION_TIME_METRIC]);
        assert_eq!(delivered[0].value, 42.0);
        assert_eq!(delivered[0].dimensions["host"], "a");
    }

    #[tokio::test]
    async fn events_are_counted_in_status() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults());
        harness
            .collector
            .add_check(TestCheck::new("svc", Behavior::Succeed).with_event(Event::new("restart", "nginx restarted", NOW)))
            .unwrap();

        let snapshot = harness.collector.run_once(&CancellationToken::new()).await;
        assert_eq!(snapshot.check("svc").unwrap().events, 1);
    }

    #[tokio::test]
    async fn shutdown_skips_remaining_checks() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults());
        harness.collector.add_check(TestCheck::new("cpu", Behavior::Succeed)).unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let snapshot = harness.collector.run_once(&shutdown).await;
        assert!(snapshot.check_statuses.is_empty());
    }

    #[tokio::test]
    async fn duplicate_check_names_are_rejected() {
        let mut harness = Harness::new(CollectorConfiguration::with_defaults());
        harness.collector.add_check(TestCheck::new("cpu", Behavior::Succeed)).unwrap();
        assert!(harness.collector.add_check(TestCheck::new("cpu", Behavior::Fail)).is_err());
    }

    #[tokio::test]
    async fn status_is_published_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector-status.json");
        let mut harness = Harness::new(CollectorConfiguration::with_defaults().with_status_path(&path));
        harness.collector.add_check(TestCheck::new("cpu", Behavior::Fail)).unwrap();
        let status = harness.collector.status_handle();
        assert_eq!(status.load().run_count, 0);

        harness.collector.run_once(&CancellationToken::new()).await;
        assert_eq!(status.load().run_count, 1);

        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["run_count"], 1);
        assert_eq!(written["check_statuses"][0]["name"], "cpu");
        assert_eq!(written["check_statuses"][0]["state"], "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_checks_on_shutdown() {
        let harness = Harness::new(CollectorConfiguration::with_defaults());
        let mut collector = harness.collector;
        let check = TestCheck::new("cpu", Behavior::Succeed);
        let stopped = Arc::clone(&check.stopped);
        collector.add_check(check).unwrap();
        let status = collector.status_handle();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(collector.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(status.load().run_count, 3);

        shutdown.cancel();
        handle.await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
