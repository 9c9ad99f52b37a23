//! The per-rank analysis loop.
//!
//! ```text
//!  EventSource ─► EventStore ─flush─► CallBatch ─► OutlierDetector::run_batch
//!                                                     │
//!                         ProvenanceWriter ◄──────────┤
//!                                                     ▼
//!                     every K steps / N outliers:  sync with the PS
//!                       lookup_function_indices  (local fid → global index)
//!                       update_params            (delta out, global model in)
//!                       update_combined          (anomaly + counter stats + metrics)
//! ```
//!
//! Local function ids never leave the rank: everything pushed to the
//! parameter server is keyed by global index, and the global model is keyed
//! back to local ids before the detector adopts it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use insitu_detect::{prune_normals, OutlierDetector, ProvenanceRecord, StepAnomalies};
use insitu_stats::RunningStats;
use insitu_sync::{AnomalyStatsReport, CombinedReport, CounterStatsReport, PsClient, SyncResult};
use insitu_trace::{CallBatch, EventStore};
use insitu_types::{Event, FunctionId, ProgramId, RankId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DriverConfig;
use crate::error::DriverResult;
use crate::sink::ProvenanceWriter;
use crate::source::{EventSource, SourceStatus};

/// Aggregate counts of one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverReport {
    pub run_id: Uuid,
    pub program: ProgramId,
    pub rank: RankId,
    pub steps: u64,
    pub events: u64,
    pub calls: u64,
    pub outliers: u64,
    /// Events dropped by the event store.
    pub event_errors: u64,
    /// Source records that could not be decoded.
    pub skipped_records: u64,
    pub sync_rounds: u64,
    pub sync_failures: u64,
    pub provenance_records: u64,
    pub provenance_failures: u64,
    /// Ran (at least partly) without a parameter server.
    pub degraded: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DriverReport {
    fn new(program: ProgramId, rank: RankId) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            program,
            rank,
            steps: 0,
            events: 0,
            calls: 0,
            outliers: 0,
            event_errors: 0,
            skipped_records: 0,
            sync_rounds: 0,
            sync_failures: 0,
            provenance_records: 0,
            provenance_failures: 0,
            degraded: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Drives one rank's trace through reconstruction, detection and sync.
pub struct Driver<S> {
    config: DriverConfig,
    source: S,
    store: EventStore,
    detector: OutlierDetector,
    client: Option<PsClient>,
    provenance: Option<ProvenanceWriter>,
    /// Local function id → global index.
    global_ids: HashMap<FunctionId, FunctionId>,
    counter_stats: BTreeMap<String, RunningStats>,
    pending: VecDeque<AnomalyStatsReport>,
    steps_since_sync: u64,
    outliers_since_sync: u64,
    report: DriverReport,
}

impl<S: EventSource> Driver<S> {
    pub fn new(config: DriverConfig, source: S) -> DriverResult<Self> {
        config.validate()?;
        let detector = OutlierDetector::new(config.detector.clone())?;
        let report = DriverReport::new(config.program, config.rank);
        Ok(Self {
            config,
            source,
            store: EventStore::new(),
            detector,
            client: None,
            provenance: None,
            global_ids: HashMap::new(),
            counter_stats: BTreeMap::new(),
            pending: VecDeque::new(),
            steps_since_sync: 0,
            outliers_since_sync: 0,
            report,
        })
    }

    pub fn with_client(mut self, client: PsClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_provenance(mut self, writer: ProvenanceWriter) -> Self {
        self.provenance = Some(writer);
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn detector(&self) -> &OutlierDetector {
        &self.detector
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn report(&self) -> &DriverReport {
        &self.report
    }

    /// Global index assigned to a local function id, once known.
    pub fn global_id(&self, fid: FunctionId) -> Option<FunctionId> {
        self.global_ids.get(&fid).copied()
    }

    /// Whether the driver is running without a parameter server.
    pub fn is_degraded(&self) -> bool {
        self.client.is_none()
    }

    /// Process steps until the source ends or stays idle for
    /// `max_idle_polls` consecutive polls. Per-event errors are counted;
    /// only source and sink failures abort the run.
    pub async fn run(&mut self) -> DriverResult<DriverReport> {
        if self.client.is_none() {
            self.report.degraded = true;
            info!(rank = self.config.rank, "no parameter server, using the local model only");
        }
        info!(
            run_id = %self.report.run_id,
            program = self.config.program,
            rank = self.config.rank,
            sigma = self.config.detector.sigma,
            "analysis started"
        );

        let mut idle = 0u32;
        loop {
            match self.source.begin_step().await? {
                SourceStatus::Ready(step) => {
                    idle = 0;
                    self.process_step(step).await?;
                }
                SourceStatus::NotReady => {
                    idle += 1;
                    if idle >= self.config.max_idle_polls {
                        warn!(polls = idle, "event source idle, stopping");
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.idle_poll_ms)).await;
                }
                SourceStatus::EndOfStream => {
                    debug!("end of event stream");
                    break;
                }
            }
        }

        if self.steps_since_sync > 0 || !self.detector.local_delta().is_empty() {
            self.sync().await;
        }
        if let Some(writer) = self.provenance.take() {
            let stats = writer.close().await?;
            self.report.provenance_failures += stats.failed;
        }
        self.report.skipped_records = self.source.skipped();
        self.report.finished_at = Some(Utc::now());

        info!(
            steps = self.report.steps,
            events = self.report.events,
            calls = self.report.calls,
            outliers = self.report.outliers,
            event_errors = self.report.event_errors,
            sync_rounds = self.report.sync_rounds,
            sync_failures = self.report.sync_failures,
            "analysis finished"
        );
        Ok(self.report.clone())
    }

    async fn process_step(&mut self, step: u64) -> DriverResult<()> {
        self.register_names();
        let events = self.source.events().await?;
        let dropped = self.ingest(&events);
        self.source.end_step().await?;

        let mut batch = self.store.flush();
        let anomalies = self.detector.run_batch(step, &mut batch);
        self.accumulate_counters(&batch);
        self.emit_provenance(step, &batch, &anomalies).await;

        let outliers = anomalies.outlier_count() as u64;
        self.report.steps += 1;
        self.report.calls += batch.len() as u64;
        self.report.outliers += outliers;
        self.steps_since_sync += 1;
        self.outliers_since_sync += outliers;
        if self.client.is_some() {
            self.pending.push_back(AnomalyStatsReport {
                pid: self.config.program,
                rid: self.config.rank,
                step,
                calls: anomalies.call_count(),
                outliers,
                first_entry: anomalies.first_entry,
                last_exit: anomalies.last_exit,
            });
        }

        if dropped > 0 {
            warn!(step, dropped, "events dropped by the event store");
        }
        debug!(
            step,
            events = events.len(),
            calls = batch.len(),
            outliers,
            open = self.store.open_calls(),
            "step processed"
        );

        if self.sync_due() {
            self.sync().await;
        }
        Ok(())
    }

    fn register_names(&mut self) {
        for (fid, name) in self.source.function_names() {
            if self.store.function_names().get(fid) != Some(name) {
                self.store.register_function(*fid, name.clone());
            }
        }
        for (counter_id, name) in self.source.counter_names() {
            self.store.register_counter(*counter_id, name.clone());
        }
    }

    /// Feed events to the store; returns how many were dropped.
    fn ingest(&mut self, events: &[Event]) -> u64 {
        let mut dropped = 0;
        for event in events {
            self.report.events += 1;
            if let Err(e) = self.store.add_event(event) {
                dropped += 1;
                debug!(error = %e, "event dropped");
            }
        }
        self.report.event_errors += dropped;
        dropped
    }

    fn accumulate_counters(&mut self, batch: &CallBatch) {
        for call in batch.iter() {
            for sample in &call.counters {
                self.counter_stats
                    .entry(sample.name.clone())
                    .or_default()
                    .push(sample.value as f64);
            }
        }
    }

    async fn emit_provenance(&mut self, step: u64, batch: &CallBatch, anomalies: &StepAnomalies) {
        if self.provenance.is_none() {
            return;
        }
        let mut records = Vec::new();
        for id in &anomalies.outliers {
            let Some(call) = batch.get(id) else {
                continue;
            };
            let mut record =
                ProvenanceRecord::from_call(step, call, self.detector.function_stats(call.fid));
            if self.config.provenance_window > 0 {
                match batch.calls_around(id, self.config.provenance_window) {
                    Ok(window) => record = record.with_window(window),
                    Err(e) => debug!(call = %id, error = %e, "no event window"),
                }
            }
            records.push(record);
        }
        for call in prune_normals(batch.iter(), self.config.record_normals) {
            records.push(ProvenanceRecord::from_call(
                step,
                call,
                self.detector.function_stats(call.fid),
            ));
        }

        let count = records.len() as u64;
        if let Some(writer) = self.provenance.as_ref() {
            match writer.submit(records).await {
                Ok(()) => self.report.provenance_records += count,
                Err(e) => {
                    self.report.provenance_failures += count;
                    warn!(step, records = count, error = %e, "provenance not queued");
                }
            }
        }
    }

    fn sync_due(&self) -> bool {
        let by_steps = self.config.sync_every_steps > 0
            && self.steps_since_sync >= self.config.sync_every_steps;
        let by_outliers = self.config.sync_every_outliers > 0
            && self.outliers_since_sync >= self.config.sync_every_outliers;
        by_steps || by_outliers
    }

    /// One sync round. Never fails the run: a lost connection switches to
    /// local-only mode, any other error is retried at the next round.
    async fn sync(&mut self) {
        self.steps_since_sync = 0;
        self.outliers_since_sync = 0;
        let Some(mut client) = self.client.take() else {
            return;
        };

        match self.sync_with(&mut client).await {
            Ok(functions) => {
                self.report.sync_rounds += 1;
                self.client = Some(client);
                debug!(round = self.report.sync_rounds, functions, "synced with parameter server");
            }
            Err(e) if e.is_connection_error() => {
                self.report.sync_failures += 1;
                self.report.degraded = true;
                self.pending.clear();
                warn!(error = %e, "parameter server unreachable, continuing with the local model");
            }
            Err(e) => {
                self.report.sync_failures += 1;
                self.client = Some(client);
                warn!(error = %e, "sync failed, will retry");
            }
        }
    }

    async fn sync_with(&mut self, client: &mut PsClient) -> SyncResult<usize> {
        self.resolve_global_ids(client).await?;

        let delta = self.detector.local_delta().remap(&self.global_ids);
        let global = client.update_params(&delta).await?;
        let to_local: HashMap<FunctionId, FunctionId> =
            self.global_ids.iter().map(|(local, global)| (*global, *local)).collect();
        self.detector.sync_param(&global.remap(&to_local));

        let metrics = self.detector.metrics().remap(&self.global_ids);
        while self.pending.len() > 1 {
            if let Some(report) = self.pending.front() {
                client.update_anomaly_stats(report).await?;
            }
            self.pending.pop_front();
        }
        match self.pending.front() {
            Some(anomaly) => {
                let combined = CombinedReport {
                    anomaly: anomaly.clone(),
                    counters: CounterStatsReport {
                        pid: self.config.program,
                        rid: self.config.rank,
                        step: anomaly.step,
                        counters: self.counter_stats.clone(),
                    },
                    metrics,
                };
                client.update_combined(&combined).await?;
            }
            None => {
                if !metrics.is_empty() {
                    client.update_anomaly_metrics(&metrics).await?;
                }
                if !self.counter_stats.is_empty() {
                    let step = self.report.steps.saturating_sub(1);
                    client
                        .update_counter_stats(step, self.counter_stats.clone())
                        .await?;
                }
            }
        }

        self.pending.clear();
        self.counter_stats.clear();
        let sent = &self.global_ids;
        self.detector.retain_metrics(|fid| !sent.contains_key(&fid));
        Ok(global.len())
    }

    /// Ask the server for the global index of every function this rank has
    /// statistics for and does not know the index of yet. Functions without
    /// a name are keyed by name on the server, so they wait for one.
    async fn resolve_global_ids(&mut self, client: &mut PsClient) -> SyncResult<()> {
        let mut missing: BTreeMap<FunctionId, String> = BTreeMap::new();
        let mut unnamed = BTreeSet::new();
        let known = self
            .detector
            .local_delta()
            .function_ids()
            .into_iter()
            .chain(self.detector.metrics().iter().map(|(fid, _)| fid));
        for fid in known {
            if self.global_ids.contains_key(&fid) || missing.contains_key(&fid) {
                continue;
            }
            match self.store.function_names().get(&fid) {
                Some(name) => {
                    missing.insert(fid, name.clone());
                }
                None => {
                    unnamed.insert(fid);
                }
            }
        }
        if !unnamed.is_empty() {
            debug!(functions = unnamed.len(), "unnamed functions kept local until named");
        }
        if missing.is_empty() {
            return Ok(());
        }
        let resolved = client.lookup_function_indices(&missing).await?;
        debug!(functions = resolved.len(), "global function indices resolved");
        self.global_ids.extend(resolved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::source::VecSource;
    use insitu_types::{CallLabel, ThreadKey};

    fn t() -> ThreadKey {
        ThreadKey::new(0, 0, 0)
    }

    /// Back-to-back calls of `fid` with the given runtimes, starting at `start`.
    fn calls(fid: FunctionId, runtimes: &[u64], start: u64) -> Vec<Event> {
        let mut ts = start;
        let mut events = Vec::new();
        for r in runtimes {
            events.push(Event::entry(t(), fid, ts));
            events.push(Event::exit(t(), fid, ts + r));
            ts += r + 1;
        }
        events
    }

    #[tokio::test]
    async fn scenario_flags_the_last_call() {
        let source = VecSource::new([calls(1, &[10, 10, 10, 10, 10, 12, 10, 10, 10, 50], 0)])
            .with_function(1, "solve");
        let sink = MemorySink::new();
        let mut driver = Driver::new(DriverConfig::default(), source)
            .unwrap()
            .with_provenance(ProvenanceWriter::new(sink.clone(), 16).unwrap());

        let report = driver.run().await.unwrap();
        assert_eq!(report.steps, 1);
        assert_eq!(report.events, 20);
        assert_eq!(report.calls, 10);
        assert_eq!(report.outliers, 1);
        assert!(report.degraded);
        assert_eq!(report.sync_rounds, 0);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, CallLabel::Outlier);
        assert_eq!(records[0].runtime, 50);
        assert_eq!(records[0].func_name, "solve");
        assert!(!records[0].event_window.is_empty());
    }

    #[tokio::test]
    async fn bad_events_are_counted_and_skipped() {
        let mut events = vec![Event::exit(t(), 9, 0)];
        events.extend(calls(1, &[5, 5], 1));
        let mut driver = Driver::new(DriverConfig::default(), VecSource::new([events])).unwrap();

        let report = driver.run().await.unwrap();
        assert_eq!(report.event_errors, 1);
        assert_eq!(report.calls, 2);
        assert_eq!(driver.store().open_calls(), 0);
    }

    #[tokio::test]
    async fn calls_spanning_steps_complete_later() {
        let first = vec![Event::entry(t(), 1, 0), Event::entry(t(), 2, 1)];
        let second = vec![Event::exit(t(), 2, 5), Event::exit(t(), 1, 9)];
        let mut driver = Driver::new(DriverConfig::default(), VecSource::new([first, second])).unwrap();

        let report = driver.run().await.unwrap();
        assert_eq!(report.steps, 2);
        assert_eq!(report.calls, 2);
        assert_eq!(driver.detector().function_stats(1).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn stops_after_max_idle_polls() {
        let config = DriverConfig {
            max_idle_polls: 3,
            idle_poll_ms: 1,
            ..Default::default()
        };
        let mut source = VecSource::new([calls(1, &[3], 0)]).open_ended();
        source.push_not_ready();
        let mut driver = Driver::new(config, source).unwrap();

        let report = driver.run().await.unwrap();
        assert_eq!(report.steps, 1);
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn records_recent_normals_when_asked() {
        let config = DriverConfig {
            record_normals: 2,
            ..Default::default()
        };
        let sink = MemorySink::new();
        let source = VecSource::new([calls(1, &[4, 4, 4, 4], 0), calls(2, &[7], 100)]);
        let mut driver = Driver::new(config, source)
            .unwrap()
            .with_provenance(ProvenanceWriter::new(sink.clone(), 4).unwrap());

        let report = driver.run().await.unwrap();
        // two per function per step: 2 from step 0, 1 from step 1
        assert_eq!(report.provenance_records, 3);
        assert!(sink.records().iter().all(|r| r.label == CallLabel::Normal));
    }

    #[tokio::test]
    async fn counter_samples_accumulate_per_name() {
        let events = vec![
            Event::entry(t(), 1, 0),
            Event::counter(t(), 4, 100, 1),
            Event::counter(t(), 4, 300, 2),
            Event::exit(t(), 1, 3),
        ];
        let source = VecSource::new([events]).with_counter(4, "PAPI_TOT_CYC");
        let mut driver = Driver::new(DriverConfig::default(), source).unwrap();
        driver.run().await.unwrap();

        // no server: counters stay local
        let stats = &driver.counter_stats["PAPI_TOT_CYC"];
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.mean(), 200.0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = DriverConfig::default();
        config.detector.algorithm = "nope".into();
        assert!(Driver::new(config, VecSource::default()).is_err());
    }
}
