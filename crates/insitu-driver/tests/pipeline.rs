//! Driver runs against in-memory and file sources, with and without a live
//! parameter server.

use std::net::SocketAddr;
use std::sync::Arc;

use insitu_driver::{
    Driver, DriverConfig, JsonLinesSink, JsonLinesSource, MemorySink, ProvenanceWriter, VecSource,
};
use insitu_detect::ProvenanceRecord;
use insitu_sync::{ClientConfig, NetServer, PsClient, PsState, ServerConfig, ShutdownHandle, SyncResult};
use insitu_types::{CallLabel, Event, FunctionId, ThreadKey};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Running {
    addr: SocketAddr,
    state: Arc<PsState>,
    shutdown: ShutdownHandle,
    task: JoinHandle<SyncResult<()>>,
}

async fn start_server() -> Running {
    start_server_with(ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        workers: 2,
        ..Default::default()
    })
    .await
}

async fn start_server_with(config: ServerConfig) -> Running {
    let server = NetServer::bind(config, Arc::new(PsState::new())).await.unwrap();
    Running {
        addr: server.local_addr().unwrap(),
        state: server.state(),
        shutdown: server.shutdown_handle(),
        task: tokio::spawn(server.run()),
    }
}

async fn client(addr: SocketAddr, rank: u32) -> PsClient {
    let config = ClientConfig {
        pid: 0,
        rank,
        timeout_secs: 5,
        ..Default::default()
    };
    PsClient::connect(addr, config).await.unwrap()
}

fn thread(rank: u32) -> ThreadKey {
    ThreadKey::new(0, rank, 0)
}

fn calls(rank: u32, fid: FunctionId, runtimes: &[u64], start: u64) -> Vec<Event> {
    let mut ts = start;
    let mut events = Vec::new();
    for r in runtimes {
        events.push(Event::entry(thread(rank), fid, ts));
        events.push(Event::exit(thread(rank), fid, ts + r));
        ts += r + 1;
    }
    events
}

fn rank_config(rank: u32) -> DriverConfig {
    DriverConfig {
        rank,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_ranks_share_one_global_model() {
    let server = start_server().await;

    // same function, different local ids on each rank
    let source_a = VecSource::new([calls(0, 10, &[1, 2, 3], 0)]).with_function(10, "solve");
    let mut a = Driver::new(rank_config(0), source_a)
        .unwrap()
        .with_client(client(server.addr, 0).await);
    let report_a = a.run().await.unwrap();
    assert_eq!(report_a.sync_rounds, 1);
    assert!(!report_a.degraded);

    let source_b = VecSource::new([calls(1, 20, &[4, 5, 6], 0)]).with_function(20, "solve");
    let mut b = Driver::new(rank_config(1), source_b)
        .unwrap()
        .with_client(client(server.addr, 1).await);
    b.run().await.unwrap();

    let global_id = server.state.functions.get(0, "solve").unwrap().unwrap();
    assert_eq!(a.global_id(10), Some(global_id));
    assert_eq!(b.global_id(20), Some(global_id));

    let global = server.state.params.snapshot().unwrap();
    let stats = global.get(global_id).unwrap();
    assert_eq!(stats.count(), 6);
    assert!((stats.mean() - 3.5).abs() < 1e-12);

    // rank 1 scores against the merged model under its own local id
    let adopted = b.detector().function_stats(20).unwrap();
    assert_eq!(adopted.count(), 6);
    assert!(b.detector().local_delta().is_empty());

    let metrics = server.state.anomalies.function(0, global_id).unwrap().unwrap();
    assert_eq!(metrics.calls, 6);

    server.shutdown.shutdown();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn every_step_reaches_the_server_at_the_configured_cadence() {
    let server = start_server().await;
    let steps: Vec<Vec<Event>> = (0..4u64)
        .map(|i| calls(0, 1, &[5, 5, 5], i * 100))
        .collect();
    let config = DriverConfig {
        sync_every_steps: 2,
        ..Default::default()
    };
    let mut driver = Driver::new(config, VecSource::new(steps).with_function(1, "step"))
        .unwrap()
        .with_client(client(server.addr, 0).await);

    let report = driver.run().await.unwrap();
    assert_eq!(report.steps, 4);
    assert_eq!(report.sync_rounds, 2);

    let rank = server.state.anomalies.rank(0, 0).unwrap().unwrap();
    assert_eq!(rank.steps, 4);
    assert_eq!(rank.total_calls, 12);
    assert_eq!(rank.last_step, Some(3));

    server.shutdown.shutdown();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn slow_rank_keeps_its_connection_between_syncs() {
    let server = start_server_with(ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        workers: 2,
        read_timeout_secs: 1,
        ..Default::default()
    })
    .await;

    let mut source = VecSource::new([calls(0, 1, &[5, 5, 5], 0)]).with_function(1, "step");
    for _ in 0..3 {
        source.push_not_ready();
    }
    source.push_step(calls(0, 1, &[5, 5, 5], 1000));
    let config = DriverConfig {
        idle_poll_ms: 600,
        ..Default::default()
    };
    let mut driver = Driver::new(config, source)
        .unwrap()
        .with_client(client(server.addr, 0).await);

    let report = driver.run().await.unwrap();
    assert_eq!(report.steps, 2);
    assert_eq!(report.sync_failures, 0);
    assert_eq!(report.sync_rounds, 2);
    assert!(!report.degraded);

    server.shutdown.shutdown();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn function_named_late_is_registered_under_its_name() {
    let server = start_server().await;

    let mut lines = vec![r#"{"step": 0}"#.to_string()];
    lines.extend(calls(0, 30, &[4, 4, 4], 0).iter().map(|e| serde_json::to_string(e).unwrap()));
    lines.push(r#"{"step": 1}"#.to_string());
    lines.push(r#"{"fid": 30, "name": "halo_exchange"}"#.to_string());
    lines.extend(calls(0, 30, &[4, 4, 4], 100).iter().map(|e| serde_json::to_string(e).unwrap()));
    let text = lines.join("\n");

    let mut driver = Driver::new(DriverConfig::default(), JsonLinesSource::from_reader(text.as_bytes()))
        .unwrap()
        .with_client(client(server.addr, 0).await);
    let report = driver.run().await.unwrap();
    assert_eq!(report.steps, 2);
    assert_eq!(report.sync_failures, 0);

    let functions = &server.state.functions;
    assert_eq!(functions.len().unwrap(), 1);
    let global_id = functions.get(0, "halo_exchange").unwrap().unwrap();
    assert_eq!(driver.global_id(30), Some(global_id));

    // nothing from the unnamed step was lost
    let stats = server.state.params.snapshot().unwrap();
    assert_eq!(stats.get(global_id).unwrap().count(), 6);
    let metrics = server.state.anomalies.function(0, global_id).unwrap().unwrap();
    assert_eq!(metrics.calls, 6);
    assert!(driver.detector().local_delta().is_empty());

    server.shutdown.shutdown();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn lost_server_falls_back_to_local_model() {
    let server = start_server().await;
    let doomed = client(server.addr, 0).await;
    client(server.addr, 9).await.send_quit().await.unwrap();
    server.task.await.unwrap().unwrap();

    let source = VecSource::new([calls(0, 1, &[10, 10, 10, 10, 10, 12, 10, 10, 10, 50], 0)]);
    let mut driver = Driver::new(DriverConfig::default(), source)
        .unwrap()
        .with_client(doomed);

    let report = driver.run().await.unwrap();
    assert_eq!(report.outliers, 1);
    assert_eq!(report.sync_rounds, 0);
    assert_eq!(report.sync_failures, 1);
    assert!(report.degraded);
    assert!(driver.is_degraded());
    // the unsent delta is kept for scoring
    assert_eq!(driver.detector().local_delta().get(1).unwrap().count(), 10);
}

#[tokio::test]
async fn injected_spikes_are_the_only_outliers() {
    let mut rng = StdRng::seed_from_u64(7);
    let spikes = [60usize, 120, 180];
    let runtimes: Vec<u64> = (0..200)
        .map(|i| if spikes.contains(&i) { 1000 } else { rng.gen_range(95..=105) })
        .collect();
    let steps: Vec<Vec<Event>> = runtimes
        .chunks(20)
        .enumerate()
        .map(|(i, chunk)| calls(0, 3, chunk, i as u64 * 100_000))
        .collect();

    let mut config = DriverConfig::default();
    config.detector.min_samples = 30;
    config.detector.sigma = 4.0;
    let sink = MemorySink::new();
    let mut driver = Driver::new(config, VecSource::new(steps))
        .unwrap()
        .with_provenance(ProvenanceWriter::new(sink.clone(), 16).unwrap());

    let report = driver.run().await.unwrap();
    assert_eq!(report.steps, 10);
    assert_eq!(report.outliers, 3);
    let records = sink.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.runtime == 1000 && r.severity > 0.0));
}

#[tokio::test]
async fn json_trace_to_json_provenance() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("rank0.jsonl");
    let out = dir.path().join("provenance.jsonl");

    let mut lines = vec![r#"{"fid": 1, "name": "compute"}"#.to_string()];
    for (step, chunk) in [[10u64, 10, 10, 10, 10], [12, 10, 10, 10, 50]].iter().enumerate() {
        lines.push(format!(r#"{{"step": {step}}}"#));
        for event in calls(0, 1, chunk, step as u64 * 1000) {
            lines.push(serde_json::to_string(&event).unwrap());
        }
    }
    lines.push("{broken".to_string());
    std::fs::write(&trace, lines.join("\n")).unwrap();

    let source = JsonLinesSource::open(&trace).await.unwrap();
    let writer = ProvenanceWriter::new(JsonLinesSink::create(&out).unwrap(), 8).unwrap();
    let mut driver = Driver::new(DriverConfig::default(), source)
        .unwrap()
        .with_provenance(writer);

    let report = driver.run().await.unwrap();
    assert_eq!(report.steps, 2);
    assert_eq!(report.outliers, 1);
    assert_eq!(report.skipped_records, 1);

    let text = std::fs::read_to_string(&out).unwrap();
    let records: Vec<ProvenanceRecord> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].label, CallLabel::Outlier);
    assert_eq!(records[0].func_name, "compute");
    assert_eq!(records[0].step, 1);
}
