//! End-to-end detection scenarios through the synchronous engine API.

use quorum_core::config::{EngineConfig, EnsembleConfig};
use quorum_core::error::PersistenceError;
use quorum_core::persistence::{HistoryStore, MemoryStore, PersistedRecord, PersistenceWriter};
use quorum_core::{
    AbstainReason, DataPoint, DetectionResult, DetectorKind, Engine, EngineError, Phase,
    QuorumRule, SessionInit, VoteOutcome,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn new_engine() -> Engine {
    Engine::new(EngineConfig {
        worker_threads: 2,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn feed(engine: &Engine, client_id: &str, values: &[f64]) -> Vec<DetectionResult> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| engine.ingest(client_id, DataPoint::new(i as f64, *v)).unwrap())
        .collect()
}

/// Deterministic low-amplitude signal around 51.5.
fn steady(n: usize) -> Vec<f64> {
    (0..n).map(|i| 50.0 + ((i * 37) % 11) as f64 * 0.3).collect()
}

#[test]
fn boundary_constant_window_stays_normal() {
    let engine = new_engine();
    engine.open_session(&SessionInit::new("c1", 5)).unwrap();

    let results = feed(&engine, "c1", &[10.0; 6]);
    let last = results.last().unwrap();

    assert!(!last.anomaly);
    for kind in [DetectorKind::ZScore, DetectorKind::MovingAverage] {
        let vote = last.vote_of(kind).unwrap();
        assert!(
            matches!(
                vote.outcome,
                VoteOutcome::Normal | VoteOutcome::Abstain(AbstainReason::ZeroSpread)
            ),
            "{:?} voted {:?}",
            kind,
            vote.outcome
        );
    }
    assert!(results.iter().all(|r| !r.anomaly));
}

#[test]
fn spike_after_constant_window_is_anomalous() {
    let engine = new_engine();
    engine.open_session(&SessionInit::new("c1", 5)).unwrap();

    let results = feed(&engine, "c1", &[1.0, 1.0, 1.0, 1.0, 1.0, 100.0]);
    let spike = &results[5];

    assert_eq!(
        spike.vote_of(DetectorKind::ZScore).unwrap().outcome,
        VoteOutcome::Anomalous
    );
    assert_eq!(
        spike.vote_of(DetectorKind::Iqr).unwrap().outcome,
        VoteOutcome::Anomalous
    );
    // Six samples is below the forest's minimum
    assert_eq!(
        spike.vote_of(DetectorKind::IsolationForest).unwrap().outcome,
        VoteOutcome::Abstain(AbstainReason::InsufficientSamples)
    );
    assert!(spike.anomaly);
    assert_eq!(spike.timestamp, 5.0);
    assert!(spike.reason().contains("z_score"));
}

#[test]
fn deactivated_session_rejects_points() {
    let engine = new_engine();
    engine.open_session(&SessionInit::new("c1", 5)).unwrap();
    feed(&engine, "c1", &[1.0, 2.0, 3.0]);

    assert!(engine.close_session("c1").unwrap());
    assert!(!engine.close_session("c1").unwrap());

    let err = engine.ingest("c1", DataPoint::new(9.0, 4.0)).unwrap_err();
    assert_eq!(err, EngineError::SessionInactive("c1".into()));
    assert_eq!(engine.snapshot("c1").unwrap().phase, Phase::Inactive);
    assert!(engine.list_active().is_empty());
}

#[test]
fn replay_with_same_seed_is_identical() {
    let mut ensemble = EnsembleConfig::default();
    ensemble.isolation_forest.seed = Some(42);

    let engine = new_engine();
    engine.open_session_with("a", 20, &ensemble).unwrap();
    engine.open_session_with("b", 20, &ensemble).unwrap();

    let mut values = steady(40);
    values[10] = 400.0;
    values[35] = -80.0;

    let a = feed(&engine, "a", &values);
    let b = feed(&engine, "b", &values);
    assert_eq!(a, b);
    assert!(a[10].anomaly);
    assert!(a[35].anomaly);
}

#[test]
fn interleaved_sessions_do_not_leak() {
    let engine = new_engine();
    engine.open_session(&SessionInit::new("quiet", 8)).unwrap();
    engine.open_session(&SessionInit::new("noisy", 8)).unwrap();

    let mut quiet = Vec::new();
    for i in 0..20 {
        quiet.push(
            engine
                .ingest("quiet", DataPoint::new(i as f64, 5.0))
                .unwrap(),
        );
        engine
            .ingest("noisy", DataPoint::new(i as f64, (i * i) as f64 * 100.0))
            .unwrap();
    }

    assert_eq!(engine.lookup("quiet").unwrap().window_values(), vec![5.0; 8]);
    assert!(quiet.iter().all(|r| !r.anomaly));

    // Same verdicts as a session that never shared the engine
    let alone = new_engine();
    alone.open_session(&SessionInit::new("quiet", 8)).unwrap();
    let solo = feed(&alone, "quiet", &[5.0; 20]);
    let strip = |rs: &[DetectionResult]| -> Vec<(bool, Vec<VoteOutcome>)> {
        rs.iter()
            .map(|r| (r.anomaly, r.votes.iter().map(|v| v.outcome).collect()))
            .collect()
    };
    assert_eq!(strip(&quiet), strip(&solo));
}

#[test]
fn cold_start_is_normal() {
    let engine = new_engine();
    engine.open_session(&SessionInit::new("c1", 50)).unwrap();

    let results = feed(&engine, "c1", &[1.0, 1_000_000.0]);
    for result in &results {
        assert!(!result.anomaly);
        assert_eq!(result.tally.voting(), 0);
        assert_eq!(result.tally.abstained, 5);
    }
    assert_eq!(engine.snapshot("c1").unwrap().phase, Phase::Warming);
}

#[test]
fn isolation_forest_flags_clear_spike_across_seeds() {
    let mut flagged_centre = 0;
    for seed in 0..10 {
        let mut ensemble = EnsembleConfig::with_detectors([DetectorKind::IsolationForest]);
        ensemble.isolation_forest.seed = Some(seed);
        ensemble.isolation_forest.num_trees = 50;

        let engine = new_engine();
        engine.open_session_with("c1", 60, &ensemble).unwrap();
        feed(&engine, "c1", &steady(60));

        let spike = engine.ingest("c1", DataPoint::new(60.0, 1_000.0)).unwrap();
        assert!(spike.anomaly, "seed {} missed the spike", seed);

        let centre = engine.ingest("c1", DataPoint::new(61.0, 51.5)).unwrap();
        if centre.anomaly {
            flagged_centre += 1;
        }
    }
    assert!(flagged_centre <= 2, "centre flagged {} times", flagged_centre);
}

#[test]
fn extreme_finite_values_never_wedge_a_session() {
    let engine = new_engine();
    engine.open_session(&SessionInit::new("c1", 20)).unwrap();

    let values: Vec<f64> = (0..15)
        .map(|i| if i % 2 == 0 { 1e308 } else { -1e308 })
        .collect();
    let results = feed(&engine, "c1", &values);
    assert_eq!(results.len(), 15);
    assert_eq!(engine.snapshot("c1").unwrap().window_len, 15);

    let last = &results[14];
    assert!(matches!(
        last.vote_of(DetectorKind::ZScore).unwrap().outcome,
        VoteOutcome::Abstain(AbstainReason::NonFinite)
    ));
    assert_ne!(
        last.vote_of(DetectorKind::IsolationForest).unwrap().outcome,
        VoteOutcome::Abstain(AbstainReason::InsufficientSamples)
    );

    let next = engine.ingest("c1", DataPoint::new(15.0, 1.0)).unwrap();
    assert_eq!(next.sequence, 16);
    assert_eq!(engine.snapshot("c1").unwrap().window_len, 16);
}

#[test]
fn reconnect_resumes_with_existing_window() {
    let engine = new_engine();
    engine.open_session(&SessionInit::new("c1", 5)).unwrap();
    feed(&engine, "c1", &[1.0; 5]);
    engine.close_session("c1").unwrap();

    // The new window size is ignored on reactivation
    let registration = engine.open_session(&SessionInit::new("c1", 50)).unwrap();
    assert!(registration.is_reactivation());
    let snapshot = engine.snapshot("c1").unwrap();
    assert_eq!(snapshot.window_capacity, 5);
    assert_eq!(snapshot.phase, Phase::Active);

    let spike = engine.ingest("c1", DataPoint::new(5.0, 100.0)).unwrap();
    assert!(spike.anomaly);
    assert_eq!(spike.sequence, 6);
}

#[test]
fn fraction_quorum_flags_minority_vote() {
    let mut ensemble = EnsembleConfig::with_detectors([
        DetectorKind::ZScore,
        DetectorKind::Iqr,
        DetectorKind::Ewma,
        DetectorKind::MovingAverage,
    ]);
    ensemble.zscore.threshold = 1.0;
    ensemble.quorum = QuorumRule::Fraction { threshold: 0.25 };

    let engine = new_engine();
    engine.open_session_with("c1", 10, &ensemble).unwrap();
    let values = [10.0, 12.0, 10.0, 12.0, 10.0, 12.0, 10.0, 12.0, 10.0, 12.0];
    feed(&engine, "c1", &values);

    // |13.5 - 11| / 1.05 > 1 but within every other detector's bounds
    let result = engine.ingest("c1", DataPoint::new(10.0, 13.5)).unwrap();
    assert_eq!(result.tally.anomalous, 1);
    assert_eq!(result.tally.normal, 3);
    assert!(result.anomaly);
}

#[test]
fn results_are_handed_to_persistence_in_order() {
    let store = Arc::new(MemoryStore::new());
    let (handle, writer) =
        PersistenceWriter::spawn(store.clone(), 128, Duration::from_millis(50)).unwrap();
    let engine = Engine::with_persistence(
        EngineConfig {
            worker_threads: 1,
            ..EngineConfig::default()
        },
        handle,
    )
    .unwrap();

    engine.open_session(&SessionInit::new("c1", 5)).unwrap();
    feed(&engine, "c1", &[1.0, 1.0, 1.0, 1.0, 1.0, 100.0]);
    drop(engine);
    writer.shutdown();

    let history = store.history("c1").unwrap();
    let sequences: Vec<u64> = history.iter().map(|r| r.result.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    assert!(history[5].result.anomaly);
    assert_eq!(history[5].point.value, 100.0);
}

/// Store whose writes hang until the release channel is dropped.
struct StalledStore {
    release: crossbeam_channel::Receiver<()>,
    inner: MemoryStore,
}

impl HistoryStore for StalledStore {
    fn append(&self, record: &PersistedRecord) -> Result<(), PersistenceError> {
        let _ = self.release.recv();
        self.inner.append(record)
    }

    fn history(&self, client_id: &str) -> Result<Vec<PersistedRecord>, PersistenceError> {
        self.inner.history(client_id)
    }
}

#[test]
fn stalled_store_delays_ingest_by_at_most_the_timeout() {
    let (release, gate) = crossbeam_channel::bounded::<()>(0);
    let store = Arc::new(StalledStore {
        release: gate,
        inner: MemoryStore::new(),
    });
    let timeout = Duration::from_millis(20);
    let (handle, writer) = PersistenceWriter::spawn(store.clone(), 1, timeout).unwrap();
    let engine = Engine::with_persistence(
        EngineConfig {
            worker_threads: 1,
            ..EngineConfig::default()
        },
        handle.clone(),
    )
    .unwrap();
    engine.open_session(&SessionInit::new("c1", 5)).unwrap();

    // The writer holds at most one record and the channel one more
    let mut slowest = Duration::ZERO;
    let mut last = None;
    for i in 0..6 {
        let started = Instant::now();
        let result = engine.ingest("c1", DataPoint::new(i as f64, 1.0)).unwrap();
        slowest = slowest.max(started.elapsed());
        assert_eq!(result.sequence, i as u64 + 1);
        last = Some(result);
    }
    assert!(slowest >= timeout, "no ingest waited on the full queue");
    assert!(slowest < Duration::from_secs(2), "ingest blocked for {:?}", slowest);

    let result = last.unwrap();
    let started = Instant::now();
    assert!(!handle.append("c1", DataPoint::new(5.0, 1.0), &result));
    let waited = started.elapsed();
    assert!(waited >= timeout && waited < Duration::from_secs(2), "waited {:?}", waited);

    drop(release);
    drop(engine);
    drop(handle);
    writer.shutdown();
    let stored = store.history("c1").unwrap().len();
    assert!((1..=2).contains(&stored), "stored {}", stored);
}
