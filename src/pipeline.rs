//! Ingest Pipeline
//!
//! [`Engine`] is the single entry point that mutates session windows. Every
//! point goes through [`evaluate_point`]: detectors judge the point against
//! the pre-insertion window, the quorum rule decides, the window is updated,
//! and the result is handed to persistence without waiting on the store.

use crate::config::{EngineConfig, EnsembleConfig};
use crate::error::{EngineError, Result};
use crate::metrics::{
    ACTIVE_SESSIONS, ANOMALIES_TOTAL, DETECTION_LATENCY, POINTS_TOTAL, REJECTED_TOTAL,
};
use crate::persistence::PersistenceHandle;
use crate::pool::WorkerPool;
use crate::registry::{Registration, RegistryStats, SessionRegistry};
use crate::session::{Session, SessionSnapshot};
use crate::signal::{DataPoint, DetectionResult, PointPayload, PointVerdict, SessionInit};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Engine {
    config: EngineConfig,
    registry: SessionRegistry,
    pool: WorkerPool,
    persistence: Option<PersistenceHandle>,
}

impl Engine {
    /// Engine without a persistence collaborator.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::build(config, None)
    }

    pub fn with_persistence(config: EngineConfig, persistence: PersistenceHandle) -> Result<Self> {
        Self::build(config, Some(persistence))
    }

    fn build(config: EngineConfig, persistence: Option<PersistenceHandle>) -> Result<Self> {
        config.validate()?;
        crate::metrics::init();
        let pool = WorkerPool::new(config.worker_threads)?;
        Ok(Self {
            registry: SessionRegistry::new(config.registry_shards),
            pool,
            persistence,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Handles a session-initiation request with the engine's ensemble.
    pub fn open_session(&self, init: &SessionInit) -> Result<Registration> {
        let (client_id, window) = init.validate()?;
        self.open_session_with(&client_id, window, &self.config.ensemble)
    }

    /// Registers (or reactivates) a session with an explicit ensemble.
    pub fn open_session_with(
        &self,
        client_id: &str,
        window: usize,
        ensemble: &EnsembleConfig,
    ) -> Result<Registration> {
        let registration = self.registry.register(client_id, window, ensemble)?;
        ACTIVE_SESSIONS.inc();
        Ok(registration)
    }

    /// Deactivates a session. In-flight evaluations still complete.
    pub fn close_session(&self, client_id: &str) -> Result<bool> {
        let changed = self.registry.deactivate(client_id)?;
        if changed {
            ACTIVE_SESSIONS.dec();
        }
        Ok(changed)
    }

    pub fn lookup(&self, client_id: &str) -> Result<Arc<Session>> {
        self.registry.lookup(client_id)
    }

    pub fn snapshot(&self, client_id: &str) -> Result<SessionSnapshot> {
        Ok(self.registry.lookup(client_id)?.snapshot())
    }

    pub fn list_active(&self) -> BTreeSet<String> {
        self.registry.list_active()
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    // ------------------------------------------------------------------
    // Points
    // ------------------------------------------------------------------

    /// Looks up an active session, rejecting unknown and inactive ids.
    pub fn active_session(&self, client_id: &str) -> Result<Arc<Session>> {
        let session = self.registry.lookup(client_id).inspect_err(|_| {
            REJECTED_TOTAL.inc();
        })?;
        if !session.is_active() {
            REJECTED_TOTAL.inc();
            return Err(EngineError::SessionInactive(client_id.to_string()));
        }
        Ok(session)
    }

    /// Evaluates one point on the calling thread.
    pub fn ingest(&self, client_id: &str, point: DataPoint) -> Result<DetectionResult> {
        let session = self.active_session(client_id)?;
        Ok(evaluate_point(&session, point, self.persistence.as_ref()))
    }

    /// Validates a raw payload, evaluates it and returns the wire verdict.
    pub fn ingest_payload(&self, client_id: &str, payload: PointPayload) -> Result<PointVerdict> {
        let point = DataPoint::try_from(payload).inspect_err(|_| REJECTED_TOTAL.inc())?;
        self.ingest(client_id, point).map(|r| PointVerdict::from(&r))
    }

    /// Evaluates one point on the worker pool.
    pub async fn ingest_async(&self, client_id: &str, point: DataPoint) -> Result<DetectionResult> {
        let session = self.active_session(client_id)?;
        self.dispatch(session, point).await
    }

    /// Runs the evaluation for an already-admitted point on the pool.
    pub(crate) async fn dispatch(
        &self,
        session: Arc<Session>,
        point: DataPoint,
    ) -> Result<DetectionResult> {
        let persistence = self.persistence.clone();
        self.pool
            .run(move || evaluate_point(&session, point, persistence.as_ref()))
            .await
    }

    /// Stops the worker pool. Queued evaluations finish first.
    pub fn shutdown(&self) {
        info!(
            active = self.registry.list_active().len(),
            "Engine shutting down."
        );
        self.pool.shutdown();
    }
}

/// One point-arrival transition for `session`.
pub fn evaluate_point(
    session: &Session,
    point: DataPoint,
    persistence: Option<&PersistenceHandle>,
) -> DetectionResult {
    let timer = DETECTION_LATENCY.start_timer();
    let result = session.process(point);
    timer.observe_duration();

    POINTS_TOTAL.inc();
    if result.anomaly {
        ANOMALIES_TOTAL.inc();
        warn!(
            client_id = %session.client_id(),
            sequence = result.sequence,
            timestamp = result.timestamp,
            value = point.value,
            "Anomaly: {}",
            result.reason()
        );
    } else {
        debug!(
            client_id = %session.client_id(),
            sequence = result.sequence,
            timestamp = result.timestamp,
            abstained = result.tally.abstained,
            "Point normal."
        );
    }

    if let Some(handle) = persistence {
        handle.append(session.client_id(), point, &result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{HistoryStore, MemoryStore, PersistenceWriter};
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            worker_threads: 2,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_open_session_validates_request() {
        let engine = engine();
        assert!(matches!(
            engine.open_session(&SessionInit::new("", 5)),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.open_session(&SessionInit::new("c1", -3)),
            Err(EngineError::Validation(_))
        ));
        // A request must carry its own window
        let no_window = SessionInit {
            client_id: Some("c1".into()),
            window: None,
        };
        assert!(matches!(
            engine.open_session(&no_window),
            Err(EngineError::Validation(_))
        ));
        assert!(engine.list_active().is_empty());

        engine.open_session(&SessionInit::new("c1", 5)).unwrap();
        assert!(matches!(
            engine.open_session(&SessionInit::new("c1", 5)),
            Err(EngineError::DuplicateSession(_))
        ));
    }

    #[test]
    fn test_ingest_rejects_unknown_and_inactive() {
        let engine = engine();
        assert!(matches!(
            engine.ingest("nobody", DataPoint::new(0.0, 1.0)),
            Err(EngineError::NotFound(_))
        ));

        engine.open_session(&SessionInit::new("c1", 5)).unwrap();
        engine.ingest("c1", DataPoint::new(0.0, 1.0)).unwrap();
        assert!(engine.close_session("c1").unwrap());
        assert!(matches!(
            engine.ingest("c1", DataPoint::new(1.0, 1.0)),
            Err(EngineError::SessionInactive(_))
        ));
        // The rejected point did not reach the window
        assert_eq!(engine.snapshot("c1").unwrap().window_len, 1);
    }

    #[test]
    fn test_ingest_payload_rejects_malformed_point() {
        let engine = engine();
        engine.open_session(&SessionInit::new("c1", 5)).unwrap();
        let bad = PointPayload {
            timestamp: Some(1.0),
            value: None,
        };
        assert!(matches!(
            engine.ingest_payload("c1", bad),
            Err(EngineError::Validation(_))
        ));
        let verdict = engine
            .ingest_payload(
                "c1",
                PointPayload {
                    timestamp: Some(1.0),
                    value: Some(3.0),
                },
            )
            .unwrap();
        assert_eq!(verdict.timestamp, 1.0);
        assert!(!verdict.anomaly);
        assert_eq!(engine.snapshot("c1").unwrap().processed, 1);
    }

    #[tokio::test]
    async fn test_async_ingest_persists_results() {
        let store = Arc::new(MemoryStore::new());
        let (handle, writer) =
            PersistenceWriter::spawn(store.clone(), 64, Duration::from_millis(50)).unwrap();
        let engine = Engine::with_persistence(
            EngineConfig {
                worker_threads: 2,
                ..EngineConfig::default()
            },
            handle,
        )
        .unwrap();

        engine.open_session(&SessionInit::new("c1", 5)).unwrap();
        for i in 0..4 {
            let result = engine
                .ingest_async("c1", DataPoint::new(i as f64, 1.0))
                .await
                .unwrap();
            assert_eq!(result.sequence, i + 1);
        }

        engine.shutdown();
        drop(engine);
        writer.shutdown();

        let history = store.history("c1").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].point, DataPoint::new(3.0, 1.0));
    }
}
