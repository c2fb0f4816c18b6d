//! Real-time per-client anomaly detection.
//!
//! Each connected client owns a session with a bounded window of recent
//! points. Every new point is judged by a committee of detectors (Z-Score,
//! IQR, EWMA, Moving-Average, Isolation Forest) against the window as it
//! stood before the point arrived, and a quorum rule turns their votes into
//! one verdict.

pub mod aggregator;
pub mod algo;
pub mod config;
pub mod detector;
pub mod error;
pub mod flow;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod session;
pub mod signal;
pub mod transport;
pub mod window;

pub use aggregator::{QuorumRule, Tally, aggregate};
pub use config::{EngineConfig, EnsembleConfig};
pub use detector::{Detector, DetectorSet};
pub use error::{EngineError, PersistenceError};
pub use flow::{Admission, FlowOutput, IngestFlow};
pub use pipeline::Engine;
pub use registry::{Registration, SessionRegistry};
pub use session::{Phase, Session, SessionSnapshot};
pub use signal::{
    AbstainReason, DataPoint, DetectionResult, DetectorKind, PointPayload, PointVerdict,
    SessionInit, Vote, VoteOutcome,
};
pub use window::{Snapshot, Window};
