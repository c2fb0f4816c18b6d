//! Per-connection ingest flow.
//!
//! Each connection owns a bounded [`PointQueue`] and a task that drains it
//! one point at a time through the worker pool, so results come out in
//! submission order. When the queue is full the oldest point that has not
//! started evaluating is dropped and reported back to the submitter.

use crate::error::{EngineError, Result};
use crate::metrics::{BACKPRESSURE_DROPPED_TOTAL, REJECTED_TOTAL};
use crate::pipeline::Engine;
use crate::session::Session;
use crate::signal::{DataPoint, DetectionResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of [`IngestFlow::submit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Queued,
    /// The point was queued, but the queue was full and this older
    /// unprocessed point was discarded to make room.
    DroppedOldest(DataPoint),
}

/// What the flow task emits, one per dequeued point.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutput {
    Verdict(DetectionResult),
    Rejected { timestamp: f64, error: EngineError },
}

struct QueueState {
    points: VecDeque<DataPoint>,
    closed: bool,
}

/// Bounded FIFO with drop-oldest overflow.
pub struct PointQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PointQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                points: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, point: DataPoint) -> Admission {
        let admission = {
            let mut state = self.lock();
            let dropped = if state.points.len() >= self.capacity {
                state.points.pop_front()
            } else {
                None
            };
            state.points.push_back(point);
            match dropped {
                Some(old) => Admission::DroppedOldest(old),
                None => Admission::Queued,
            }
        };
        self.notify.notify_one();
        admission
    }

    /// Next point, or `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<DataPoint> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(point) = state.points.pop_front() {
                    return Some(point);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stops the consumer once the remaining points are drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Ordered, backpressured stream of points for one session.
pub struct IngestFlow {
    session: Arc<Session>,
    /// Activation period this flow belongs to
    lease: u64,
    queue: Arc<PointQueue>,
    task: JoinHandle<()>,
}

impl IngestFlow {
    /// Starts a flow for an active session. Must be called inside a tokio
    /// runtime. Outputs arrive on the returned receiver.
    pub fn start(
        engine: Arc<Engine>,
        client_id: &str,
    ) -> Result<(Self, mpsc::Receiver<FlowOutput>)> {
        let session = engine.active_session(client_id)?;
        let lease = session
            .lease()
            .ok_or_else(|| EngineError::SessionInactive(client_id.to_string()))?;
        let capacity = engine.config().queue_capacity;
        let queue = Arc::new(PointQueue::new(capacity));
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let task = tokio::spawn(run_flow(
            engine,
            Arc::clone(&session),
            lease,
            Arc::clone(&queue),
            tx,
        ));

        Ok((
            Self {
                session,
                lease,
                queue,
                task,
            },
            rx,
        ))
    }

    pub fn client_id(&self) -> &str {
        self.session.client_id()
    }

    /// Queues a point for evaluation.
    ///
    /// Fails with `SessionInactive` once the session has been deactivated,
    /// even if a later connection has since reactivated it.
    pub fn submit(&self, point: DataPoint) -> Result<Admission> {
        if !self.session.holds(self.lease) {
            REJECTED_TOTAL.inc();
            return Err(EngineError::SessionInactive(
                self.session.client_id().to_string(),
            ));
        }

        let admission = self.queue.push(point);
        if let Admission::DroppedOldest(dropped) = admission {
            BACKPRESSURE_DROPPED_TOTAL.inc();
            warn!(
                client_id = %self.session.client_id(),
                dropped = dropped.timestamp,
                capacity = self.queue.capacity(),
                "Session queue full, dropped oldest unprocessed point."
            );
        }
        Ok(admission)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Closes the queue and waits for the task to work through what is left.
    pub async fn finish(self) {
        self.queue.close();
        if let Err(e) = self.task.await {
            warn!(client_id = %self.session.client_id(), error = %e, "Ingest flow task failed.");
        }
    }

    /// Closes the queue without waiting for the task.
    pub fn close(&self) {
        self.queue.close();
    }
}

async fn run_flow(
    engine: Arc<Engine>,
    session: Arc<Session>,
    lease: u64,
    queue: Arc<PointQueue>,
    tx: mpsc::Sender<FlowOutput>,
) {
    debug!(client_id = %session.client_id(), "Ingest flow started.");

    while let Some(point) = queue.pop().await {
        // Points left over from an earlier activation never reach the window
        let output = if session.holds(lease) {
            match engine.dispatch(Arc::clone(&session), point).await {
                Ok(result) => FlowOutput::Verdict(result),
                Err(error) => FlowOutput::Rejected {
                    timestamp: point.timestamp,
                    error,
                },
            }
        } else {
            REJECTED_TOTAL.inc();
            FlowOutput::Rejected {
                timestamp: point.timestamp,
                error: EngineError::SessionInactive(session.client_id().to_string()),
            }
        };

        if tx.send(output).await.is_err() {
            break;
        }
    }

    debug!(client_id = %session.client_id(), "Ingest flow stopped.");
}
