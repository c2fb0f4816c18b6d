//! Bounded FIFO window of recent points, one per session.

use crate::error::EngineError;
use crate::signal::DataPoint;
use std::collections::VecDeque;

/// Per-session sliding window. Inserting into a full window evicts the
/// oldest point; points stay in arrival order.
#[derive(Debug, Clone)]
pub struct Window {
    capacity: usize,
    points: VecDeque<DataPoint>,
}

impl Window {
    pub fn new(capacity: usize) -> Result<Self, EngineError> {
        if capacity == 0 {
            return Err(EngineError::Configuration(
                "window capacity must be a positive integer".into(),
            ));
        }
        Ok(Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        })
    }

    /// Appends `point`, returning the evicted point when the window was full.
    pub fn push(&mut self, point: DataPoint) -> Option<DataPoint> {
        let evicted = if self.points.len() == self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    /// Read-only view in arrival order.
    pub fn snapshot(&self) -> Snapshot<'_> {
        let (head, tail) = self.points.as_slices();
        Snapshot { head, tail }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() == self.capacity
    }
}

/// Borrowed, ordered view over a [`Window`]. Detectors only ever see this.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    head: &'a [DataPoint],
    tail: &'a [DataPoint],
}

impl<'a> Snapshot<'a> {
    /// Snapshot over a plain slice; mostly useful in tests.
    pub fn from_slice(points: &'a [DataPoint]) -> Self {
        Self {
            head: points,
            tail: &[],
        }
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(self) -> impl DoubleEndedIterator<Item = &'a DataPoint> {
        self.head.iter().chain(self.tail.iter())
    }

    pub fn values(self) -> impl DoubleEndedIterator<Item = f64> {
        self.iter().map(|p| p.value)
    }

    pub fn to_values(self) -> Vec<f64> {
        self.values().collect()
    }

    pub fn last(&self) -> Option<&'a DataPoint> {
        self.tail.last().or_else(|| self.head.last())
    }
}
