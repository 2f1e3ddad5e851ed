use log::{debug, error, trace};

use crate::error::Result;
use crate::point::{Point, Precision};
use crate::storage::MeasurementStore;

/// Default number of points written per batch
pub const DEFAULT_FLUSH_THRESHOLD: usize = 5000;

/// An ordered group of points destined for a single write call
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    database: String,
    precision: Precision,
    points: Vec<Point>,
}

impl Batch {
    /// Create an empty batch. Results are always written with nanosecond precision.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            precision: Precision::Nanoseconds,
            points: Vec::new(),
        }
    }

    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Split off everything after the first `at` points into a new batch
    pub fn split_off(&mut self, at: usize) -> Batch {
        Batch {
            database: self.database.clone(),
            precision: self.precision,
            points: self.points.split_off(at.min(self.points.len())),
        }
    }
}

/// Owns the batch currently being filled and decides when it is written.
///
/// A batch is flushed as soon as it holds `threshold` points, so no written
/// batch ever exceeds the threshold. Single owner; no internal locking.
pub struct BatchAccumulator {
    current: Batch,
    threshold: usize,
    flushed_batches: u64,
    flushed_points: u64,
}

impl BatchAccumulator {
    /// Create an accumulator with the default threshold
    pub fn new(database: impl Into<String>) -> Self {
        Self::with_threshold(database, DEFAULT_FLUSH_THRESHOLD)
    }

    /// Create an accumulator with a custom threshold (at least 1)
    pub fn with_threshold(database: impl Into<String>, threshold: usize) -> Self {
        Self {
            current: Batch::new(database),
            threshold: threshold.max(1),
            flushed_batches: 0,
            flushed_points: 0,
        }
    }

    /// Append a point; returns true when the batch is now full
    pub fn add(&mut self, point: Point) -> bool {
        self.current.push(point);
        trace!(
            "Batched point ({}/{})",
            self.current.len(),
            self.threshold
        );
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.current.len() >= self.threshold
    }

    /// Take the current batch, leaving an empty one in its place
    pub fn drain(&mut self) -> Batch {
        let empty = Batch::new(self.current.database());
        std::mem::replace(&mut self.current, empty)
    }

    /// Write the current batch if it is full.
    /// Returns the number of points written, if a write happened.
    pub async fn flush_if_needed(&mut self, store: &dyn MeasurementStore) -> Result<Option<usize>> {
        if !self.is_full() {
            return Ok(None);
        }
        self.flush(store).await.map(Some)
    }

    /// Write whatever is buffered. Empty batches are not written.
    ///
    /// A buffer larger than the threshold (left behind when the threshold is
    /// lowered) goes out as several writes of at most `threshold` points.
    /// On failure every drained point not yet written is dropped.
    pub async fn flush(&mut self, store: &dyn MeasurementStore) -> Result<usize> {
        if self.current.is_empty() {
            debug!("Nothing buffered for '{}', skipping write", self.current.database());
            return Ok(0);
        }

        let mut remaining = self.drain();
        let mut total = 0;
        while !remaining.is_empty() {
            let rest = remaining.split_off(self.threshold);
            let batch = std::mem::replace(&mut remaining, rest);
            match store.write(&batch).await {
                Ok(written) => {
                    self.flushed_batches += 1;
                    self.flushed_points += written as u64;
                    total += written;
                    debug!(
                        "Flushed {} points to '{}' via {}",
                        written,
                        batch.database(),
                        store.name()
                    );
                }
                Err(e) => {
                    error!(
                        "Error writing {} result points to '{}', dropping them: {}",
                        batch.len() + remaining.len(),
                        batch.database(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    /// Change the flush threshold (at least 1)
    pub fn set_threshold(&mut self, threshold: usize) {
        self.threshold = threshold.max(1);
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of points waiting to be written
    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn flushed_batches(&self) -> u64 {
        self.flushed_batches
    }

    pub fn flushed_points(&self) -> u64 {
        self.flushed_points
    }
}
