//! The single consumer of the worker pool's response stream

use log::{debug, error, info, trace, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::batch::BatchAccumulator;
use crate::coordinator::TestState;
use crate::error::{Result, StressError};
use crate::message::Response;
use crate::point::Point;
use crate::storage::MeasurementStore;
use crate::tracer::Tracer;

/// What the listener did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Data points accepted into batches
    pub points: u64,
    /// Batches written to the store
    pub batches: u64,
    /// Points written to the store
    pub written: u64,
    /// Whether the stream ended with an explicit end-of-stream response
    pub end_of_stream: bool,
}

enum Flow {
    Continue,
    Stop,
}

/// Drains responses one at a time, tags their points, batches them and
/// writes full batches to the measurement store.
///
/// Only one listener may exist per coordinator: it owns the batch, and the
/// total order it imposes on writes relies on there being a single consumer.
pub struct ResultsListener {
    responses: mpsc::Receiver<Response>,
    store: Arc<dyn MeasurementStore>,
    accumulator: BatchAccumulator,
    state: Arc<RwLock<TestState>>,
    tags: Arc<BTreeMap<String, String>>,
    stats: ListenerStats,
}

impl ResultsListener {
    pub fn new(
        responses: mpsc::Receiver<Response>,
        store: Arc<dyn MeasurementStore>,
        database: impl Into<String>,
        state: Arc<RwLock<TestState>>,
        tags: Arc<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            responses,
            store,
            accumulator: BatchAccumulator::new(database),
            state,
            tags,
            stats: ListenerStats::default(),
        }
    }

    /// Run the listener on its own task
    pub fn spawn(self) -> JoinHandle<Result<ListenerStats>> {
        tokio::spawn(self.run())
    }

    /// Consume responses until end-of-stream, channel close, or a fatal error
    pub async fn run(mut self) -> Result<ListenerStats> {
        info!("Results listener started via {}", self.store.name());

        while let Some(response) = self.responses.recv().await {
            match self.handle(response).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    self.release_queued().await;
                    info!(
                        "Results listener finished: {} points in {} batches",
                        self.stats.points, self.stats.batches
                    );
                    return Ok(self.stats);
                }
                Err(e) => {
                    error!("Results listener stopping: {}", e);
                    self.release_queued().await;
                    return Err(e);
                }
            }
        }

        debug!("Response channel closed, flushing remaining points");
        self.flush().await?;
        info!(
            "Results listener finished: {} points in {} batches",
            self.stats.points, self.stats.batches
        );
        Ok(self.stats)
    }

    /// Refuse further responses and release the tracers of those already
    /// queued, so no issuer waits on a listener that has stopped.
    async fn release_queued(&mut self) {
        self.responses.close();

        let mut dropped = 0;
        while let Some(response) = self.responses.recv().await {
            if matches!(response, Response::DataPoint { .. }) {
                dropped += 1;
            }
            if let Err(e) = response.tracer().done() {
                warn!("Could not release queued response: {}", e);
            }
        }
        if dropped > 0 {
            warn!("Dropped {} result points queued after the listener stopped", dropped);
        }
    }

    async fn handle(&mut self, response: Response) -> Result<Flow> {
        match response {
            Response::EndOfStream { tracer } => {
                let flushed = self.flush().await;
                release(&tracer)?;
                flushed?;
                self.stats.end_of_stream = true;
                Ok(Flow::Stop)
            }
            Response::DataPoint { point, tracer } => {
                let point = self.tag(&point, &tracer);
                self.accumulator.set_threshold(self.batch_size()?);
                self.accumulator.add(point);
                self.stats.points += 1;
                release(&tracer)?;

                if self.accumulator.is_full() {
                    self.flush().await?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Merge tracer tags and then coordinator tags over the point's own tags
    fn tag(&self, point: &Point, tracer: &Tracer) -> Point {
        let mut tags = tracer.tags().clone();
        tags.extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        trace!("Tagging '{}' point with {} tags", point.name(), tags.len());
        point.with_tags(&tags)
    }

    fn batch_size(&self) -> Result<usize> {
        let state = self
            .state
            .read()
            .map_err(|_| StressError::Listener("State lock poisoned".to_string()))?;
        Ok(state.batch_size)
    }

    async fn flush(&mut self) -> Result<()> {
        let result = self.accumulator.flush(self.store.as_ref()).await;
        self.stats.batches = self.accumulator.flushed_batches();
        self.stats.written = self.accumulator.flushed_points();
        result.map(|_| ())
    }
}

fn release(tracer: &Tracer) -> Result<()> {
    tracer.done().map_err(StressError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TracerError;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    struct Harness {
        tx: mpsc::Sender<Response>,
        store: Arc<MemoryStore>,
        state: Arc<RwLock<TestState>>,
        handle: JoinHandle<Result<ListenerStats>>,
    }

    async fn harness(batch_size: usize) -> Harness {
        let store = Arc::new(MemoryStore::default());
        store.create_database_if_not_exists("results").await.unwrap();
        let state = Arc::new(RwLock::new(TestState {
            batch_size,
            ..TestState::default()
        }));
        let mut tags = BTreeMap::new();
        tags.insert("test_id".to_string(), "T1".to_string());

        let (tx, rx) = mpsc::channel(16);
        let listener = ResultsListener::new(
            rx,
            store.clone(),
            "results",
            state.clone(),
            Arc::new(tags),
        );
        Harness {
            tx,
            store,
            state,
            handle: listener.spawn(),
        }
    }

    async fn send_point(tx: &mpsc::Sender<Response>, n: i64) -> Tracer {
        let tracer = Tracer::default();
        tracer.add(1);
        let point = Point::new("req").field("n", n);
        tx.send(Response::data(point, tracer.clone())).await.unwrap();
        tracer
    }

    async fn end(tx: &mpsc::Sender<Response>) -> Tracer {
        let tracer = Tracer::default();
        tracer.add(1);
        tx.send(Response::end_of_stream(tracer.clone())).await.unwrap();
        tracer
    }

    fn ns(points: &[Point]) -> Vec<String> {
        points.iter().map(|p| p.lookup("n").unwrap_or_default()).collect()
    }

    #[tokio::test]
    async fn test_points_keep_order_across_batches() {
        let h = harness(3).await;
        for n in 0..7 {
            send_point(&h.tx, n).await;
        }
        end(&h.tx).await.wait().await;
        let stats = h.handle.await.unwrap().unwrap();

        let batches = h.store.batches().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let written = h.store.points("results").unwrap();
        assert_eq!(ns(&written), vec!["0", "1", "2", "3", "4", "5", "6"]);
        assert_eq!(
            stats,
            ListenerStats {
                points: 7,
                batches: 3,
                written: 7,
                end_of_stream: true
            }
        );
    }

    #[tokio::test]
    async fn test_threshold_plus_one_flushes_once() {
        let h = harness(4).await;
        for n in 0..5 {
            send_point(&h.tx, n).await.wait().await;
        }

        let batches = h.store.batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 4);

        drop(h.tx);
        h.handle.await.unwrap().unwrap();
        let batches = h.store.batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(ns(batches[1].points()), vec!["4"]);
    }

    #[tokio::test]
    async fn test_end_of_stream_flushes_partial_batch() {
        let h = harness(100).await;
        send_point(&h.tx, 1).await;
        send_point(&h.tx, 2).await;
        let tracer = end(&h.tx).await;
        tracer.wait().await;

        assert_eq!(h.store.points("results").unwrap().len(), 2);
        let stats = h.handle.await.unwrap().unwrap();
        assert!(stats.end_of_stream);
    }

    #[tokio::test]
    async fn test_end_of_stream_stops_consuming() {
        let h = harness(100).await;
        end(&h.tx).await.wait().await;
        h.handle.await.unwrap().unwrap();

        let tracer = Tracer::default();
        let late = h
            .tx
            .send(Response::data(Point::new("req"), tracer))
            .await;
        assert!(late.is_err());
        assert!(h.store.batches().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_points_carry_merged_tags() {
        let h = harness(10).await;
        let mut tracer_tags = BTreeMap::new();
        tracer_tags.insert("statement_id".to_string(), "s-1".to_string());
        tracer_tags.insert("test_id".to_string(), "ignored".to_string());
        let tracer = Tracer::new(tracer_tags);
        tracer.add(1);
        let point = Point::new("req").tag("method", "GET");
        h.tx.send(Response::data(point.clone(), tracer.clone()))
            .await
            .unwrap();
        tracer.wait().await;
        end(&h.tx).await.wait().await;
        h.handle.await.unwrap().unwrap();

        let written = h.store.points("results").unwrap();
        let tags = written[0].tags();
        assert_eq!(tags["method"], "GET");
        assert_eq!(tags["statement_id"], "s-1");
        assert_eq!(tags["test_id"], "T1");
        assert_eq!(point.tags().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_change_applies_live() {
        let h = harness(100).await;
        send_point(&h.tx, 0).await.wait().await;
        h.state.write().unwrap().batch_size = 2;
        send_point(&h.tx, 1).await;
        send_point(&h.tx, 2).await;
        drop(h.tx);
        h.handle.await.unwrap().unwrap();

        let batches = h.store.batches().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_lowered_batch_size_splits_buffered_points() {
        let h = harness(100).await;
        let mut sent = Vec::new();
        for n in 0..10 {
            sent.push(send_point(&h.tx, n).await);
        }
        sent[9].wait().await;

        h.state.write().unwrap().batch_size = 2;
        send_point(&h.tx, 10).await;
        drop(h.tx);
        let stats = h.handle.await.unwrap().unwrap();

        let sizes: Vec<usize> = h.store.batches().unwrap().iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 2, 2, 2, 1]);
        assert_eq!(stats.batches, 6);
        assert_eq!(stats.written, 11);
        let written = h.store.points("results").unwrap();
        assert_eq!(
            ns(&written),
            vec!["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10"]
        );
    }

    #[tokio::test]
    async fn test_queued_responses_released_after_write_failure() {
        let h = harness(1).await;
        h.store.set_fail_writes(true);
        let first = send_point(&h.tx, 0).await;
        let queued = send_point(&h.tx, 1).await;

        let result = h.handle.await.unwrap();
        assert!(matches!(result, Err(StressError::Write(_))));
        first.wait_timeout(Duration::from_secs(1)).await.unwrap();
        queued.wait_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(queued.pending(), 0);
    }

    #[tokio::test]
    async fn test_responses_behind_end_of_stream_are_released() {
        let h = harness(100).await;
        let eos = end(&h.tx).await;
        let late = send_point(&h.tx, 1).await;

        let stats = h.handle.await.unwrap().unwrap();
        eos.wait_timeout(Duration::from_secs(1)).await.unwrap();
        late.wait_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(stats.points, 0);
        assert!(h.store.points("results").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_is_returned_and_tracer_released() {
        let h = harness(100).await;
        h.store.set_fail_writes(true);
        send_point(&h.tx, 1).await;
        let tracer = end(&h.tx).await;

        tracer.wait().await;
        let result = h.handle.await.unwrap();
        assert!(matches!(result, Err(StressError::Write(_))));
    }

    #[tokio::test]
    async fn test_overreleased_tracer_stops_listener() {
        let h = harness(100).await;
        // Nothing was added, so the listener's release is one too many.
        h.tx.send(Response::data(Point::new("req"), Tracer::default()))
            .await
            .unwrap();

        let result = h.handle.await.unwrap();
        assert!(matches!(
            result,
            Err(StressError::Tracer(TracerError::Overreleased))
        ));
    }
}
