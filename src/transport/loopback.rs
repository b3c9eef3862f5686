//! In-process relay: the loopback implementation of the transport boundary.
//!
//! Every channel is a `tokio::sync::broadcast` fan-out. Publishing sends the
//! payload to all current subscribers; a subscriber that falls behind the
//! queue depth is lagged by the broadcast channel and the missed objects are
//! surfaced as drops in its metric samples, so lossy delivery is observable
//! without a network in the loop. Per-track tasks deliver objects to the
//! registered handlers and report cumulative metric samples on a fixed
//! cadence.

use crate::defaults;
use crate::scenario::{ChannelId, DeliveryMode};
use crate::transport::{
    MetricsSample, ObjectMetadata, ObjectPublisher, RelayClient, SessionStatus, TrackHandler,
    TrackStatus,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct DeliveredObject {
    metadata: ObjectMetadata,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct TrackCounters {
    bytes: AtomicU64,
    objects: AtomicU64,
    dropped: AtomicU64,
}

impl TrackCounters {
    fn sample(&self) -> MetricsSample {
        MetricsSample {
            cumulative_bytes: self.bytes.load(Ordering::Relaxed),
            cumulative_objects: self.objects.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Inner {
    tracks: HashMap<ChannelId, broadcast::Sender<DeliveredObject>>,
    publisher_tasks: HashMap<ChannelId, Vec<JoinHandle<()>>>,
    subscriber_tasks: HashMap<ChannelId, Vec<JoinHandle<()>>>,
}

/// In-process relay joining publishers and subscribers without a network.
pub struct LoopbackRelay {
    metrics_interval: Duration,
    queue_depth: usize,
    status_tx: watch::Sender<SessionStatus>,
    inner: Mutex<Inner>,
}

impl LoopbackRelay {
    pub fn new(metrics_interval: Duration) -> Self {
        Self::with_queue_depth(metrics_interval, defaults::LOOPBACK_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(metrics_interval: Duration, queue_depth: usize) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::NotReady);
        Self {
            metrics_interval,
            queue_depth,
            status_tx,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Report a session status transition to every observer.
    ///
    /// Exposed so embedders (and tests) can signal transport-level failures.
    pub fn report_status(&self, status: SessionStatus) {
        self.status_tx.send_replace(status);
    }

    async fn metrics_loop(
        handler: Arc<dyn TrackHandler>,
        counters: Arc<TrackCounters>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            handler.on_metrics(counters.sample());
        }
    }

    async fn deliver_loop(
        mut rx: broadcast::Receiver<DeliveredObject>,
        handler: Arc<dyn TrackHandler>,
        counters: Arc<TrackCounters>,
    ) {
        loop {
            match rx.recv().await {
                Ok(object) => {
                    counters.objects.fetch_add(1, Ordering::Relaxed);
                    counters
                        .bytes
                        .fetch_add(object.payload.len() as u64, Ordering::Relaxed);
                    handler.on_object(&object.metadata, &object.payload);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    counters.dropped.fetch_add(missed, Ordering::Relaxed);
                    warn!(missed, "subscriber lagged behind the delivery queue");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[async_trait]
impl RelayClient for LoopbackRelay {
    async fn connect(&self) -> Result<watch::Receiver<SessionStatus>> {
        self.status_tx.send_replace(SessionStatus::Connecting);
        self.status_tx.send_replace(SessionStatus::Ready);
        Ok(self.status_tx.subscribe())
    }

    async fn publish_track(
        &self,
        channel: &ChannelId,
        _mode: DeliveryMode,
        handler: Arc<dyn TrackHandler>,
    ) -> Result<Arc<dyn ObjectPublisher>> {
        let counters = Arc::new(TrackCounters::default());
        let publisher;
        {
            let mut inner = self.inner.lock().await;
            let tx = inner
                .tracks
                .entry(channel.clone())
                .or_insert_with(|| broadcast::channel(self.queue_depth).0)
                .clone();
            publisher = Arc::new(LoopbackPublisher {
                tx,
                counters: counters.clone(),
            });
            let metrics_task = tokio::spawn(Self::metrics_loop(
                handler.clone(),
                counters,
                self.metrics_interval,
            ));
            inner
                .publisher_tasks
                .entry(channel.clone())
                .or_default()
                .push(metrics_task);
        }
        handler.on_status(TrackStatus::Ok);
        Ok(publisher)
    }

    async fn subscribe_track(
        &self,
        channel: &ChannelId,
        handler: Arc<dyn TrackHandler>,
    ) -> Result<()> {
        let counters = Arc::new(TrackCounters::default());
        {
            let mut inner = self.inner.lock().await;
            let rx = inner
                .tracks
                .entry(channel.clone())
                .or_insert_with(|| broadcast::channel(self.queue_depth).0)
                .subscribe();
            let delivery_task =
                tokio::spawn(Self::deliver_loop(rx, handler.clone(), counters.clone()));
            let metrics_task = tokio::spawn(Self::metrics_loop(
                handler.clone(),
                counters,
                self.metrics_interval,
            ));
            inner
                .subscriber_tasks
                .entry(channel.clone())
                .or_default()
                .extend([delivery_task, metrics_task]);
        }
        handler.on_status(TrackStatus::Ok);
        Ok(())
    }

    async fn unpublish_track(&self, channel: &ChannelId) {
        let mut inner = self.inner.lock().await;
        if let Some(tasks) = inner.publisher_tasks.remove(channel) {
            for task in tasks {
                task.abort();
            }
        }
    }

    async fn unsubscribe_track(&self, channel: &ChannelId) {
        let mut inner = self.inner.lock().await;
        if let Some(tasks) = inner.subscriber_tasks.remove(channel) {
            for task in tasks {
                task.abort();
            }
        }
    }

    async fn disconnect(&self) {
        self.status_tx.send_replace(SessionStatus::Disconnecting);
        let mut inner = self.inner.lock().await;
        for tasks in inner.publisher_tasks.values_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        for tasks in inner.subscriber_tasks.values_mut() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        inner.publisher_tasks.clear();
        inner.subscriber_tasks.clear();
        inner.tracks.clear();
    }
}

struct LoopbackPublisher {
    tx: broadcast::Sender<DeliveredObject>,
    counters: Arc<TrackCounters>,
}

#[async_trait]
impl ObjectPublisher for LoopbackPublisher {
    async fn publish(&self, metadata: ObjectMetadata, payload: Bytes) -> Result<()> {
        let len = payload.len() as u64;
        match self.tx.send(DeliveredObject { metadata, payload }) {
            Ok(_) => {
                self.counters.objects.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes.fetch_add(len, Ordering::Relaxed);
            }
            Err(_) => {
                // No subscriber on the channel; the object went nowhere.
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    group_id = metadata.group_id,
                    object_id = metadata.object_id,
                    "published object had no subscribers"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingHandler {
        objects: SyncMutex<Vec<(ObjectMetadata, Vec<u8>)>>,
        samples: SyncMutex<Vec<MetricsSample>>,
        statuses: SyncMutex<Vec<TrackStatus>>,
    }

    impl TrackHandler for RecordingHandler {
        fn on_status(&self, status: TrackStatus) {
            self.statuses.lock().push(status);
        }

        fn on_metrics(&self, sample: MetricsSample) {
            self.samples.lock().push(sample);
        }

        fn on_object(&self, metadata: &ObjectMetadata, payload: &[u8]) {
            self.objects.lock().push((*metadata, payload.to_vec()));
        }
    }

    fn metadata(object_id: u64, len: usize) -> ObjectMetadata {
        ObjectMetadata {
            group_id: 0,
            object_id,
            priority: 1,
            ttl_ms: 100,
            payload_length: len,
        }
    }

    #[tokio::test]
    async fn delivers_published_objects_to_subscribers() {
        let relay = LoopbackRelay::new(Duration::from_millis(20));
        let channel = ChannelId::new("perf/1/video", "t");

        let sub_handler = Arc::new(RecordingHandler::default());
        relay
            .subscribe_track(&channel, sub_handler.clone())
            .await
            .unwrap();

        let pub_handler = Arc::new(RecordingHandler::default());
        let publisher = relay
            .publish_track(&channel, DeliveryMode::Stream, pub_handler.clone())
            .await
            .unwrap();

        for id in 0..3_u64 {
            publisher
                .publish(metadata(id, 4), Bytes::from_static(b"abcd"))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(60)).await;

        let objects = sub_handler.objects.lock();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[2].0.object_id, 2);
        assert_eq!(objects[0].1, b"abcd");
        drop(objects);

        assert_eq!(sub_handler.statuses.lock().first(), Some(&TrackStatus::Ok));

        // Metric samples carry cumulative counters for both sides.
        let samples = sub_handler.samples.lock();
        let last = samples.last().expect("subscriber metric samples");
        assert_eq!(last.cumulative_objects, 3);
        assert_eq!(last.cumulative_bytes, 12);
        drop(samples);

        relay.disconnect().await;
    }

    #[tokio::test]
    async fn publishing_without_subscribers_counts_as_dropped() {
        let relay = LoopbackRelay::new(Duration::from_millis(10));
        let channel = ChannelId::new("perf/1/void", "t");

        let pub_handler = Arc::new(RecordingHandler::default());
        let publisher = relay
            .publish_track(&channel, DeliveryMode::Stream, pub_handler.clone())
            .await
            .unwrap();

        publisher
            .publish(metadata(0, 2), Bytes::from_static(b"xy"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let samples = pub_handler.samples.lock();
        let last = samples.last().expect("publisher metric samples");
        assert_eq!(last.cumulative_objects, 0);
        assert_eq!(last.dropped, 1);

        drop(samples);
        relay.disconnect().await;
    }
}
