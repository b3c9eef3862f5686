//! Publish-side test handler: the timed object-production loop.
//!
//! One handler runs per published channel, as a single long-lived tokio task
//! spawned by the session. The loop prefills two payload buffers (first
//! object of a group vs. the rest), stamps each publish with a running-mode
//! header, and finishes the channel with a completion record carrying the
//! full metrics snapshot. Publish-side bitrate is computed from the
//! transport's periodic metric callbacks, never from individual publishes.

use crate::defaults;
use crate::protocol::{self, ObjectTestHeader, TestMode, COMPLETE_SIZE};
use crate::report::PublishReport;
use crate::scenario::{ChannelId, TestConfig};
use crate::stats::{BitrateSampler, TestMetrics};
use crate::transport::{MetricsSample, ObjectMetadata, ObjectPublisher, TrackHandler, TrackStatus};
use crate::utils::{epoch_micros, format_bitrate, format_duration_us};
use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, trace, warn};

/// Deterministic, inert filler for object payloads.
fn filler_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 255) as u8).collect()
}

/// Group/object id bookkeeping: at every `objects_per_group` boundary the
/// object id resets and the group id advances. A zero group size leaves both
/// ids untouched (guarded by the caller with a warning, never a crash).
fn roll_group(object_id: u64, group_id: u64, objects_per_group: u32) -> (u64, u64) {
    if objects_per_group == 0 {
        return (object_id, group_id);
    }
    if object_id != 0 && object_id % u64::from(objects_per_group) == 0 {
        (0, group_id + 1)
    } else {
        (object_id, group_id)
    }
}

struct PublishState {
    mode: TestMode,
    group_id: u64,
    object_id: u64,
    metrics: TestMetrics,
    sampler: BitrateSampler,
    warned_zero_group: bool,
}

/// Handler owning the production loop and publish-side metrics for one
/// channel.
pub struct PublishHandler {
    config: TestConfig,
    stop: AtomicBool,
    state: Mutex<PublishState>,
}

impl PublishHandler {
    pub fn new(config: TestConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stop: AtomicBool::new(false),
            state: Mutex::new(PublishState {
                mode: TestMode::None,
                group_id: 0,
                object_id: 0,
                metrics: TestMetrics::default(),
                sampler: BitrateSampler::new(),
                warned_zero_group: false,
            }),
        })
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn channel(&self) -> &ChannelId {
        &self.config.channel
    }

    pub fn mode(&self) -> TestMode {
        self.state.lock().mode
    }

    /// Whether the loop has reached a terminal mode.
    pub fn is_finished(&self) -> bool {
        matches!(self.mode(), TestMode::Complete | TestMode::Error)
    }

    /// Ask the loop to stop at its next iteration boundary. The session
    /// joins the writer task after calling this, so no publish happens after
    /// the join returns.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn transition(state: &mut PublishState, next: TestMode, test_name: &str) {
        if !state.mode.can_transition(next) {
            warn!(
                test = test_name,
                from = %state.mode,
                to = %next,
                "ignoring invalid test mode transition"
            );
            return;
        }
        state.mode = next;
    }

    /// Entry point for the writer task.
    pub async fn run_writer(self: Arc<Self>, publisher: Arc<dyn ObjectPublisher>) {
        if let Err(e) = self.write_loop(publisher.as_ref()).await {
            error!(
                test = %self.config.test_name,
                channel = %self.config.channel,
                "publish loop failed: {e:#}"
            );
            Self::transition(&mut self.state.lock(), TestMode::Error, &self.config.test_name);
        }
    }

    async fn write_loop(&self, publisher: &dyn ObjectPublisher) -> Result<()> {
        let mut first_buf = filler_payload(self.config.first_object_size as usize);
        let mut rest_buf = filler_payload(self.config.object_size as usize);

        let start_us = epoch_micros();
        let deadline_us = start_us + self.config.total_test_time_ms * 1_000;

        if self.config.start_delay_ms > 0 {
            Self::transition(
                &mut self.state.lock(),
                TestMode::WaitPreTest,
                &self.config.test_name,
            );
            let delay = Duration::from_millis(self.config.start_delay_ms);
            let wait_start = Instant::now();
            while wait_start.elapsed() < delay {
                if self.stopped() {
                    return Ok(());
                }
                sleep(defaults::PRETEST_TICK).await;
            }
        }

        Self::transition(&mut self.state.lock(), TestMode::Running, &self.config.test_name);
        info!(
            test = %self.config.test_name,
            channel = %self.config.channel,
            transmit_time_ms = self.config.total_transmit_time_ms,
            "started publishing"
        );

        let interval_us = self.config.transmit_interval_us();

        loop {
            if self.stopped() {
                return Ok(());
            }
            if epoch_micros() >= deadline_us {
                break;
            }

            let (metadata, payload) = {
                let mut st = self.state.lock();
                if self.config.objects_per_group == 0 {
                    if !st.warned_zero_group {
                        warn!(
                            test = %self.config.test_name,
                            "objects_per_group is 0, publishing without group boundaries"
                        );
                        st.warned_zero_group = true;
                    }
                } else {
                    let (object_id, group_id) =
                        roll_group(st.object_id, st.group_id, self.config.objects_per_group);
                    st.object_id = object_id;
                    st.group_id = group_id;
                }

                let buf = if st.object_id == 0 {
                    &mut first_buf
                } else {
                    &mut rest_buf
                };
                protocol::encode_header(
                    ObjectTestHeader {
                        test_mode: TestMode::Running,
                        time: epoch_micros(),
                    },
                    buf,
                );
                let metadata = ObjectMetadata {
                    group_id: st.group_id,
                    object_id: st.object_id,
                    priority: self.config.priority,
                    ttl_ms: self.config.ttl_ms,
                    payload_length: buf.len(),
                };
                (metadata, Bytes::copy_from_slice(buf))
            };

            publisher.publish(metadata, payload).await?;
            let publish_us = epoch_micros();

            {
                let mut st = self.state.lock();
                if st.metrics.start_transmit_time == 0 {
                    st.metrics.start_transmit_time = publish_us;
                }
                st.metrics.total_published_objects += 1;
                st.metrics.total_published_bytes += metadata.payload_length as u64;
                st.object_id += 1;

                trace!(
                    test = %self.config.test_name,
                    group_id = metadata.group_id,
                    object_id = metadata.object_id,
                    size = metadata.payload_length,
                    time_us = publish_us,
                    total_objects = st.metrics.total_published_objects,
                    total_bytes = st.metrics.total_published_bytes,
                    "published object"
                );
            }

            if publish_us >= deadline_us {
                break;
            }
            if interval_us > 0 {
                sleep(Duration::from_micros(interval_us)).await;
            }
        }

        self.publish_complete(publisher).await
    }

    async fn publish_complete(&self, publisher: &dyn ObjectPublisher) -> Result<()> {
        let (metadata, payload, metrics) = {
            let mut st = self.state.lock();
            Self::transition(&mut st, TestMode::Complete, &self.config.test_name);

            let now_us = epoch_micros();
            st.metrics.end_transmit_time = now_us;
            // The completion record itself counts as a transmitted object.
            st.metrics.total_published_objects += 1;
            st.metrics.total_published_bytes += COMPLETE_SIZE as u64;

            let payload = protocol::encode_complete(now_us, &st.metrics);
            // object_id already points one past the last running object.
            let metadata = ObjectMetadata {
                group_id: st.group_id,
                object_id: st.object_id,
                priority: self.config.priority,
                ttl_ms: self.config.ttl_ms,
                payload_length: payload.len(),
            };
            (metadata, Bytes::from(payload), st.metrics)
        };

        publisher.publish(metadata, payload).await?;

        let bitrate = metrics.bitrate_summary();
        let elapsed_us = metrics
            .end_transmit_time
            .saturating_sub(metrics.start_transmit_time);
        info!(
            test = %self.config.test_name,
            channel = %self.config.channel,
            elapsed = %format_duration_us(elapsed_us),
            total_published_objects = metrics.total_published_objects,
            total_published_bytes = metrics.total_published_bytes,
            objects_dropped = metrics.total_objects_dropped_not_ok,
            bitrate_min_bps = bitrate.min,
            bitrate_max_bps = bitrate.max,
            bitrate_avg_bps = bitrate.avg,
            bitrate_avg = %format_bitrate(bitrate.avg as u64),
            metric_samples = metrics.metric_samples,
            "publish complete"
        );
        Ok(())
    }

    fn handle_metrics_at(&self, sample: MetricsSample, now_us: u64) {
        let mut st = self.state.lock();
        st.metrics.total_objects_dropped_not_ok = sample.dropped;
        let sampled = st.sampler.sample(sample.cumulative_bytes, now_us);
        if st.mode != TestMode::Running {
            return;
        }
        if let Some(bitrate) = sampled {
            st.metrics.record_bitrate(bitrate);
            info!(
                test = %self.config.test_name,
                bitrate_bps = bitrate,
                bitrate = %format_bitrate(bitrate),
                cumulative_objects = sample.cumulative_objects,
                cumulative_bytes = sample.cumulative_bytes,
                max_bps = st.metrics.max_publish_bitrate,
                min_bps = st.metrics.min_publish_bitrate,
                avg_bps = st.metrics.avg_publish_bitrate,
                "publish metrics"
            );
        }
    }

    /// Publish-side totals for the run report.
    pub fn report(&self) -> PublishReport {
        let st = self.state.lock();
        PublishReport {
            test_name: self.config.test_name.clone(),
            channel: self.config.channel.to_string(),
            start_transmit_time_us: st.metrics.start_transmit_time,
            end_transmit_time_us: st.metrics.end_transmit_time,
            total_published_objects: st.metrics.total_published_objects,
            total_published_bytes: st.metrics.total_published_bytes,
            total_objects_dropped_not_ok: st.metrics.total_objects_dropped_not_ok,
            metric_samples: st.metrics.metric_samples,
            bitrate_bps: st.metrics.bitrate_summary(),
        }
    }

    #[cfg(test)]
    fn force_mode(&self, mode: TestMode) {
        self.state.lock().mode = mode;
    }
}

impl TrackHandler for PublishHandler {
    fn on_status(&self, status: TrackStatus) {
        info!(
            test = %self.config.test_name,
            channel = %self.config.channel,
            status = %status,
            "publish track status"
        );
        if status.is_terminal() {
            self.request_stop();
        }
    }

    fn on_metrics(&self, sample: MetricsSample) {
        self.handle_metrics_at(sample, epoch_micros());
    }
}
