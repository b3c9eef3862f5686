//! Subscribe-side test handler: streaming delivery statistics.
//!
//! One handler runs per subscribed channel. The transport invokes it once per
//! delivered object and periodically with cumulative metric samples; both
//! paths share the handler's single lock. The handler reconstructs
//! end-to-end latency (transmit delta) and inter-arrival jitter (arrival
//! delta) from the live feed in O(1) memory, and finalizes the run when the
//! completion record arrives, cross-checking its own tallies against the
//! producer's reported totals.

use crate::protocol::{self, TestMode};
use crate::report::SubscribeReport;
use crate::scenario::{ChannelId, TestConfig};
use crate::stats::{BitrateSampler, BitrateStats, DeltaStats};
use crate::transport::{MetricsSample, ObjectMetadata, TrackHandler, TrackStatus};
use crate::utils::{epoch_micros, format_bitrate, format_duration_us};
use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, trace, warn};

struct SubscribeState {
    mode: TestMode,
    first_pass: bool,
    complete: bool,
    start_data_time: u64,
    last_local_now: u64,
    total_objects: u64,
    total_bytes: u64,
    transmit_delta: DeltaStats,
    arrival_delta: DeltaStats,
    transmit_histogram: Histogram<u64>,
    bitrate: BitrateStats,
    sampler: BitrateSampler,
    summary: Option<SubscribeReport>,
}

/// Handler owning the receive-side statistics for one channel.
pub struct SubscribeHandler {
    config: TestConfig,
    test_identifier: u32,
    state: Mutex<SubscribeState>,
}

impl SubscribeHandler {
    pub fn new(config: TestConfig, test_identifier: u32) -> Result<Arc<Self>> {
        // Three significant figures, auto-resizing: enough resolution for
        // microsecond latency percentiles at constant memory.
        let transmit_histogram = Histogram::new(3)?;
        Ok(Arc::new(Self {
            config,
            test_identifier,
            state: Mutex::new(SubscribeState {
                mode: TestMode::None,
                first_pass: true,
                complete: false,
                start_data_time: 0,
                last_local_now: 0,
                total_objects: 0,
                total_bytes: 0,
                transmit_delta: DeltaStats::new(),
                arrival_delta: DeltaStats::new(),
                transmit_histogram,
                bitrate: BitrateStats::new(),
                sampler: BitrateSampler::new(),
                summary: None,
            }),
        }))
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    pub fn channel(&self) -> &ChannelId {
        &self.config.channel
    }

    /// Whether this channel's run has finished (completion record observed,
    /// protocol violation, or terminal track status).
    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// The completion summary, once the run finished cleanly.
    pub fn report(&self) -> Option<SubscribeReport> {
        self.state.lock().summary.clone()
    }

    fn handle_object_at(&self, metadata: &ObjectMetadata, payload: &[u8], local_now: u64) {
        let mut st = self.state.lock();
        if st.complete {
            // Terminal: nothing after the completion record is expected.
            return;
        }

        let Some(&tag) = payload.first() else {
            warn!(
                test = %self.config.test_name,
                group_id = metadata.group_id,
                object_id = metadata.object_id,
                "received empty payload"
            );
            return;
        };

        if tag == TestMode::Complete as u8 {
            self.finalize(&mut st, payload, local_now);
            return;
        }

        st.total_objects += 1;
        st.total_bytes += payload.len() as u64;
        let first_pass = st.first_pass;
        if first_pass {
            st.last_local_now = local_now;
            st.start_data_time = local_now;
        }

        match TestMode::try_from(tag) {
            Ok(TestMode::Running) => {
                st.mode = TestMode::Running;
                // Tolerates the mode-only truncated header; a missing
                // timestamp decodes as zero.
                let remote_now = protocol::decode_header(payload).map(|h| h.time).unwrap_or(0);
                let transmit_delta = local_now as i64 - remote_now as i64;
                let arrival_delta = local_now as i64 - st.last_local_now as i64;

                if transmit_delta <= 0 {
                    warn!(
                        test = %self.config.test_name,
                        group_id = metadata.group_id,
                        object_id = metadata.object_id,
                        local_us = local_now,
                        remote_us = remote_now,
                        transmit_delta,
                        "non-positive transmit delta (check clock sync)"
                    );
                }
                if arrival_delta <= 0 && !first_pass {
                    warn!(
                        test = %self.config.test_name,
                        group_id = metadata.group_id,
                        object_id = metadata.object_id,
                        local_us = local_now,
                        previous_us = st.last_local_now,
                        arrival_delta,
                        "non-positive arrival delta"
                    );
                }

                if first_pass {
                    info!(
                        test = %self.config.test_name,
                        channel = %self.config.channel,
                        transmit_time_ms = self.config.total_transmit_time_ms,
                        "started receiving"
                    );
                } else {
                    // The first object seeds the baselines and contributes
                    // to the tallies only; deltas start with the second.
                    st.transmit_delta.record(transmit_delta);
                    st.arrival_delta.record(arrival_delta);
                    st.transmit_histogram
                        .record(transmit_delta.max(0) as u64)
                        .ok();
                }

                trace!(
                    test_identifier = self.test_identifier,
                    test = %self.config.test_name,
                    group_id = metadata.group_id,
                    object_id = metadata.object_id,
                    size = payload.len(),
                    local_us = local_now,
                    remote_us = remote_now,
                    transmit_delta,
                    arrival_delta,
                    total_objects = st.total_objects,
                    total_bytes = st.total_bytes,
                    "received object"
                );
            }
            Ok(other) => {
                warn!(
                    test = %self.config.test_name,
                    group_id = metadata.group_id,
                    object_id = metadata.object_id,
                    mode = %other,
                    "unexpected mode tag on received object"
                );
            }
            Err(_) => {
                warn!(
                    test = %self.config.test_name,
                    group_id = metadata.group_id,
                    object_id = metadata.object_id,
                    tag,
                    "unrecognized mode tag on received object"
                );
            }
        }

        st.last_local_now = local_now;
        st.first_pass = false;
    }

    fn finalize(&self, st: &mut SubscribeState, payload: &[u8], local_now: u64) {
        let record = match protocol::decode_complete(payload) {
            Ok(record) => record,
            Err(e) => {
                // Nothing in the snapshot can be trusted; mark the channel
                // complete so the session can release it, without a summary.
                error!(
                    test = %self.config.test_name,
                    channel = %self.config.channel,
                    error = %e,
                    "completion record violates protocol, abandoning summary"
                );
                st.complete = true;
                return;
            }
        };

        st.mode = TestMode::Complete;
        let total_objects = st.total_objects;
        let elapsed_us = if total_objects > 0 {
            local_now.saturating_sub(st.start_data_time)
        } else {
            0
        };

        let transmit = st.transmit_delta.summary_over(total_objects);
        // The first received object is excluded from the arrival sums but
        // still counted in the tally, hence the smaller denominator.
        let arrival = st
            .arrival_delta
            .summary_over(total_objects.saturating_sub(1));
        let bitrate = st.bitrate.summary();

        let remote = record.test_metrics;
        let object_delta = remote.total_published_objects as i64 - total_objects as i64;
        let byte_delta = remote.total_published_bytes as i64 - st.total_bytes as i64;

        let nominal_us = self.config.nominal_interval_us();
        let over_multiplier = if nominal_us > 0.0 {
            (arrival.avg / nominal_us) as i64
        } else {
            0
        };

        let summary = SubscribeReport {
            test_name: self.config.test_name.clone(),
            channel: self.config.channel.to_string(),
            test_identifier: self.test_identifier,
            elapsed_us,
            configured_transmit_time_ms: self.config.total_transmit_time_ms,
            received_objects: total_objects,
            received_bytes: st.total_bytes,
            published_objects: remote.total_published_objects,
            published_bytes: remote.total_published_bytes,
            object_delta,
            byte_delta,
            bitrate_bps: bitrate,
            transmit_delta_us: transmit,
            arrival_delta_us: arrival,
            transmit_delta_p50_us: st.transmit_histogram.value_at_percentile(50.0),
            transmit_delta_p95_us: st.transmit_histogram.value_at_percentile(95.0),
            transmit_delta_p99_us: st.transmit_histogram.value_at_percentile(99.0),
            over_multiplier,
        };

        info!(test = %self.config.test_name, "testing complete");
        info!(
            "  total run time {} ({} configured ms)",
            format_duration_us(elapsed_us),
            self.config.total_transmit_time_ms
        );
        info!(
            "  received {} objects / {} bytes, publisher reports {} / {}",
            summary.received_objects,
            summary.received_bytes,
            summary.published_objects,
            summary.published_bytes
        );
        info!(
            "  delta {} objects / {} bytes",
            summary.object_delta, summary.byte_delta
        );
        info!(
            "  bitrate min {} max {} avg {}",
            format_bitrate(bitrate.min),
            format_bitrate(bitrate.max),
            format_bitrate(bitrate.avg as u64)
        );

        // The single machine-readable completion record; downstream tooling
        // consumes these fields.
        info!(
            target: "pubperf::summary",
            test_identifier = summary.test_identifier,
            test = %summary.test_name,
            channel = %summary.channel,
            elapsed_us = summary.elapsed_us,
            configured_transmit_time_ms = summary.configured_transmit_time_ms,
            received_objects = summary.received_objects,
            received_bytes = summary.received_bytes,
            published_objects = summary.published_objects,
            published_bytes = summary.published_bytes,
            object_delta = summary.object_delta,
            byte_delta = summary.byte_delta,
            bitrate_min_bps = summary.bitrate_bps.min,
            bitrate_max_bps = summary.bitrate_bps.max,
            bitrate_avg_bps = summary.bitrate_bps.avg,
            transmit_delta_min_us = summary.transmit_delta_us.min,
            transmit_delta_max_us = summary.transmit_delta_us.max,
            transmit_delta_avg_us = summary.transmit_delta_us.avg,
            transmit_delta_p50_us = summary.transmit_delta_p50_us,
            transmit_delta_p95_us = summary.transmit_delta_p95_us,
            transmit_delta_p99_us = summary.transmit_delta_p99_us,
            arrival_delta_min_us = summary.arrival_delta_us.min,
            arrival_delta_max_us = summary.arrival_delta_us.max,
            arrival_delta_avg_us = summary.arrival_delta_us.avg,
            over_multiplier = summary.over_multiplier,
            "subscribe complete"
        );

        st.summary = Some(summary);
        st.complete = true;
    }

    fn handle_metrics_at(&self, sample: MetricsSample, now_us: u64) {
        let mut st = self.state.lock();
        let sampled = st.sampler.sample(sample.cumulative_bytes, now_us);
        if st.mode != TestMode::Running {
            return;
        }
        if let Some(bitrate) = sampled {
            st.bitrate.record(bitrate);
            info!(
                test_identifier = self.test_identifier,
                test = %self.config.test_name,
                bitrate_bps = bitrate,
                bitrate = %format_bitrate(bitrate),
                cumulative_objects = sample.cumulative_objects,
                cumulative_bytes = sample.cumulative_bytes,
                dropped = sample.dropped,
                max_bps = st.bitrate.max(),
                min_bps = st.bitrate.min(),
                avg_bps = st.bitrate.avg(),
                "subscribe metrics"
            );
        }
    }
}

impl TrackHandler for SubscribeHandler {
    fn on_status(&self, status: TrackStatus) {
        info!(
            test_identifier = self.test_identifier,
            test = %self.config.test_name,
            channel = %self.config.channel,
            status = %status,
            "subscribe track status"
        );
        if status.is_terminal() {
            self.state.lock().complete = true;
        }
    }

    fn on_metrics(&self, sample: MetricsSample) {
        self.handle_metrics_at(sample, epoch_micros());
    }

    fn on_object(&self, metadata: &ObjectMetadata, payload: &[u8]) {
        self.handle_object_at(metadata, payload, epoch_micros());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_complete, encode_header, ObjectTestHeader, COMPLETE_SIZE};
    use crate::scenario::DeliveryMode;
    use crate::stats::TestMetrics;

    fn test_config() -> TestConfig {
        TestConfig {
            test_name: "unit".to_string(),
            channel: ChannelId::new("perf/1/unit", "t"),
            delivery_mode: DeliveryMode::Stream,
            priority: 1,
            ttl_ms: 100,
            transmit_interval_secs: 0.01,
            objects_per_group: 5,
            first_object_size: 64,
            object_size: 64,
            start_delay_ms: 0,
            total_transmit_time_ms: 1_000,
            total_test_time_ms: 1_000,
        }
    }

    fn handler() -> Arc<SubscribeHandler> {
        SubscribeHandler::new(test_config(), 7).unwrap()
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

    fn running_payload(remote_time: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        encode_header(
            ObjectTestHeader {
                test_mode: TestMode::Running,
                time: remote_time,
            },
            &mut buf,
        );
        buf
    }

    fn completion_payload(published_objects: u64, published_bytes: u64) -> Vec<u8> {
        let metrics = TestMetrics {
            total_published_objects: published_objects,
            total_published_bytes: published_bytes,
            ..TestMetrics::default()
        };
        encode_complete(0, &metrics)
    }

    #[test]
    fn first_object_seeds_but_never_contributes_deltas() {
        let sub = handler();

        sub.handle_object_at(&metadata(0, 64), &running_payload(900), 1_000);
        {
            let st = sub.state.lock();
            assert_eq!(st.total_objects, 1);
            assert_eq!(st.transmit_delta.count(), 0);
            assert_eq!(st.arrival_delta.count(), 0);
        }

        // The second object is the first to contribute.
        sub.handle_object_at(&metadata(1, 64), &running_payload(1_900), 2_000);
        let st = sub.state.lock();
        assert_eq!(st.total_objects, 2);
        assert_eq!(st.transmit_delta.count(), 1);
        assert_eq!(st.transmit_delta.sum(), 100);
        assert_eq!(st.arrival_delta.count(), 1);
        assert_eq!(st.arrival_delta.sum(), 1_000);
    }

    #[test]
    fn four_received_five_claimed_reports_one_dropped() {
        let sub = handler();

        // Object 1 (excluded) and objects 2..4 with transmit deltas of
        // 100, 300, 200 us at a steady 10 ms arrival spacing.
        sub.handle_object_at(&metadata(0, 64), &running_payload(10_000 - 50), 10_000);
        sub.handle_object_at(&metadata(1, 64), &running_payload(20_000 - 100), 20_000);
        sub.handle_object_at(&metadata(2, 64), &running_payload(30_000 - 300), 30_000);
        sub.handle_object_at(&metadata(3, 64), &running_payload(40_000 - 200), 40_000);

        sub.handle_object_at(
            &metadata(4, COMPLETE_SIZE),
            &completion_payload(5, 320),
            50_000,
        );

        assert!(sub.is_complete());
        let summary = sub.report().expect("summary");

        assert_eq!(summary.received_objects, 4);
        assert_eq!(summary.received_bytes, 256);
        assert_eq!(summary.published_objects, 5);
        assert_eq!(summary.object_delta, 1);
        assert_eq!(summary.byte_delta, 64);
        assert_eq!(summary.elapsed_us, 40_000);

        // Deltas come strictly from objects 2..4.
        assert_eq!(summary.transmit_delta_us.min, 100);
        assert_eq!(summary.transmit_delta_us.max, 300);
        assert_eq!(summary.arrival_delta_us.min, 10_000);
        assert_eq!(summary.arrival_delta_us.max, 10_000);

        // Nominal interval is 10 ms, observed average arrival is 10 ms.
        assert_eq!(summary.over_multiplier, 1);
    }

    #[test]
    fn average_formulas_use_asymmetric_denominators() {
        let sub = handler();

        sub.handle_object_at(&metadata(0, 64), &running_payload(1_000), 1_000);
        sub.handle_object_at(&metadata(1, 64), &running_payload(2_000 - 80), 2_000);
        sub.handle_object_at(&metadata(2, 64), &running_payload(3_000 - 40), 3_000);
        sub.handle_object_at(&metadata(3, COMPLETE_SIZE), &completion_payload(3, 192), 4_000);

        let summary = sub.report().expect("summary");

        // Transmit average divides the two-sample sum by the full tally of
        // three data objects; arrival divides by the tally minus one.
        assert_eq!(summary.transmit_delta_us.avg, 120.0 / 3.0);
        assert_eq!(summary.arrival_delta_us.avg, 2_000.0 / 2.0);
    }

    #[test]
    fn short_completion_is_fatal_without_summary() {
        let sub = handler();

        sub.handle_object_at(&metadata(0, 64), &running_payload(900), 1_000);
        let short = vec![TestMode::Complete as u8; COMPLETE_SIZE - 1];
        sub.handle_object_at(&metadata(1, short.len()), &short, 2_000);

        assert!(sub.is_complete());
        assert!(sub.report().is_none());
    }

    #[test]
    fn unrecognized_tag_counts_but_adds_no_deltas() {
        let sub = handler();

        sub.handle_object_at(&metadata(0, 1), &[0x2a], 1_000);
        let st = sub.state.lock();
        assert_eq!(st.total_objects, 1);
        assert_eq!(st.transmit_delta.count(), 0);
        assert!(!st.complete);
    }

    #[test]
    fn truncated_running_payload_decodes_mode_only() {
        let sub = handler();

        let mut short = vec![0u8; 4];
        encode_header(
            ObjectTestHeader {
                test_mode: TestMode::Running,
                time: 999,
            },
            &mut short,
        );

        sub.handle_object_at(&metadata(0, 4), &short, 1_000);
        sub.handle_object_at(&metadata(1, 4), &short, 2_000);

        // Remote time decodes as zero, so the transmit delta collapses to
        // the local clock value.
        let st = sub.state.lock();
        assert_eq!(st.transmit_delta.sum(), 2_000);
    }

    #[test]
    fn objects_after_completion_are_ignored() {
        let sub = handler();

        sub.handle_object_at(&metadata(0, 64), &running_payload(900), 1_000);
        sub.handle_object_at(&metadata(1, COMPLETE_SIZE), &completion_payload(2, 128), 2_000);
        assert!(sub.is_complete());

        sub.handle_object_at(&metadata(2, 64), &running_payload(2_900), 3_000);
        let summary = sub.report().expect("summary");
        assert_eq!(summary.received_objects, 1);
    }

    #[test]
    fn bitrate_samples_are_gated_to_running_mode() {
        let sub = handler();
        let sample = |bytes| MetricsSample {
            cumulative_bytes: bytes,
            cumulative_objects: 0,
            dropped: 0,
        };

        // Before any object arrives the handler is not running; samples
        // only move the baseline.
        sub.handle_metrics_at(sample(1_000), 1_000_000);
        sub.handle_metrics_at(sample(2_000), 2_000_000);
        assert_eq!(sub.state.lock().bitrate.samples(), 0);

        sub.handle_object_at(&metadata(0, 64), &running_payload(900), 1_000);
        sub.handle_metrics_at(sample(4_000), 3_000_000);
        let st = sub.state.lock();
        assert_eq!(st.bitrate.samples(), 1);
        assert_eq!(st.bitrate.max(), 16_000);
    }
}
