//! Run reports: the machine-readable record of one harness run.
//!
//! The operator log lines are the primary output; the JSON run report is the
//! durable copy for downstream analysis tooling, written when an output file
//! is configured.

use crate::stats::{BitrateSummary, DeltaSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Publish-side totals for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub test_name: String,
    pub channel: String,
    pub start_transmit_time_us: u64,
    pub end_transmit_time_us: u64,
    pub total_published_objects: u64,
    pub total_published_bytes: u64,
    pub total_objects_dropped_not_ok: u64,
    pub metric_samples: u32,
    pub bitrate_bps: BitrateSummary,
}

/// Subscribe-side completion summary for one channel.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeReport {
    pub test_name: String,
    pub channel: String,
    pub test_identifier: u32,
    pub elapsed_us: u64,
    pub configured_transmit_time_ms: u64,
    pub received_objects: u64,
    pub received_bytes: u64,
    pub published_objects: u64,
    pub published_bytes: u64,
    /// Producer-reported minus locally-observed counts: delivery loss.
    pub object_delta: i64,
    pub byte_delta: i64,
    pub bitrate_bps: BitrateSummary,
    pub transmit_delta_us: DeltaSummary,
    pub arrival_delta_us: DeltaSummary,
    pub transmit_delta_p50_us: u64,
    pub transmit_delta_p95_us: u64,
    pub transmit_delta_p99_us: u64,
    /// Observed average arrival delay over the configured nominal interval.
    pub over_multiplier: i64,
}

/// Everything one run produced.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub harness_version: String,
    pub role: String,
    pub publishers: Vec<PublishReport>,
    pub subscribers: Vec<SubscribeReport>,
}

impl RunReport {
    pub fn new(
        role: String,
        publishers: Vec<PublishReport>,
        subscribers: Vec<SubscribeReport>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            harness_version: crate::VERSION.to_string(),
            role,
            publishers,
            subscribers,
        }
    }
}

/// Writes a [`RunReport`] as pretty JSON.
pub struct ReportWriter {
    output_file: PathBuf,
}

impl ReportWriter {
    pub fn new<P: AsRef<Path>>(output_file: P) -> Self {
        Self {
            output_file: output_file.as_ref().to_path_buf(),
        }
    }

    pub fn write(&self, report: &RunReport) -> Result<()> {
        let json =
            serde_json::to_string_pretty(report).context("failed to serialize run report")?;
        fs::write(&self.output_file, json).with_context(|| {
            format!("failed to write run report to {}", self.output_file.display())
        })?;
        info!("wrote run report to {}", self.output_file.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_parseable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let report = RunReport::new(
            "both".to_string(),
            vec![PublishReport {
                test_name: "t".to_string(),
                channel: "perf/1001/t/track".to_string(),
                start_transmit_time_us: 1,
                end_transmit_time_us: 2,
                total_published_objects: 3,
                total_published_bytes: 4,
                total_objects_dropped_not_ok: 0,
                metric_samples: 1,
                bitrate_bps: BitrateSummary {
                    min: 1,
                    max: 2,
                    avg: 1.5,
                },
            }],
            Vec::new(),
        );

        ReportWriter::new(&path).write(&report).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["role"], "both");
        assert_eq!(parsed["publishers"][0]["total_published_objects"], 3);
        assert!(parsed["run_id"].as_str().unwrap().len() >= 32);
    }
}
