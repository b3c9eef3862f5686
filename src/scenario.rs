//! Scenario configuration: test definitions loaded from a JSON scenario file.
//!
//! A scenario file maps section names to test definitions. Each section
//! becomes one [`TestConfig`] per participating instance; the `namespace`
//! field may contain a `{}` placeholder that is substituted with the
//! effective instance id, so cooperating instances address distinct channels
//! from one shared file.
//!
//! Configuration errors are never fatal here: invalid values are warned
//! about and degraded to a safe default, so a misconfigured run still
//! finishes and reports loudly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// How objects on a channel are carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Stream,
    Datagram,
}

impl DeliveryMode {
    /// Parse a scenario-file value, defaulting to `Stream` on anything
    /// unrecognized.
    pub fn parse_lossy(value: Option<&str>) -> Self {
        match value {
            Some("stream") => DeliveryMode::Stream,
            Some("datagram") => DeliveryMode::Datagram,
            other => {
                warn!(
                    value = other.unwrap_or("<missing>"),
                    "invalid or missing delivery mode in scenario, using default `stream`"
                );
                DeliveryMode::Stream
            }
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Stream => write!(f, "stream"),
            DeliveryMode::Datagram => write!(f, "datagram"),
        }
    }
}

/// Fully-qualified identity of one publish/subscribe channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelId {
    pub namespace: String,
    pub name: String,
}

impl ChannelId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One raw section of the scenario file.
///
/// Field names match the scenario key names; sizing and timing fields
/// default to zero so sparse sections parse, with the validation warnings
/// deferred to [`TestConfig::from_section`].
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSection {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub delivery_mode: Option<String>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub ttl: u32,
    /// Inter-object transmit interval in fractional seconds.
    #[serde(default)]
    pub transmit_interval: f64,
    #[serde(default)]
    pub objects_per_group: u32,
    #[serde(default)]
    pub first_object_size: u32,
    #[serde(default)]
    pub object_size: u32,
    /// Delay before transmission starts, milliseconds.
    #[serde(default)]
    pub start_delay: u64,
    /// Transmission window, milliseconds.
    #[serde(default)]
    pub total_transmit_time: u64,
}

/// Immutable description of one test on one channel.
///
/// Created once per channel from scenario data and shared read-only by the
/// producer and consumer handlers.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub test_name: String,
    pub channel: ChannelId,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    pub ttl_ms: u32,
    pub transmit_interval_secs: f64,
    pub objects_per_group: u32,
    pub first_object_size: u32,
    pub object_size: u32,
    pub start_delay_ms: u64,
    pub total_transmit_time_ms: u64,
    /// Derived: transmit window plus start delay.
    pub total_test_time_ms: u64,
}

impl TestConfig {
    /// Build a per-instance config from a scenario section.
    ///
    /// Degenerate values are warned about here, once, and handled gracefully
    /// downstream rather than rejected.
    pub fn from_section(
        section_name: &str,
        section: &ScenarioSection,
        effective_instance_id: u32,
    ) -> Self {
        let namespace = section
            .namespace
            .replace("{}", &effective_instance_id.to_string());
        let channel = ChannelId::new(namespace, section.name.clone());
        let delivery_mode = DeliveryMode::parse_lossy(section.delivery_mode.as_deref());

        if section.objects_per_group == 0 {
            warn!(
                test = section_name,
                "objects_per_group is 0, group-id arithmetic is disabled for this test"
            );
        }
        if section.transmit_interval < 0.0 {
            warn!(
                test = section_name,
                interval = section.transmit_interval,
                "negative transmit interval, objects will be published back to back"
            );
        }
        let total_test_time_ms = section.total_transmit_time + section.start_delay;
        if total_test_time_ms == 0 {
            warn!(
                test = section_name,
                "total test time is zero, only the completion record will be published"
            );
        }

        let config = Self {
            test_name: section_name.to_string(),
            channel,
            delivery_mode,
            priority: section.priority,
            ttl_ms: section.ttl,
            transmit_interval_secs: section.transmit_interval,
            objects_per_group: section.objects_per_group,
            first_object_size: section.first_object_size,
            object_size: section.object_size,
            start_delay_ms: section.start_delay,
            total_transmit_time_ms: section.total_transmit_time,
            total_test_time_ms,
        };

        info!(
            test = %config.test_name,
            channel = %config.channel,
            delivery_mode = %config.delivery_mode,
            priority = config.priority,
            ttl_ms = config.ttl_ms,
            transmit_interval_secs = config.transmit_interval_secs,
            objects_per_group = config.objects_per_group,
            first_object_size = config.first_object_size,
            object_size = config.object_size,
            start_delay_ms = config.start_delay_ms,
            total_transmit_time_ms = config.total_transmit_time_ms,
            total_test_time_ms = config.total_test_time_ms,
            "loaded test config"
        );

        config
    }

    /// Configured transmit interval in whole microseconds; non-positive
    /// intervals collapse to zero wait.
    pub fn transmit_interval_us(&self) -> u64 {
        if self.transmit_interval_secs <= 0.0 {
            0
        } else {
            (self.transmit_interval_secs * 1_000_000.0) as u64
        }
    }

    /// Nominal inter-object interval in microseconds, for the over-multiplier
    /// diagnostic. Zero when no interval is configured.
    pub fn nominal_interval_us(&self) -> f64 {
        if self.transmit_interval_secs <= 0.0 {
            0.0
        } else {
            self.transmit_interval_secs * 1_000_000.0
        }
    }
}

/// A parsed scenario file: named sections in stable order.
#[derive(Debug, Clone)]
pub struct Scenario {
    sections: BTreeMap<String, ScenarioSection>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario file {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("failed to parse scenario file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let sections: BTreeMap<String, ScenarioSection> =
            serde_json::from_str(raw).context("malformed scenario JSON")?;
        anyhow::ensure!(!sections.is_empty(), "scenario file defines no tests");
        Ok(Self { sections })
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Materialize every section into a config addressed for one instance.
    pub fn configs_for_instance(&self, effective_instance_id: u32) -> Vec<TestConfig> {
        self.sections
            .iter()
            .map(|(name, section)| TestConfig::from_section(name, section, effective_instance_id))
            .collect()
    }
}
