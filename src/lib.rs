//! # pubperf
//!
//! A throughput/latency performance-test harness for a publish/subscribe
//! media-transport session. One side continuously produces timestamped
//! objects at a configured rate and size; one or more peers consume them and
//! compute delivery statistics (end-to-end latency, inter-arrival jitter,
//! and bitrate) from the live object feed in constant memory, without
//! buffering the stream.
//!
//! ## Architecture Overview
//!
//! - `scenario`: immutable per-channel test configuration, loaded from a
//!   JSON scenario file
//! - `protocol`: the per-test lifecycle mode machine and the fixed-layout
//!   wire codec for running headers and completion records
//! - `publisher`: the timed object-production loop, one task per published
//!   channel
//! - `subscriber`: the streaming statistics handler driven by transport
//!   delivery callbacks
//! - `stats`: whole-run `{count, sum, min, max}` aggregates and the shared
//!   bitrate sampling discipline
//! - `session`: orchestration of handlers over one relay connection, with
//!   cooperative shutdown
//! - `transport`: the boundary contract to the media-transport client, plus
//!   the in-process loopback relay
//! - `report`: the JSON run report for downstream tooling
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pubperf::cli::Role;
//! use pubperf::scenario::Scenario;
//! use pubperf::session::{PerfSession, SessionSettings, ShutdownToken};
//! use pubperf::transport::LoopbackRelay;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scenario = Scenario::load("scenarios/loopback.json".as_ref())?;
//!     let relay = Arc::new(LoopbackRelay::new(Duration::from_secs(5)));
//!     let settings = SessionSettings {
//!         role: Role::Both,
//!         endpoint_id: "perf@localhost".to_string(),
//!         conference_id: 1,
//!         instance_id: 1,
//!         instances: 1,
//!     };
//!     let session = PerfSession::new(relay, scenario, settings, ShutdownToken::new());
//!     let (publishers, subscribers) = session.run().await?;
//!     println!("{} channels published, {} summaries", publishers.len(), subscribers.len());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod logging;
pub mod protocol;
pub mod publisher;
pub mod report;
pub mod scenario;
pub mod session;
pub mod stats;
pub mod subscriber;
pub mod transport;
pub mod utils;

pub use cli::{Args, Role};
pub use protocol::TestMode;
pub use publisher::PublishHandler;
pub use report::{PublishReport, RunReport, SubscribeReport};
pub use scenario::{ChannelId, DeliveryMode, Scenario, TestConfig};
pub use session::{PerfSession, SessionSettings, ShutdownToken};
pub use subscriber::SubscribeHandler;
pub use transport::LoopbackRelay;

/// The current version of the harness, used in run reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Default scenario file path.
    pub const SCENARIO_FILE: &str = "./scenarios.json";

    /// Default endpoint identifier presented to the relay.
    pub const ENDPOINT_ID: &str = "perf@localhost";

    /// Default relay URI.
    pub const CONNECT_URI: &str = "moq://localhost:1234";

    /// Default cadence of transport metric samples, in seconds.
    ///
    /// Bitrate is computed from deltas between consecutive samples, so this
    /// also bounds the resolution of the bitrate aggregates.
    pub const METRICS_INTERVAL_SECS: u64 = 5;

    /// Tick used while waiting out a configured start delay.
    ///
    /// Short enough that a stop request is observed promptly during the
    /// pre-test wait.
    pub const PRETEST_TICK: Duration = Duration::from_millis(100);

    /// How often the session polls its handlers for completion.
    pub const COMPLETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Loopback relay per-channel queue depth; subscribers that fall further
    /// behind than this observe the overflow as dropped objects.
    pub const LOOPBACK_QUEUE_DEPTH: usize = 1024;

    /// Floor for the elapsed-time divisor in bitrate computation, applied on
    /// both the publish and subscribe sides.
    pub const MIN_BITRATE_ELAPSED_SECS: u64 = 1;
}
