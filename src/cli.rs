//! Command-line interface parsing and run configuration.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Publish/subscribe media-transport performance harness
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Role of this instance: publish, subscribe, or both
    #[clap(short = 'r', long, value_enum, default_value_t = Role::Both)]
    pub role: Role,

    /// Scenario definition file (JSON)
    #[clap(short = 'c', long = "config", default_value = crate::defaults::SCENARIO_FILE)]
    pub scenario_file: PathBuf,

    /// Endpoint identifier presented to the relay
    #[clap(long, default_value = crate::defaults::ENDPOINT_ID)]
    pub endpoint_id: String,

    /// Relay to connect to
    #[clap(long, default_value = crate::defaults::CONNECT_URI)]
    pub connect_uri: String,

    /// Conference identifier shared by cooperating instances
    #[clap(long, default_value_t = 1)]
    pub conference_id: u32,

    /// Number of instances participating in the conference
    #[clap(short = 'n', long, default_value_t = 1)]
    pub instances: u32,

    /// This instance's identifier (1-based)
    #[clap(short = 'i', long, default_value_t = 1)]
    pub instance_id: u32,

    /// Seconds between transport metric samples
    #[clap(long, default_value_t = crate::defaults::METRICS_INTERVAL_SECS)]
    pub metrics_interval: u64,

    /// Output file for the JSON run report
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Mirror log output to a file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Verbose output (enables per-object trace records)
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Which side(s) of the test this instance runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Publish the scenario channels
    #[clap(name = "pub")]
    Publisher,

    /// Subscribe to the scenario channels
    #[clap(name = "sub")]
    Subscriber,

    /// Publish and subscribe
    #[clap(name = "both")]
    Both,
}

impl Role {
    pub fn publishes(self) -> bool {
        matches!(self, Role::Publisher | Role::Both)
    }

    pub fn subscribes(self) -> bool {
        matches!(self, Role::Subscriber | Role::Both)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Publisher => write!(f, "publisher"),
            Role::Subscriber => write!(f, "subscriber"),
            Role::Both => write!(f, "both"),
        }
    }
}
