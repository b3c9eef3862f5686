//! Transport boundary: the contract between the measurement core and the
//! underlying media-transport client.
//!
//! The core never talks to a network directly. Producers publish through an
//! [`ObjectPublisher`]; consumers are driven by the transport invoking their
//! [`TrackHandler`] callbacks: one call per delivered object plus periodic
//! cumulative metric samples on the transport's own cadence. Session-level
//! status transitions arrive over a `watch` channel from [`RelayClient`].
//!
//! Handler callbacks may be invoked concurrently for a channel and across
//! channels; implementations guard their state accordingly.

use crate::scenario::{ChannelId, DeliveryMode};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

pub mod loopback;

pub use loopback::LoopbackRelay;

/// Per-object delivery metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub group_id: u64,
    pub object_id: u64,
    pub priority: u8,
    pub ttl_ms: u32,
    pub payload_length: usize,
}

/// Cumulative counters reported by the transport on a fixed cadence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSample {
    pub cumulative_bytes: u64,
    pub cumulative_objects: u64,
    /// Objects the transport failed to deliver (dropped, not acknowledged).
    pub dropped: u64,
}

/// Session-level connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    PendingServerSetup,
    Ready,
    NotReady,
    Disconnecting,
    NotConnected,
    FailedToConnect,
    InternalError,
    InvalidParams,
}

impl SessionStatus {
    /// Terminal statuses end the whole session.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::NotConnected
                | SessionStatus::FailedToConnect
                | SessionStatus::InternalError
                | SessionStatus::InvalidParams
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Connecting => "Connecting",
            SessionStatus::PendingServerSetup => "PendingServerSetup",
            SessionStatus::Ready => "Ready",
            SessionStatus::NotReady => "NotReady",
            SessionStatus::Disconnecting => "Disconnecting",
            SessionStatus::NotConnected => "NotConnected",
            SessionStatus::FailedToConnect => "FailedToConnect",
            SessionStatus::InternalError => "InternalError",
            SessionStatus::InvalidParams => "InvalidParams",
        };
        write!(f, "{}", name)
    }
}

/// Per-track status reported to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Ok,
    NotConnected,
    NotSubscribed,
    PendingResponse,
    SendingUnsubscribe,
    NotAuthorized,
    Error,
}

impl TrackStatus {
    /// Terminal statuses stop the owning handler.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrackStatus::SendingUnsubscribe | TrackStatus::NotAuthorized | TrackStatus::Error
        )
    }
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackStatus::Ok => "Ok",
            TrackStatus::NotConnected => "NotConnected",
            TrackStatus::NotSubscribed => "NotSubscribed",
            TrackStatus::PendingResponse => "PendingResponse",
            TrackStatus::SendingUnsubscribe => "SendingUnsubscribe",
            TrackStatus::NotAuthorized => "NotAuthorized",
            TrackStatus::Error => "Error",
        };
        write!(f, "{}", name)
    }
}

/// Callback interface the transport drives for each registered track.
///
/// Implemented by the producer handler (status + metrics) and the consumer
/// handler (all three). Calls must tolerate concurrency with each other.
pub trait TrackHandler: Send + Sync {
    fn on_status(&self, status: TrackStatus);

    fn on_metrics(&self, sample: MetricsSample);

    fn on_object(&self, metadata: &ObjectMetadata, payload: &[u8]) {
        let _ = (metadata, payload);
    }
}

/// Publish-side handle for one track.
#[async_trait]
pub trait ObjectPublisher: Send + Sync {
    async fn publish(&self, metadata: ObjectMetadata, payload: Bytes) -> Result<()>;
}

/// Client session against a relay.
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    /// Establish the session; the returned channel reports status
    /// transitions, starting from the current status.
    async fn connect(&self) -> Result<watch::Receiver<SessionStatus>>;

    /// Announce a publication and obtain its publish handle. The handler
    /// receives track status and periodic publish-side metric samples.
    async fn publish_track(
        &self,
        channel: &ChannelId,
        mode: DeliveryMode,
        handler: Arc<dyn TrackHandler>,
    ) -> Result<Arc<dyn ObjectPublisher>>;

    /// Subscribe a handler to a channel; the transport invokes its
    /// `on_object` per delivery and `on_metrics` on its sample cadence.
    async fn subscribe_track(&self, channel: &ChannelId, handler: Arc<dyn TrackHandler>)
        -> Result<()>;

    async fn unpublish_track(&self, channel: &ChannelId);

    async fn unsubscribe_track(&self, channel: &ChannelId);

    async fn disconnect(&self);
}
