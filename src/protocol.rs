//! Wire records and the fixed-layout object codec.
//!
//! Every payload on a test channel starts with a single mode byte that tells
//! the receiver how to interpret the rest of the buffer. Running objects carry
//! an [`ObjectTestHeader`] (mode tag + sender timestamp); the final object of
//! a channel carries an [`ObjectTestComplete`] with the producer's full
//! metrics snapshot embedded by value. The layout is fixed-size little-endian
//! with no versioning or checksum: the format's only self-description is its
//! size and the leading mode byte.
//!
//! Encoding into a buffer smaller than the full header writes the mode byte
//! alone. This is a deliberate degenerate case for undersized payloads, and
//! the decoders accept both shapes. A completion payload shorter than
//! [`COMPLETE_SIZE`] is a protocol violation.

use crate::stats::TestMetrics;
use bytes::{Buf, BufMut};
use std::fmt;
use thiserror::Error;

/// Size of the leading mode tag present in every payload.
pub const MODE_TAG_SIZE: usize = 1;

/// Encoded size of [`ObjectTestHeader`]: mode tag + 8-byte microsecond timestamp.
pub const HEADER_SIZE: usize = MODE_TAG_SIZE + 8;

/// Encoded size of the metrics snapshot: two 8-byte timestamps, six 8-byte
/// counters, a 4-byte sample count, and the 8-byte bitrate-sum accumulator.
pub const METRICS_SNAPSHOT_SIZE: usize = 9 * 8 + 4;

/// Encoded size of [`ObjectTestComplete`].
pub const COMPLETE_SIZE: usize = HEADER_SIZE + METRICS_SNAPSHOT_SIZE;

/// Errors surfaced by the object codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("unknown mode tag {0:#04x}")]
    UnknownMode(u8),

    #[error("completion payload too short: {len} bytes, need {COMPLETE_SIZE}")]
    ShortCompletion { len: usize },
}

/// Per-channel test lifecycle mode.
///
/// The producer drives its mode forward through this machine; the consumer
/// infers its local mode from the tag embedded in each received payload.
/// Transitions are monotonic forward except `Error`, which is reachable from
/// any state and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TestMode {
    None = 0,
    WaitPreTest = 1,
    Running = 2,
    Complete = 3,
    WaitPostTest = 4,
    Error = 5,
}

impl TestMode {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition(self, next: TestMode) -> bool {
        self != TestMode::Error && next as u8 >= self as u8
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestMode::None => "None",
            TestMode::WaitPreTest => "WaitPreTest",
            TestMode::Running => "Running",
            TestMode::Complete => "Complete",
            TestMode::WaitPostTest => "WaitPostTest",
            TestMode::Error => "Error",
        };
        write!(f, "{}", name)
    }
}

impl TryFrom<u8> for TestMode {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(TestMode::None),
            1 => Ok(TestMode::WaitPreTest),
            2 => Ok(TestMode::Running),
            3 => Ok(TestMode::Complete),
            4 => Ok(TestMode::WaitPostTest),
            5 => Ok(TestMode::Error),
            other => Err(ProtocolError::UnknownMode(other)),
        }
    }
}

/// Header prefixing every payload published while a channel is `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectTestHeader {
    pub test_mode: TestMode,
    /// Sender's clock at publish time, microseconds since the Unix epoch.
    pub time: u64,
}

/// The sole payload of the final object on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectTestComplete {
    pub test_mode: TestMode,
    pub time: u64,
    pub test_metrics: TestMetrics,
}

/// Read the leading mode tag of a payload without touching the rest.
pub fn peek_mode(payload: &[u8]) -> Result<TestMode, ProtocolError> {
    let tag = *payload.first().ok_or(ProtocolError::EmptyPayload)?;
    TestMode::try_from(tag)
}

/// Write a running-object header at the start of `buf`.
///
/// Returns the number of bytes written: the full header, the mode byte alone
/// when the buffer is smaller than [`HEADER_SIZE`], or nothing for an empty
/// buffer.
pub fn encode_header(header: ObjectTestHeader, buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    if buf.len() < HEADER_SIZE {
        buf[0] = header.test_mode as u8;
        return MODE_TAG_SIZE;
    }
    let mut cursor = &mut buf[..];
    cursor.put_u8(header.test_mode as u8);
    cursor.put_u64_le(header.time);
    HEADER_SIZE
}

/// Decode a running-object header, accepting the mode-only truncated shape.
///
/// A payload shorter than [`HEADER_SIZE`] yields the mode tag with a zero
/// timestamp, mirroring the encoder's truncation policy.
pub fn decode_header(payload: &[u8]) -> Result<ObjectTestHeader, ProtocolError> {
    let test_mode = peek_mode(payload)?;
    let time = if payload.len() >= HEADER_SIZE {
        let mut cursor = &payload[MODE_TAG_SIZE..];
        cursor.get_u64_le()
    } else {
        0
    };
    Ok(ObjectTestHeader { test_mode, time })
}

/// Build the completion payload carrying the producer's metrics snapshot.
pub fn encode_complete(time: u64, metrics: &TestMetrics) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COMPLETE_SIZE);
    buf.put_u8(TestMode::Complete as u8);
    buf.put_u64_le(time);
    buf.put_u64_le(metrics.start_transmit_time);
    buf.put_u64_le(metrics.end_transmit_time);
    buf.put_u64_le(metrics.total_published_objects);
    buf.put_u64_le(metrics.total_objects_dropped_not_ok);
    buf.put_u64_le(metrics.total_published_bytes);
    buf.put_u64_le(metrics.max_publish_bitrate);
    buf.put_u64_le(metrics.min_publish_bitrate);
    buf.put_u64_le(metrics.avg_publish_bitrate);
    buf.put_u32_le(metrics.metric_samples);
    buf.put_u64_le(metrics.bitrate_total);
    buf
}

/// Decode a completion record.
///
/// Payloads shorter than [`COMPLETE_SIZE`] are a protocol violation: no field
/// of the snapshot can be trusted, so nothing is decoded.
pub fn decode_complete(payload: &[u8]) -> Result<ObjectTestComplete, ProtocolError> {
    if payload.len() < COMPLETE_SIZE {
        return Err(ProtocolError::ShortCompletion {
            len: payload.len(),
        });
    }
    let mut cursor = payload;
    let test_mode = TestMode::try_from(cursor.get_u8())?;
    let time = cursor.get_u64_le();
    let test_metrics = TestMetrics {
        start_transmit_time: cursor.get_u64_le(),
        end_transmit_time: cursor.get_u64_le(),
        total_published_objects: cursor.get_u64_le(),
        total_objects_dropped_not_ok: cursor.get_u64_le(),
        total_published_bytes: cursor.get_u64_le(),
        max_publish_bitrate: cursor.get_u64_le(),
        min_publish_bitrate: cursor.get_u64_le(),
        avg_publish_bitrate: cursor.get_u64_le(),
        metric_samples: cursor.get_u32_le(),
        bitrate_total: cursor.get_u64_le(),
    };
    Ok(ObjectTestComplete {
        test_mode,
        time,
        test_metrics,
    })
}
