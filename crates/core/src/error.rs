//! Error types for the reflection engine.

use crate::stream::StreamId;

/// Errors that can escalate out of the reflection engine.
///
/// Per-packet anomalies (truncated datagrams, SSRC mismatches, duplicate
/// sequence numbers, transient output failures) never show up here. They are
/// absorbed and counted in [`RelayStats`](crate::stats::RelayStats) so that
/// one bad packet or one slow output cannot stall the relay.
///
/// - **Transport**: [`Io`](Self::Io), [`SourceUnusable`](Self::SourceUnusable).
/// - **Resources**: [`BucketAllocation`](Self::BucketAllocation),
///   [`PortRangeExhausted`](Self::PortRangeExhausted).
/// - **Lookup**: [`StreamNotFound`](Self::StreamNotFound).
/// - **Scheduler**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The bucket table could not grow to hold another output.
    #[error("bucket table allocation failed")]
    BucketAllocation,

    /// No stream is registered under the given id.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The stream's source socket hit a transport failure and must be rebound.
    #[error("source unusable for stream: {0}")]
    SourceUnusable(StreamId),

    /// The RTCP port (`rtp_port + 1`) does not fit in a u16.
    #[error("port range exhausted (RTCP port beyond u16 range)")]
    PortRangeExhausted,

    /// [`Scheduler::stop`](crate::Scheduler::stop) was called on a scheduler
    /// that never started.
    #[error("scheduler not started")]
    NotStarted,

    /// [`Scheduler::start`](crate::Scheduler::start) was called while already running.
    #[error("scheduler already running")]
    AlreadyRunning,

    /// A source descriptor could not be used to create a stream.
    #[error("invalid source descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Convenience alias for `Result<T, ReflectorError>`.
pub type Result<T> = std::result::Result<T, ReflectorError>;
