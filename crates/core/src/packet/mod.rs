//! Received datagrams and their RTP/RTCP field accessors.
//!
//! A [`PacketBuffer`] holds exactly one datagram as it came off the wire.
//! Nothing is parsed eagerly: the accessors read big-endian fields straight
//! out of the owned bytes and return 0 when the datagram is too short for
//! the field, so a truncated packet can never cause an out-of-bounds read.
//!
//! ## Lifecycle
//!
//! ```text
//! PacketPool::acquire ─► fill (socket recv / push) ─► PacketPool::share
//!        ▲                                               │
//!        │                                    Arc<PooledPacket> in every
//!        │                                    sender queue that wants it
//!        └──────────── last Arc dropped ◄────────────────┘
//! ```

pub mod pool;
pub mod rtcp;
pub mod rtp;

use crate::time::Millis;

pub use pool::{PacketPool, PooledPacket, SharedPacket};

/// Largest datagram the reflector accepts: a 2048 byte payload plus room
/// for 12 trailing test bytes.
pub const MAX_PACKET_SIZE: usize = 2060;

/// Which half of an elementary stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

impl PacketKind {
    /// Both kinds, in sender order.
    pub const ALL: [PacketKind; 2] = [PacketKind::Rtp, PacketKind::Rtcp];

    /// Dense index used for per-kind arrays.
    pub fn index(self) -> usize {
        match self {
            PacketKind::Rtp => 0,
            PacketKind::Rtcp => 1,
        }
    }

    pub fn is_rtcp(self) -> bool {
        self == PacketKind::Rtcp
    }

    pub fn from_rtcp_flag(is_rtcp: bool) -> Self {
        if is_rtcp {
            PacketKind::Rtcp
        } else {
            PacketKind::Rtp
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketKind::Rtp => write!(f, "RTP"),
            PacketKind::Rtcp => write!(f, "RTCP"),
        }
    }
}

/// One received datagram plus arrival metadata.
///
/// The byte vector is allocated once with room for a [`MAX_PACKET_SIZE`] read and
/// never grows; recycling through the [`PacketPool`] keeps the allocation.
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    data: Vec<u8>,
    is_rtcp: bool,
    arrival: Millis,
    stream_count_id: u64,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(MAX_PACKET_SIZE + 1),
            ..Default::default()
        }
    }

    /// Copy `data` into the buffer.
    ///
    /// Oversized input is dropped rather than truncated: the buffer is left
    /// empty and `false` is returned.
    pub fn set(&mut self, data: &[u8]) -> bool {
        self.data.clear();
        if data.len() > MAX_PACKET_SIZE {
            return false;
        }
        self.data.extend_from_slice(data);
        true
    }

    /// Make the buffer ready for reuse, keeping its allocation.
    pub fn reset(&mut self) {
        self.data.clear();
        self.is_rtcp = false;
        self.arrival = 0;
        self.stream_count_id = 0;
    }

    /// Scratch area for a socket read, one byte longer than the largest
    /// accepted datagram so an oversized one shows up as too long.
    pub(crate) fn recv_buffer(&mut self) -> &mut [u8] {
        self.data.resize(MAX_PACKET_SIZE + 1, 0);
        &mut self.data
    }

    /// Record how many bytes the socket read actually produced.
    ///
    /// Returns false, leaving the buffer empty, when the read filled the
    /// whole scratch area: the datagram was oversized and got cut short.
    pub(crate) fn set_len(&mut self, len: usize) -> bool {
        if len > MAX_PACKET_SIZE {
            self.data.clear();
            return false;
        }
        self.data.truncate(len);
        true
    }

    pub(crate) fn stamp(&mut self, kind: PacketKind, arrival: Millis) {
        self.is_rtcp = kind.is_rtcp();
        self.arrival = arrival;
    }

    pub(crate) fn set_stream_count_id(&mut self, id: u64) {
        self.stream_count_id = id;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_rtcp(&self) -> bool {
        self.is_rtcp
    }

    pub fn kind(&self) -> PacketKind {
        PacketKind::from_rtcp_flag(self.is_rtcp)
    }

    /// Arrival time on the relay timeline.
    pub fn arrival(&self) -> Millis {
        self.arrival
    }

    /// Relay-internal, monotonically increasing id assigned by the pool.
    pub fn stream_count_id(&self) -> u64 {
        self.stream_count_id
    }

    /// SSRC of the sender: bytes 8..12 for RTP, 4..8 for RTCP.
    pub fn ssrc(&self) -> u32 {
        if self.is_rtcp {
            rtcp::ssrc(&self.data)
        } else {
            rtp::ssrc(&self.data)
        }
    }

    /// RTP sequence number; always 0 for RTCP.
    pub fn sequence_number(&self) -> u16 {
        if self.is_rtcp {
            0
        } else {
            rtp::sequence_number(&self.data)
        }
    }

    /// RTP timestamp, or the RTP timestamp carried by an RTCP sender report.
    pub fn rtp_timestamp(&self) -> u32 {
        if self.is_rtcp {
            rtcp::sr_rtp_timestamp(&self.data)
        } else {
            rtp::timestamp(&self.data)
        }
    }

    /// Sender-report NTP time as Unix milliseconds; 0 for RTP or short reports.
    pub fn ntp_time_ms(&self) -> i64 {
        if !self.is_rtcp {
            return 0;
        }
        match rtcp::sr_ntp_timestamp(&self.data) {
            0 => 0,
            ntp => rtcp::ntp_to_unix_ms(ntp),
        }
    }

    pub fn marker(&self) -> bool {
        !self.is_rtcp && rtp::marker(&self.data)
    }

    pub fn payload_type(&self) -> u8 {
        if self.is_rtcp {
            rtcp::packet_type(&self.data)
        } else {
            rtp::payload_type(&self.data)
        }
    }

    /// Structural sanity check for the packet's protocol.
    pub fn is_well_formed(&self) -> bool {
        if self.is_rtcp {
            rtcp::is_valid(&self.data)
        } else {
            rtp::is_valid(&self.data)
        }
    }
}
