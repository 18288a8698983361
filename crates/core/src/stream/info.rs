//! Stream identity and the broadcast source description.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{ReflectorError, Result};
use crate::output::TrackId;

/// Destination IP and RTP port of a broadcast. Unique per elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub addr: IpAddr,
    pub port: u16,
}

impl StreamId {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl From<SocketAddr> for StreamId {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// How to reach and interpret one broadcast source.
///
/// Built with consuming setters:
///
/// ```
/// use reflector::SourceDescriptor;
///
/// let desc = SourceDescriptor::new("239.1.1.1:5004".parse().unwrap())
///     .ssrc_filter(true)
///     .timescale(90_000)
///     .buffering(true);
/// assert_eq!(desc.id().port, 5004);
/// ```
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Where the broadcaster sends RTP. RTCP goes to the next port up.
    pub dest_addr: SocketAddr,
    /// Broadcaster address, when known.
    pub source_ip: Option<IpAddr>,
    /// RTP clock rate in Hz.
    pub timescale: u32,
    pub ssrc_filter: bool,
    /// Overrides the configured SSRC timeout for this stream.
    pub ssrc_timeout: Option<Duration>,
    /// Keep a buffer window and replay it to new outputs.
    pub buffering: bool,
    /// Interleaved channel carrying RTP over the control connection.
    pub rtp_channel: Option<u8>,
    pub rtcp_channel: Option<u8>,
    pub track_id: TrackId,
    /// Payload type used for relay-packetized payloads.
    pub payload_type: u8,
}

impl SourceDescriptor {
    pub fn new(dest_addr: SocketAddr) -> Self {
        Self {
            dest_addr,
            source_ip: None,
            timescale: 90_000,
            ssrc_filter: false,
            ssrc_timeout: None,
            buffering: false,
            rtp_channel: None,
            rtcp_channel: None,
            track_id: 1,
            payload_type: 96,
        }
    }

    pub fn source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    pub fn timescale(mut self, timescale: u32) -> Self {
        self.timescale = timescale;
        self
    }

    pub fn ssrc_filter(mut self, enabled: bool) -> Self {
        self.ssrc_filter = enabled;
        self
    }

    pub fn ssrc_timeout(mut self, timeout: Duration) -> Self {
        self.ssrc_timeout = Some(timeout);
        self
    }

    pub fn buffering(mut self, enabled: bool) -> Self {
        self.buffering = enabled;
        self
    }

    pub fn interleaved(mut self, rtp_channel: u8, rtcp_channel: u8) -> Self {
        self.rtp_channel = Some(rtp_channel);
        self.rtcp_channel = Some(rtcp_channel);
        self
    }

    pub fn track_id(mut self, track: TrackId) -> Self {
        self.track_id = track;
        self
    }

    pub fn payload_type(mut self, pt: u8) -> Self {
        self.payload_type = pt & 0x7f;
        self
    }

    pub fn id(&self) -> StreamId {
        StreamId::from(self.dest_addr)
    }

    /// Destination of the broadcaster's RTCP.
    pub fn rtcp_addr(&self) -> Result<SocketAddr> {
        let port = self
            .dest_addr
            .port()
            .checked_add(1)
            .ok_or(ReflectorError::PortRangeExhausted)?;
        Ok(SocketAddr::new(self.dest_addr.ip(), port))
    }

    /// Where receiver reports go.
    ///
    /// The address RTCP last arrived from wins, since that is what gets
    /// through a NAT. Otherwise the broadcaster's IP, otherwise the
    /// destination itself, on the RTCP port.
    pub fn rtcp_report_addr(&self, last_remote: Option<SocketAddr>) -> Option<SocketAddr> {
        if last_remote.is_some() {
            return last_remote;
        }
        let port = self.dest_addr.port().checked_add(1)?;
        let ip = self.source_ip.unwrap_or(self.dest_addr.ip());
        Some(SocketAddr::new(ip, port))
    }

    pub fn validate(&self) -> Result<()> {
        if self.dest_addr.port() == 0 {
            return Err(ReflectorError::InvalidDescriptor(
                "destination port must be set".to_string(),
            ));
        }
        if self.timescale == 0 {
            return Err(ReflectorError::InvalidDescriptor(
                "timescale must be non-zero".to_string(),
            ));
        }
        if self.rtp_channel.is_some() && self.rtp_channel == self.rtcp_channel {
            return Err(ReflectorError::InvalidDescriptor(
                "RTP and RTCP channels must differ".to_string(),
            ));
        }
        self.rtcp_addr().map(|_| ())
    }
}
