//! RTP fixed header (RFC 3550 §5.1).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The free functions read fields from a raw datagram and return 0 when the
//! datagram is too short. [`RtpHeader`] writes headers for payloads that are
//! injected into a stream without RTP framing of their own.

/// Length of the fixed RTP header.
pub const HEADER_LEN: usize = 12;

pub fn version(buf: &[u8]) -> u8 {
    buf.first().map_or(0, |b| *b >> 6)
}

pub fn marker(buf: &[u8]) -> bool {
    buf.get(1).is_some_and(|b| *b & 0x80 != 0)
}

pub fn payload_type(buf: &[u8]) -> u8 {
    buf.get(1).map_or(0, |b| *b & 0x7f)
}

pub fn sequence_number(buf: &[u8]) -> u16 {
    match buf.get(2..4) {
        Some(b) => u16::from_be_bytes([b[0], b[1]]),
        None => 0,
    }
}

pub fn timestamp(buf: &[u8]) -> u32 {
    read_u32(buf, 4)
}

pub fn ssrc(buf: &[u8]) -> u32 {
    read_u32(buf, 8)
}

/// Version 2 with the fixed header and CSRC list inside the datagram.
pub fn is_valid(buf: &[u8]) -> bool {
    if buf.len() < HEADER_LEN || version(buf) != 2 {
        return false;
    }
    let csrc_count = (buf[0] & 0x0f) as usize;
    HEADER_LEN + csrc_count * 4 <= buf.len()
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    match buf.get(offset..offset + 4) {
        Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

/// RTP fixed header writer.
///
/// - **Sequence number**: 16-bit, wrapping, incremented on every write.
/// - **Timestamp**: kept as u64 internally; the lower 32 bits go on the wire.
/// - **SSRC**: random per stream (RFC 3550 §8.1) unless given explicitly.
///
/// Version is always 2. Padding, extension and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier.
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            pt: pt & 0x7f,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn with_random_ssrc(pt: u8) -> Self {
        Self::new(pt, rand::random::<u32>())
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        self.sequence = sequence;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp as u64;
    }

    /// Serialize the 12-byte header and advance the sequence number.
    pub fn write(&mut self, marker: bool) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | self.pt;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// Splits raw relay payloads into RTP packets for a stream.
///
/// Every fragment of one payload shares the payload's RTP timestamp; the
/// marker bit is set on the last fragment.
#[derive(Debug)]
pub struct RelayPacketizer {
    header: RtpHeader,
    payload_size: usize,
}

impl RelayPacketizer {
    pub fn new(pt: u8, payload_size: usize) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            payload_size: payload_size.max(1),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    pub fn packetize(&mut self, payload: &[u8], rtp_timestamp: u32) -> Vec<Vec<u8>> {
        self.header.set_timestamp(rtp_timestamp);
        if payload.is_empty() {
            return Vec::new();
        }

        let count = payload.len().div_ceil(self.payload_size);
        let mut packets = Vec::with_capacity(count);
        for (i, chunk) in payload.chunks(self.payload_size).enumerate() {
            let header = self.header.write(i + 1 == count);
            let mut packet = Vec::with_capacity(HEADER_LEN + chunk.len());
            packet.extend_from_slice(&header);
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }
        packets
    }
}
