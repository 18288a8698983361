//! RTCP field accessors and the receiver-report compound packet (RFC 3550 §6).
//!
//! Sender report layout, as far as the reflector reads it:
//!
//! ```text
//! 0      4         8                 16        20
//! +------+---------+-----------------+---------+----
//! |V P RC| PT=200  |  SSRC  |  NTP timestamp   | RTP timestamp | ...
//! +------+---------+-----------------+---------+----
//! ```

use super::rtp::read_u32;

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_APP: u8 = 204;

const SDES_CNAME: u8 = 1;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Four-character name of the APP packet carrying the eye count.
pub const APP_NAME: &[u8; 4] = b"QTSS";

pub fn packet_type(buf: &[u8]) -> u8 {
    buf.get(1).copied().unwrap_or(0)
}

pub fn ssrc(buf: &[u8]) -> u32 {
    read_u32(buf, 4)
}

/// Version 2 with a packet type in the RTCP range.
pub fn is_valid(buf: &[u8]) -> bool {
    buf.len() >= 8 && buf[0] >> 6 == 2 && (192..=223).contains(&buf[1])
}

pub fn is_sender_report(buf: &[u8]) -> bool {
    packet_type(buf) == PT_SENDER_REPORT
}

/// 64-bit NTP timestamp of a sender report, or 0.
pub fn sr_ntp_timestamp(buf: &[u8]) -> u64 {
    if !is_sender_report(buf) || buf.len() < 16 {
        return 0;
    }
    ((read_u32(buf, 8) as u64) << 32) | read_u32(buf, 12) as u64
}

/// RTP timestamp of a sender report, or 0.
pub fn sr_rtp_timestamp(buf: &[u8]) -> u32 {
    if !is_sender_report(buf) || buf.len() < 20 {
        return 0;
    }
    read_u32(buf, 16)
}

/// Convert a 32.32 fixed-point NTP timestamp to Unix milliseconds.
pub fn ntp_to_unix_ms(ntp: u64) -> i64 {
    let secs = (ntp >> 32) as i64 - NTP_UNIX_OFFSET_SECS as i64;
    let frac_ms = ((ntp & 0xffff_ffff) * 1000) >> 32;
    secs * 1000 + frac_ms as i64
}

/// Middle 32 bits of an NTP timestamp (the "LSR" field of a report block).
pub fn ntp_middle32(ntp: u64) -> u32 {
    (ntp >> 16) as u32
}

/// Walk a compound RTCP packet and return the first sub-packet of type `pt`.
pub fn find_packet(buf: &[u8], pt: u8) -> Option<&[u8]> {
    let mut offset = 0;
    while offset + 4 <= buf.len() {
        let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let end = offset + (words + 1) * 4;
        if end > buf.len() {
            return None;
        }
        if buf[offset + 1] == pt {
            return Some(&buf[offset..end]);
        }
        offset = end;
    }
    None
}

/// Eye count carried by a `QTSS` APP packet inside a compound packet.
pub fn app_eye_count(buf: &[u8]) -> Option<u32> {
    let app = find_packet(buf, PT_APP)?;
    if app.len() < 16 || &app[8..12] != APP_NAME {
        return None;
    }
    Some(read_u32(app, 12))
}

/// One reception report block (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportBlock {
    /// Source being reported on.
    pub ssrc: u32,
    /// Fraction lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost (24-bit on the wire).
    pub cumulative_lost: u32,
    pub extended_highest_seq: u32,
    /// Interarrival jitter in timestamp units.
    pub jitter: u32,
    /// Middle 32 bits of the last sender report's NTP timestamp.
    pub last_sr: u32,
    /// Delay since that sender report, in 1/65536 seconds.
    pub delay_since_last_sr: u32,
}

/// Compound RR + SDES(CNAME) + APP(`QTSS`, eye count) sent toward the source.
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    pub reporter_ssrc: u32,
    pub block: Option<ReportBlock>,
    pub cname: String,
    pub eye_count: u32,
}

impl ReceiverReport {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);

        let report_count = self.block.is_some() as u8;
        let rr_words = 1 + 6 * report_count as u16;
        out.push(0x80 | report_count);
        out.push(PT_RECEIVER_REPORT);
        out.extend_from_slice(&rr_words.to_be_bytes());
        out.extend_from_slice(&self.reporter_ssrc.to_be_bytes());
        if let Some(block) = &self.block {
            out.extend_from_slice(&block.ssrc.to_be_bytes());
            let lost = block.cumulative_lost.min(0x7f_ffff);
            out.push(block.fraction_lost);
            out.extend_from_slice(&lost.to_be_bytes()[1..]);
            out.extend_from_slice(&block.extended_highest_seq.to_be_bytes());
            out.extend_from_slice(&block.jitter.to_be_bytes());
            out.extend_from_slice(&block.last_sr.to_be_bytes());
            out.extend_from_slice(&block.delay_since_last_sr.to_be_bytes());
        }

        let cname = &self.cname.as_bytes()[..self.cname.len().min(255)];
        // ssrc + item header + text + END, padded to a word boundary
        let chunk_len = (4 + 2 + cname.len() + 1).next_multiple_of(4);
        let sdes_words = (chunk_len / 4) as u16;
        out.push(0x81);
        out.push(PT_SDES);
        out.extend_from_slice(&sdes_words.to_be_bytes());
        let chunk_start = out.len();
        out.extend_from_slice(&self.reporter_ssrc.to_be_bytes());
        out.push(SDES_CNAME);
        out.push(cname.len() as u8);
        out.extend_from_slice(cname);
        out.resize(chunk_start + chunk_len, 0);

        out.push(0x80);
        out.push(PT_APP);
        out.extend_from_slice(&3u16.to_be_bytes());
        out.extend_from_slice(&self.reporter_ssrc.to_be_bytes());
        out.extend_from_slice(APP_NAME);
        out.extend_from_slice(&self.eye_count.to_be_bytes());

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender_report(ssrc: u32, ntp: u64, rtp_ts: u32) -> Vec<u8> {
        let mut buf = vec![0x80, PT_SENDER_REPORT, 0x00, 0x06];
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(&ntp.to_be_bytes());
        buf.extend_from_slice(&rtp_ts.to_be_bytes());
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf
    }

    #[test]
    fn sender_report_fields() {
        let ntp = ((NTP_UNIX_OFFSET_SECS + 10) << 32) | 0x8000_0000;
        let buf = sender_report(7, ntp, 90_000);

        assert!(is_valid(&buf));
        assert!(is_sender_report(&buf));
        assert_eq!(ssrc(&buf), 7);
        assert_eq!(sr_ntp_timestamp(&buf), ntp);
        assert_eq!(sr_rtp_timestamp(&buf), 90_000);
        assert_eq!(ntp_to_unix_ms(ntp), 10_500);
    }

    #[test]
    fn short_sender_report_reads_zero() {
        let buf = sender_report(7, 1 << 40, 5);
        assert_eq!(sr_ntp_timestamp(&buf[..15]), 0);
        assert_eq!(sr_rtp_timestamp(&buf[..19]), 0);
    }

    #[test]
    fn receiver_report_is_not_sender_report() {
        let buf = [0x80, PT_RECEIVER_REPORT, 0, 1, 0, 0, 0, 9];
        assert!(is_valid(&buf));
        assert_eq!(sr_ntp_timestamp(&buf), 0);
    }

    #[test]
    fn invalid_rtcp() {
        assert!(!is_valid(&[0x80, 96, 0, 0, 0, 0, 0, 0]));
        assert!(!is_valid(&[0x40, 200, 0, 0, 0, 0, 0, 0]));
        assert!(!is_valid(&[0x80, 200, 0]));
    }

    #[test]
    fn ntp_middle_bits() {
        assert_eq!(ntp_middle32(0x1122_3344_5566_7788), 0x3344_5566);
    }

    #[test]
    fn compound_report_layout() {
        let report = ReceiverReport {
            reporter_ssrc: 0x0102_0304,
            block: Some(ReportBlock {
                ssrc: 42,
                fraction_lost: 25,
                cumulative_lost: 3,
                extended_highest_seq: 0x0001_0005,
                jitter: 12,
                last_sr: 0,
                delay_since_last_sr: 0,
            }),
            cname: "relay".to_string(),
            eye_count: 7,
        };
        let buf = report.marshal();

        assert_eq!(buf.len() % 4, 0);
        let rr = find_packet(&buf, PT_RECEIVER_REPORT).unwrap();
        assert_eq!(rr.len(), 32);
        assert_eq!(rr[0] & 0x1f, 1);
        assert_eq!(ssrc(rr), 0x0102_0304);
        assert_eq!(read_u32(rr, 8), 42);
        assert_eq!(rr[12], 25);
        assert_eq!(&rr[13..16], &[0, 0, 3]);
        assert_eq!(read_u32(rr, 16), 0x0001_0005);

        let sdes = find_packet(&buf, PT_SDES).unwrap();
        assert_eq!(sdes[8], 1);
        assert_eq!(sdes[9], 5);
        assert_eq!(&sdes[10..15], b"relay");

        assert_eq!(app_eye_count(&buf), Some(7));
    }

    #[test]
    fn report_without_block() {
        let report = ReceiverReport {
            reporter_ssrc: 1,
            block: None,
            cname: String::new(),
            eye_count: 0,
        };
        let buf = report.marshal();
        let rr = find_packet(&buf, PT_RECEIVER_REPORT).unwrap();
        assert_eq!(rr.len(), 8);
        assert_eq!(rr[0] & 0x1f, 0);
        assert_eq!(app_eye_count(&buf), Some(0));
    }

    #[test]
    fn find_packet_rejects_overrun() {
        let buf = [0x80, PT_SDES, 0x00, 0x10, 0, 0, 0, 0];
        assert!(find_packet(&buf, PT_SDES).is_none());
    }
}
