//! RTP reception statistics for receiver reports.
//!
//! Sequence tracking follows RFC 3550 appendix A.1 without the probation
//! step: the first packet seen for an SSRC initializes the state. Jitter is
//! the A.8 running estimate in RTP timestamp units.

use crate::packet::rtcp::{ReportBlock, ntp_middle32};
use crate::time::Millis;

const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;
const SEQ_MOD: u32 = 1 << 16;

#[derive(Debug, Clone)]
pub struct ReceptionStats {
    clock_rate: u32,
    ssrc: Option<u32>,
    base_seq: u32,
    max_seq: u16,
    cycles: u32,
    /// Set after a large jump; a following in-order packet confirms a restart.
    bad_seq: Option<u32>,
    received: u32,
    expected_prior: u32,
    received_prior: u32,
    last_transit: Option<i64>,
    jitter: f64,
    last_sr: u32,
    last_sr_arrival: Option<Millis>,
}

impl ReceptionStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: clock_rate.max(1),
            ssrc: None,
            base_seq: 0,
            max_seq: 0,
            cycles: 0,
            bad_seq: None,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            last_transit: None,
            jitter: 0.0,
            last_sr: 0,
            last_sr_arrival: None,
        }
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    /// Account for one forwarded RTP packet.
    pub fn update(&mut self, ssrc: u32, seq: u16, rtp_timestamp: u32, arrival: Millis) {
        if self.ssrc != Some(ssrc) {
            self.init(ssrc, seq);
        } else {
            let delta = seq.wrapping_sub(self.max_seq);
            if delta < MAX_DROPOUT {
                if seq < self.max_seq {
                    self.cycles += SEQ_MOD;
                }
                self.max_seq = seq;
            } else if delta <= u16::MAX - MAX_MISORDER {
                // big jump: accept it only if the next packet follows on
                if self.bad_seq == Some(u32::from(seq)) {
                    self.restart(seq);
                } else {
                    self.bad_seq = Some((u32::from(seq) + 1) & (SEQ_MOD - 1));
                    return;
                }
            }
            // otherwise a duplicate or reordered packet
        }
        self.received = self.received.wrapping_add(1);
        self.update_jitter(rtp_timestamp, arrival);
    }

    /// Remember the last sender report for LSR/DLSR.
    pub fn record_sender_report(&mut self, ntp: u64, arrival: Millis) {
        self.last_sr = ntp_middle32(ntp);
        self.last_sr_arrival = Some(arrival);
    }

    pub fn extended_highest_seq(&self) -> u32 {
        self.cycles.wrapping_add(u32::from(self.max_seq))
    }

    pub fn expected(&self) -> u32 {
        if self.ssrc.is_none() {
            return 0;
        }
        self.extended_highest_seq()
            .wrapping_sub(self.base_seq)
            .wrapping_add(1)
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Cumulative packets lost, never negative.
    pub fn cumulative_lost(&self) -> u32 {
        (i64::from(self.expected()) - i64::from(self.received)).max(0) as u32
    }

    /// Interarrival jitter in timestamp units.
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    /// Build a report block and start a new reporting interval.
    pub fn report_block(&mut self, now: Millis) -> Option<ReportBlock> {
        let ssrc = self.ssrc?;
        let expected = self.expected();
        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = self.received.wrapping_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = i64::from(expected_interval) - i64::from(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / i64::from(expected_interval)).min(255) as u8
        };

        let delay_since_last_sr = match self.last_sr_arrival {
            Some(at) => ((now - at).max(0) * 65_536 / 1000) as u32,
            None => 0,
        };

        Some(ReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost().min(0x00FF_FFFF),
            extended_highest_seq: self.extended_highest_seq(),
            jitter: self.jitter(),
            last_sr: self.last_sr,
            delay_since_last_sr,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.clock_rate);
    }

    fn init(&mut self, ssrc: u32, seq: u16) {
        let clock_rate = self.clock_rate;
        *self = Self::new(clock_rate);
        self.ssrc = Some(ssrc);
        self.restart(seq);
    }

    fn restart(&mut self, seq: u16) {
        self.base_seq = u32::from(seq);
        self.max_seq = seq;
        self.cycles = 0;
        self.bad_seq = None;
        self.received = 0;
        self.expected_prior = 0;
        self.received_prior = 0;
    }

    fn update_jitter(&mut self, rtp_timestamp: u32, arrival: Millis) {
        let arrival_units = arrival * i64::from(self.clock_rate) / 1000;
        let transit = arrival_units - i64::from(rtp_timestamp);
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
    }
}
