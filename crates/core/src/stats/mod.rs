//! Relay counters and per-stream status.
//!
//! Each stream is handed a [`RelayStats`] at construction instead of bumping
//! process-wide globals. Counters are plain atomics; [`RelayStats::take`]
//! reads and clears them in one go for interval reporting.

pub mod bitrate;
pub mod reception;

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

pub use bitrate::BitRateMeter;
pub use reception::ReceptionStats;

#[derive(Debug, Default)]
pub struct RelayStats {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    malformed: AtomicU64,
    ssrc_rejected: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
    thinned: AtomicU64,
    delivered: AtomicU64,
    bytes_delivered: AtomicU64,
    delivery_failures: AtomicU64,
    evicted_undelivered: AtomicU64,
    receiver_reports: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Datagrams too short or with a bad version, dropped on receive.
    pub malformed: u64,
    /// Packets dropped because their SSRC did not match the learned one.
    pub ssrc_rejected: u64,
    pub duplicates: u64,
    /// Packets forwarded even though they arrived out of sequence.
    pub out_of_order: u64,
    /// Packet deliveries skipped for a lagging output.
    pub thinned: u64,
    pub delivered: u64,
    pub bytes_delivered: u64,
    pub delivery_failures: u64,
    /// Packet deliveries lost because the packet aged out first.
    pub evicted_undelivered: u64,
    pub receiver_reports: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ssrc_rejected(&self) {
        self.ssrc_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_thinned(&self) {
        self.thinned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, bytes: usize) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.evicted_undelivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_receiver_report(&self) {
        self.receiver_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|counter| counter.load(Ordering::Relaxed))
    }

    /// Read and clear every counter.
    pub fn take(&self) -> StatsSnapshot {
        self.collect(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: read(&self.packets_received),
            bytes_received: read(&self.bytes_received),
            malformed: read(&self.malformed),
            ssrc_rejected: read(&self.ssrc_rejected),
            duplicates: read(&self.duplicates),
            out_of_order: read(&self.out_of_order),
            thinned: read(&self.thinned),
            delivered: read(&self.delivered),
            bytes_delivered: read(&self.bytes_delivered),
            delivery_failures: read(&self.delivery_failures),
            evicted_undelivered: read(&self.evicted_undelivered),
            receiver_reports: read(&self.receiver_reports),
        }
    }
}

impl AddAssign for StatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.packets_received += other.packets_received;
        self.bytes_received += other.bytes_received;
        self.malformed += other.malformed;
        self.ssrc_rejected += other.ssrc_rejected;
        self.duplicates += other.duplicates;
        self.out_of_order += other.out_of_order;
        self.thinned += other.thinned;
        self.delivered += other.delivered;
        self.bytes_delivered += other.bytes_delivered;
        self.delivery_failures += other.delivery_failures;
        self.evicted_undelivered += other.evicted_undelivered;
        self.receiver_reports += other.receiver_reports;
    }
}

/// Status of one stream as exposed to an operational surface.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    pub bit_rate: u64,
    pub eye_count: u32,
    pub source_usable: bool,
    pub rtp_queue_len: usize,
    pub rtcp_queue_len: usize,
    /// Cumulative loss seen from the source.
    pub lost: u32,
    /// Interarrival jitter in RTP timestamp units.
    pub jitter: u32,
    pub counters: StatsSnapshot,
}
