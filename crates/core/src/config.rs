//! Reflector configuration.

use std::time::Duration;


/// Engine-wide tuning knobs shared by every stream, sender and socket.
///
/// Defaults follow the long-standing reflector preferences: 16 buckets of
/// 16 outputs each, 73 ms between bucket cohorts, a 10 second buffer window
/// and receiver reports every 5 seconds.
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Number of buckets allocated for a fresh stream.
    pub min_buckets: usize,
    /// Output slots per bucket.
    pub bucket_size: usize,
    /// Extra delivery delay applied per bucket index.
    pub bucket_delay: Duration,
    /// Packets older than this are released even if an output still needs them.
    pub max_packet_age: Duration,
    /// Window of recent packets kept for new outputs when buffering is enabled.
    pub overbuffer: Duration,
    /// Interval between RTCP receiver reports sent toward the source.
    pub receiver_report_interval: Duration,
    /// Averaging interval for the stream bit rate.
    pub bit_rate_interval: Duration,
    /// Silence after which the learned SSRC is forgotten and re-learned.
    pub ssrc_timeout: Duration,
    /// How often an attached broadcaster session is kept alive.
    pub broadcaster_refresh_interval: Duration,
    /// Buffers each socket allocates up front.
    pub preallocated_packets: usize,
    /// Maximum datagrams read by one socket invocation.
    pub max_packets_per_pass: usize,
    /// How long a socket task sleeps when the socket has nothing to read.
    pub socket_poll_interval: Duration,
    /// Output lag after which droppable packets are skipped for that output.
    pub thinning_lag: Duration,
    /// Size of the duplicate-suppression sequence window.
    pub dedup_window: usize,
    /// Payload bytes per RTP packet produced by relay packetization.
    pub relay_payload_size: usize,
    /// Scheduler worker threads.
    pub worker_threads: usize,
    /// CNAME advertised in RTCP receiver reports.
    pub cname: String,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            min_buckets: 16,
            bucket_size: 16,
            bucket_delay: Duration::from_millis(73),
            max_packet_age: Duration::from_secs(10),
            overbuffer: Duration::from_secs(10),
            receiver_report_interval: Duration::from_secs(5),
            bit_rate_interval: Duration::from_secs(30),
            ssrc_timeout: Duration::from_secs(30),
            broadcaster_refresh_interval: Duration::from_secs(10),
            preallocated_packets: 10,
            max_packets_per_pass: 64,
            socket_poll_interval: Duration::from_millis(10),
            thinning_lag: Duration::from_millis(1500),
            dedup_window: 100,
            relay_payload_size: 1400,
            worker_threads: 2,
            cname: "reflector".to_string(),
        }
    }
}

impl ReflectorConfig {
    /// Set the initial number of buckets (at least 1).
    pub fn min_buckets(mut self, count: usize) -> Self {
        self.min_buckets = count.max(1);
        self
    }

    /// Set the number of slots per bucket (at least 1).
    pub fn bucket_size(mut self, size: usize) -> Self {
        self.bucket_size = size.max(1);
        self
    }

    /// Set the per-bucket delivery stagger.
    pub fn bucket_delay(mut self, delay: Duration) -> Self {
        self.bucket_delay = delay;
        self
    }

    /// Set the maximum packet retention age.
    pub fn max_packet_age(mut self, age: Duration) -> Self {
        self.max_packet_age = age;
        self
    }

    /// Set the buffer window replayed to new outputs on buffered streams.
    pub fn overbuffer(mut self, window: Duration) -> Self {
        self.overbuffer = window;
        self
    }

    /// Set the receiver-report cadence.
    pub fn receiver_report_interval(mut self, interval: Duration) -> Self {
        self.receiver_report_interval = interval;
        self
    }

    /// Set the bit-rate averaging interval.
    pub fn bit_rate_interval(mut self, interval: Duration) -> Self {
        self.bit_rate_interval = interval;
        self
    }

    /// Set the SSRC re-learning timeout.
    pub fn ssrc_timeout(mut self, timeout: Duration) -> Self {
        self.ssrc_timeout = timeout;
        self
    }

    /// Set the output lag that triggers thinning.
    pub fn thinning_lag(mut self, lag: Duration) -> Self {
        self.thinning_lag = lag;
        self
    }

    /// Set the duplicate-suppression window (at least 1).
    pub fn dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window.max(1);
        self
    }

    /// Set the scheduler worker count (at least 1).
    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers.max(1);
        self
    }

    /// Set the RTCP CNAME.
    pub fn cname(mut self, cname: impl Into<String>) -> Self {
        self.cname = cname.into();
        self
    }
}
