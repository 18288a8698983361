//! The unit of reflection: one broadcast source fanned out to many outputs.
//!
//! A [`ReflectorStream`] owns the bucket table of attached outputs, one
//! [`Sender`] per packet kind, the duplicate filter and the reception
//! statistics for its source. Packets reach it either from its bound
//! [`SocketPair`] or through the push entry points used for interleaved and
//! programmatic relay sources.
//!
//! All mutable delivery state sits behind a single lock. It is held for one
//! queue or table mutation or one delivery pass, never across a blocking
//! call, so removing an output can not race a pass that is delivering to it.

pub mod info;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::bucket::{BucketTable, OutputSlot};
use crate::config::ReflectorConfig;
use crate::dedup::{DuplicateFilter, SeqStatus};
use crate::error::Result;
use crate::output::{Output, OutputId};
use crate::packet::rtcp::{self, ReceiverReport};
use crate::packet::rtp::RelayPacketizer;
use crate::packet::{PacketKind, PacketPool, SharedPacket};
use crate::scheduler::Task;
use crate::sender::{ReflectContext, Sender};
use crate::socket::{BroadcasterSession, SocketPair, SocketPool, SsrcFilter};
use crate::stats::{BitRateMeter, ReceptionStats, RelayStats, StreamStats};
use crate::thinning::{NoThinning, ThinningPolicy};
use crate::time::{Millis, duration_ms, milliseconds};

pub use info::{SourceDescriptor, StreamId};

/// First sender report's mapping between RTP and wall-clock time.
#[derive(Debug, Clone, Copy)]
struct ClockAnchor {
    rtp_time: u32,
    ntp_ms: i64,
}

struct StreamInner {
    buckets: BucketTable,
    senders: [Sender; 2],
    dedup: DuplicateFilter,
    reception: ReceptionStats,
    push_filter: SsrcFilter,
    anchor: Option<ClockAnchor>,
    policy: Arc<dyn ThinningPolicy>,
    eye_count: u32,
    next_receiver_report: Millis,
    last_rtcp_remote: Option<SocketAddr>,
    packetizer: RelayPacketizer,
}

pub struct ReflectorStream {
    id: StreamId,
    descriptor: SourceDescriptor,
    config: Arc<ReflectorConfig>,
    inner: Mutex<StreamInner>,
    sockets: Mutex<Option<Arc<SocketPair>>>,
    /// Buffers for pushed packets.
    pool: Arc<PacketPool>,
    stats: Arc<RelayStats>,
    bit_rate: BitRateMeter,
    usable: AtomicBool,
    closed: AtomicBool,
}

impl ReflectorStream {
    pub fn new(
        descriptor: SourceDescriptor,
        config: Arc<ReflectorConfig>,
        stats: Arc<RelayStats>,
    ) -> Arc<Self> {
        let now = milliseconds();
        let ssrc_timeout = descriptor.ssrc_timeout.unwrap_or(config.ssrc_timeout);
        let inner = StreamInner {
            buckets: BucketTable::new(
                config.min_buckets,
                config.bucket_size,
                duration_ms(config.bucket_delay),
            ),
            senders: [Sender::new(PacketKind::Rtp), Sender::new(PacketKind::Rtcp)],
            dedup: DuplicateFilter::new(config.dedup_window),
            reception: ReceptionStats::new(descriptor.timescale),
            push_filter: SsrcFilter::new(descriptor.ssrc_filter, duration_ms(ssrc_timeout)),
            anchor: None,
            policy: Arc::new(NoThinning),
            eye_count: 0,
            next_receiver_report: now + duration_ms(config.receiver_report_interval),
            last_rtcp_remote: None,
            packetizer: RelayPacketizer::new(descriptor.payload_type, config.relay_payload_size),
        };

        Arc::new(Self {
            id: descriptor.id(),
            bit_rate: BitRateMeter::new(duration_ms(config.bit_rate_interval), now),
            pool: PacketPool::with_preallocated(0),
            descriptor,
            config,
            inner: Mutex::new(inner),
            sockets: Mutex::new(None),
            stats,
            usable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// Attach the stream to its source's socket pair.
    ///
    /// Returns true when the pair was bound by this call (and so still needs
    /// its socket tasks scheduled).
    pub fn bind(self: &Arc<Self>, sockets: &SocketPool) -> Result<bool> {
        let mut bound = self.sockets.lock();
        if bound.is_some() {
            return Ok(false);
        }

        let (pair, fresh) = sockets.acquire(self.descriptor.dest_addr)?;
        if fresh {
            let timeout = self
                .descriptor
                .ssrc_timeout
                .unwrap_or(self.config.ssrc_timeout);
            pair.rtp()
                .set_ssrc_filter(self.descriptor.ssrc_filter, duration_ms(timeout));
        }
        for kind in PacketKind::ALL {
            pair.socket(kind).add_sender(self);
        }
        *bound = Some(pair);
        self.usable.store(true, Ordering::SeqCst);

        tracing::info!(stream = %self.id, shared = !fresh, "stream bound");
        Ok(fresh)
    }

    /// Detach from the sockets and retire the stream's task.
    ///
    /// Returns true when a socket pair was released.
    pub fn unbind(&self, sockets: &SocketPool) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        let Some(pair) = self.sockets.lock().take() else {
            return false;
        };
        for kind in PacketKind::ALL {
            pair.socket(kind).remove_sender(self.id);
        }
        sockets.release(pair.addr());
        tracing::info!(stream = %self.id, "stream unbound");
        true
    }

    pub fn sockets(&self) -> Option<Arc<SocketPair>> {
        self.sockets.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach an output and return the bucket it landed in.
    ///
    /// The output starts with the next packet to arrive, or with the whole
    /// buffered window when the source is buffered.
    pub fn add_output(&self, output: Arc<dyn Output>, preferred: Option<usize>) -> Result<usize> {
        let id = output.id();
        let mut inner = self.inner.lock();
        let start = inner
            .senders
            .each_ref()
            .map(|s| s.first_packet_for_new_output(self.descriptor.buffering));
        let live_from = inner.senders.each_ref().map(Sender::next_id);

        let attached = inner.buckets.contains(id);
        let bucket = inner
            .buckets
            .add(OutputSlot::new(output, start, live_from), preferred)?;
        if !attached {
            inner.eye_count += 1;
        }

        tracing::debug!(stream = %self.id, output = %id, bucket, eyes = inner.eye_count, "output attached");
        Ok(bucket)
    }

    pub fn remove_output(&self, id: OutputId) -> bool {
        let mut inner = self.inner.lock();
        if inner.buckets.remove(id).is_none() {
            return false;
        }
        inner.eye_count -= 1;
        tracing::debug!(stream = %self.id, output = %id, eyes = inner.eye_count, "output detached");
        true
    }

    /// Detach every output, calling its `tear_down` hook. Returns how many.
    pub fn teardown_all_outputs(&self) -> usize {
        let slots = {
            let mut inner = self.inner.lock();
            inner.eye_count = 0;
            inner.buckets.drain()
        };
        for slot in &slots {
            slot.output().tear_down();
        }
        if !slots.is_empty() {
            tracing::debug!(stream = %self.id, outputs = slots.len(), "outputs torn down");
        }
        slots.len()
    }

    pub fn push_packet(&self, data: &[u8], is_rtcp: bool) -> bool {
        self.push_packet_at(milliseconds(), data, is_rtcp)
    }

    /// Inject one datagram as if it had arrived on the stream's socket at `now`.
    pub fn push_packet_at(&self, now: Millis, data: &[u8], is_rtcp: bool) -> bool {
        let kind = PacketKind::from_rtcp_flag(is_rtcp);
        let mut packet = self.pool.acquire();
        if !packet.set(data) {
            tracing::trace!(stream = %self.id, len = data.len(), "oversized pushed packet dropped");
            self.stats.record_malformed();
            self.pool.recycle(packet);
            return false;
        }
        packet.stamp(kind, now);
        if !packet.is_well_formed() {
            tracing::trace!(stream = %self.id, len = data.len(), "malformed pushed packet dropped");
            self.stats.record_malformed();
            self.pool.recycle(packet);
            return false;
        }
        if !is_rtcp && !self.inner.lock().push_filter.accept(packet.ssrc(), now) {
            self.stats.record_ssrc_rejected();
            self.pool.recycle(packet);
            return false;
        }

        let shared = self.pool.share(packet);
        self.ingest(now, shared, None)
    }

    /// Route a packet from an interleaved control connection by channel.
    pub fn push_interleaved(&self, channel: u8, data: &[u8]) -> bool {
        if self.descriptor.rtp_channel == Some(channel) {
            self.push_packet(data, false)
        } else if self.descriptor.rtcp_channel == Some(channel) {
            self.push_packet(data, true)
        } else {
            tracing::trace!(stream = %self.id, channel, "packet on unknown channel dropped");
            false
        }
    }

    /// Packetize a raw media payload with the stream's own SSRC and push it.
    ///
    /// Returns the number of RTP packets accepted.
    pub fn push_relay_payload(&self, payload: &[u8], rtp_timestamp: u32) -> usize {
        let packets = self
            .inner
            .lock()
            .packetizer
            .packetize(payload, rtp_timestamp);
        let now = milliseconds();
        packets
            .iter()
            .filter(|packet| self.push_packet_at(now, packet, false))
            .count()
    }

    /// Queue a packet that passed the socket's checks.
    pub(crate) fn ingest(
        &self,
        now: Millis,
        packet: SharedPacket,
        remote: Option<SocketAddr>,
    ) -> bool {
        let len = packet.len();
        let mut inner = self.inner.lock();

        match packet.kind() {
            PacketKind::Rtp => {
                let ssrc = packet.ssrc();
                if inner.reception.ssrc().is_some_and(|known| known != ssrc) {
                    inner.dedup.reset();
                }
                let status = inner.dedup.check(packet.sequence_number());
                if status == SeqStatus::Duplicate {
                    self.stats.record_duplicate();
                    tracing::trace!(stream = %self.id, seq = packet.sequence_number(), "duplicate dropped");
                    return false;
                }
                if status.is_out_of_order() {
                    self.stats.record_out_of_order();
                }
                inner.reception.update(
                    ssrc,
                    packet.sequence_number(),
                    packet.rtp_timestamp(),
                    packet.arrival(),
                );
            }
            PacketKind::Rtcp => {
                if rtcp::ssrc(packet.as_bytes()) == inner.packetizer.ssrc() {
                    // our own receiver report, looped back
                    tracing::trace!(stream = %self.id, "own RTCP dropped");
                    return false;
                }
                if remote.is_some() {
                    inner.last_rtcp_remote = remote;
                }
                if rtcp::is_sender_report(packet.as_bytes()) {
                    let ntp = rtcp::sr_ntp_timestamp(packet.as_bytes());
                    if ntp != 0 {
                        inner.reception.record_sender_report(ntp, now);
                        if inner.anchor.is_none() {
                            let anchor = ClockAnchor {
                                rtp_time: packet.rtp_timestamp(),
                                ntp_ms: packet.ntp_time_ms(),
                            };
                            tracing::debug!(
                                stream = %self.id,
                                rtp_time = anchor.rtp_time,
                                ntp_ms = anchor.ntp_ms,
                                "wall clock anchored"
                            );
                            inner.anchor = Some(anchor);
                        }
                    }
                }
            }
        }

        self.stats.record_received(len);
        self.bit_rate.record(len);
        inner.senders[packet.kind().index()].enqueue(packet);
        true
    }

    /// Run a delivery pass for both senders and send a receiver report if
    /// one is due. Returns the next time the stream needs attention.
    pub fn reflect_packets(&self, now: Millis) -> Option<Millis> {
        let pair = self.sockets();
        let (report, next_wake) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let ctx = ReflectContext {
                track: self.descriptor.track_id,
                policy: inner.policy.as_ref(),
                thinning_lag: duration_ms(self.config.thinning_lag),
                max_packet_age: duration_ms(self.config.max_packet_age),
                overbuffer: self
                    .descriptor
                    .buffering
                    .then(|| duration_ms(self.config.overbuffer)),
                stats: &self.stats,
            };

            let mut next_wake: Option<Millis> = None;
            for sender in inner.senders.iter_mut() {
                if let Some(at) = sender.reflect_packets(now, &mut inner.buckets, &ctx) {
                    next_wake = Some(next_wake.map_or(at, |w| w.min(at)));
                }
            }

            let mut report = None;
            if now >= inner.next_receiver_report {
                inner.next_receiver_report =
                    now + duration_ms(self.config.receiver_report_interval);
                if pair.is_some() {
                    report = self.build_receiver_report(inner, now);
                }
            }
            let rr_due = inner.next_receiver_report;
            (report, Some(next_wake.map_or(rr_due, |w| w.min(rr_due))))
        };

        self.bit_rate.update(now);

        if let (Some((bytes, target)), Some(pair)) = (report, pair) {
            match pair.rtcp().send_to(&bytes, target) {
                Ok(_) => {
                    self.stats.record_receiver_report();
                    tracing::debug!(stream = %self.id, target = %target, "receiver report sent");
                }
                Err(e) => {
                    tracing::warn!(stream = %self.id, target = %target, error = %e, "receiver report failed");
                }
            }
        }

        next_wake
    }

    /// Run [`reflect_packets`](Self::reflect_packets) only when a sender has
    /// new or due packets or a report is due.
    pub fn reflect_if_due(&self, now: Millis) -> Option<Millis> {
        let (due, next) = {
            let inner = self.inner.lock();
            let due = now >= inner.next_receiver_report
                || inner.senders.iter().any(|s| s.should_reflect_now(now));
            let next = inner
                .senders
                .iter()
                .filter_map(Sender::next_time_to_run)
                .fold(inner.next_receiver_report, Millis::min);
            (due, next)
        };
        if due { self.reflect_packets(now) } else { Some(next) }
    }

    fn build_receiver_report(
        &self,
        inner: &mut StreamInner,
        now: Millis,
    ) -> Option<(Vec<u8>, SocketAddr)> {
        let target = self.descriptor.rtcp_report_addr(inner.last_rtcp_remote)?;
        let block = inner.reception.report_block(now)?;
        let report = ReceiverReport {
            reporter_ssrc: inner.packetizer.ssrc(),
            block: Some(block),
            cname: self.config.cname.clone(),
            eye_count: inner.eye_count,
        };
        Some((report.marshal(), target))
    }

    pub fn eye_count(&self) -> u32 {
        self.inner.lock().eye_count
    }

    /// Source bit rate over the last completed averaging interval.
    pub fn bit_rate(&self) -> u64 {
        self.bit_rate.bits_per_second()
    }

    pub fn relay_stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn stats(&self) -> StreamStats {
        let inner = self.inner.lock();
        StreamStats {
            bit_rate: self.bit_rate(),
            eye_count: inner.eye_count,
            source_usable: self.is_source_usable(),
            rtp_queue_len: inner.senders[PacketKind::Rtp.index()].queue_len(),
            rtcp_queue_len: inner.senders[PacketKind::Rtcp.index()].queue_len(),
            lost: inner.reception.cumulative_lost(),
            jitter: inner.reception.jitter(),
            counters: self.stats.snapshot(),
        }
    }

    /// Convert an RTP timestamp to Unix milliseconds.
    ///
    /// Uses the first sender report seen. The mapping is never re-anchored,
    /// so clock drift between source and relay accumulates over long runs.
    pub fn rtp_time_to_wall_clock(&self, rtp_time: u32) -> Option<i64> {
        let anchor = self.inner.lock().anchor?;
        let ticks = i64::from(rtp_time.wrapping_sub(anchor.rtp_time) as i32);
        Some(anchor.ntp_ms + ticks * 1000 / i64::from(self.descriptor.timescale))
    }

    pub fn set_thinning_policy(&self, policy: Arc<dyn ThinningPolicy>) {
        self.inner.lock().policy = policy;
    }

    /// Keep `session` alive from both source sockets. False when unbound.
    pub fn set_broadcaster_session(&self, session: Option<Arc<dyn BroadcasterSession>>) -> bool {
        let Some(pair) = self.sockets() else {
            return false;
        };
        for kind in PacketKind::ALL {
            pair.socket(kind).set_broadcaster_session(session.clone());
        }
        true
    }

    pub fn is_source_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_unusable(&self) {
        if self.usable.swap(false, Ordering::SeqCst) {
            tracing::warn!(stream = %self.id, "source marked unusable");
        }
    }
}

impl Task for ReflectorStream {
    fn run(&self, now: Millis) -> Option<Millis> {
        if self.is_closed() {
            tracing::debug!(stream = %self.id, "stream task retired");
            return None;
        }
        let poll = now + duration_ms(self.config.socket_poll_interval);
        Some(self.reflect_if_due(now).map_or(poll, |at| at.clamp(now, poll)))
    }
}

impl std::fmt::Debug for ReflectorStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectorStream")
            .field("id", &self.id)
            .field("usable", &self.is_source_usable())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::TrackId;
    use crate::packet::rtp::{self, RtpHeader};
    use std::io;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Recorder {
        id: OutputId,
        packets: parking_lot::Mutex<Vec<(Vec<u8>, bool)>>,
        fail_next: AtomicU32,
        only: Option<PacketKind>,
        torn_down: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Self::wanting(None)
        }

        fn wanting(only: Option<PacketKind>) -> Arc<Self> {
            Arc::new(Self {
                id: OutputId::next(),
                packets: parking_lot::Mutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
                only,
                torn_down: AtomicBool::new(false),
            })
        }

        fn rtp_seqs(&self) -> Vec<u16> {
            self.packets
                .lock()
                .iter()
                .filter(|(_, is_rtcp)| !is_rtcp)
                .map(|(bytes, _)| rtp::sequence_number(bytes))
                .collect()
        }

        fn rtcp_count(&self) -> usize {
            self.packets.lock().iter().filter(|(_, r)| *r).count()
        }
    }

    impl Output for Recorder {
        fn id(&self) -> OutputId {
            self.id
        }

        fn accept(&self, packet: &[u8], is_rtcp: bool, _track: TrackId) -> io::Result<()> {
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(io::Error::other("congested"));
            }
            self.packets.lock().push((packet.to_vec(), is_rtcp));
            Ok(())
        }

        fn wants(&self, kind: PacketKind) -> bool {
            self.only.is_none_or(|only| only == kind)
        }

        fn tear_down(&self) {
            self.torn_down.store(true, Ordering::SeqCst);
        }
    }

    fn stream_with(config: ReflectorConfig, descriptor: SourceDescriptor) -> Arc<ReflectorStream> {
        ReflectorStream::new(descriptor, Arc::new(config), Arc::new(RelayStats::new()))
    }

    fn stream() -> Arc<ReflectorStream> {
        stream_with(
            ReflectorConfig::default(),
            SourceDescriptor::new("127.0.0.1:5004".parse().unwrap()),
        )
    }

    fn rtp_bytes(seq: u16, ssrc: u32) -> Vec<u8> {
        let mut header = RtpHeader::new(96, ssrc);
        header.set_sequence(seq);
        header.set_timestamp(u32::from(seq) * 3000);
        let mut bytes = header.write(false).to_vec();
        bytes.extend_from_slice(&[0xAB; 32]);
        bytes
    }

    fn sender_report(ssrc: u32, unix_secs: u64, rtp_time: u32) -> Vec<u8> {
        let mut sr = vec![0x80, rtcp::PT_SENDER_REPORT, 0, 6];
        sr.extend_from_slice(&ssrc.to_be_bytes());
        sr.extend_from_slice(&((unix_secs + rtcp::NTP_UNIX_OFFSET_SECS) as u32).to_be_bytes());
        sr.extend_from_slice(&0u32.to_be_bytes());
        sr.extend_from_slice(&rtp_time.to_be_bytes());
        sr.extend_from_slice(&[0; 8]);
        sr
    }

    #[test]
    fn duplicate_sequence_delivered_once() {
        let stream = stream();
        let a = Recorder::new();
        let b = Recorder::new();
        stream.add_output(a.clone(), None).unwrap();
        stream.add_output(b.clone(), None).unwrap();

        for seq in [1, 2, 2, 3] {
            stream.push_packet_at(0, &rtp_bytes(seq, 42), false);
        }
        stream.reflect_packets(1_000);

        assert_eq!(a.rtp_seqs(), vec![1, 2, 3]);
        assert_eq!(b.rtp_seqs(), vec![1, 2, 3]);
        let counters = stream.stats().counters;
        assert_eq!(counters.duplicates, 1);
        assert_eq!(counters.packets_received, 3);
    }

    #[test]
    fn twenty_outputs_all_placed() {
        let stream = stream_with(
            ReflectorConfig::default().bucket_size(1),
            SourceDescriptor::new("127.0.0.1:5004".parse().unwrap()),
        );
        let outputs: Vec<_> = (0..20).map(|_| Recorder::new()).collect();
        let mut buckets = Vec::new();
        for output in &outputs {
            buckets.push(stream.add_output(output.clone(), None).unwrap());
        }
        buckets.sort_unstable();
        buckets.dedup();
        assert_eq!(buckets.len(), 20);
        assert_eq!(stream.eye_count(), 20);
        assert!(stream.inner.lock().buckets.num_buckets() > 16);

        stream.push_packet_at(0, &rtp_bytes(7, 42), false);
        stream.reflect_packets(5_000);
        for output in &outputs {
            assert_eq!(output.rtp_seqs(), vec![7]);
        }
    }

    #[test]
    fn failing_output_does_not_affect_others() {
        let stream = stream();
        let healthy = Recorder::new();
        let failing = Recorder::new();
        failing.fail_next.store(3, Ordering::SeqCst);
        stream.add_output(healthy.clone(), Some(0)).unwrap();
        stream.add_output(failing.clone(), Some(0)).unwrap();

        for seq in 1..=3 {
            stream.push_packet_at(0, &rtp_bytes(seq, 42), false);
            stream.reflect_packets(i64::from(seq) * 20);
        }
        assert_eq!(healthy.rtp_seqs(), vec![1, 2, 3]);
        assert!(failing.rtp_seqs().is_empty());
        assert_eq!(stream.relay_stats().snapshot().delivery_failures, 3);

        stream.reflect_packets(100);
        assert_eq!(failing.rtp_seqs(), vec![1, 2, 3]);
    }

    #[test]
    fn removed_output_gets_nothing_more() {
        let stream = stream();
        let output = Recorder::new();
        stream.add_output(output.clone(), None).unwrap();
        stream.push_packet_at(0, &rtp_bytes(1, 42), false);
        stream.reflect_packets(10);

        assert!(stream.remove_output(output.id()));
        assert!(!stream.remove_output(output.id()));
        assert_eq!(stream.eye_count(), 0);

        stream.push_packet_at(20, &rtp_bytes(2, 42), false);
        stream.reflect_packets(30);
        assert_eq!(output.rtp_seqs(), vec![1]);
    }

    #[test]
    fn output_removed_mid_stream_from_another_thread() {
        use std::sync::atomic::AtomicU16;

        let stream = stream();
        let removed = Recorder::new();
        let kept = Recorder::new();
        stream.add_output(removed.clone(), Some(0)).unwrap();
        stream.add_output(kept.clone(), Some(0)).unwrap();

        let last_pushed = AtomicU16::new(0);
        let mut pushed_before_removal = 0;
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for seq in 1..=2_000u16 {
                    let now = Millis::from(seq);
                    stream.push_packet_at(now, &rtp_bytes(seq, 42), false);
                    last_pushed.store(seq, Ordering::SeqCst);
                    stream.reflect_packets(now);
                }
            });

            while removed.rtp_seqs().len() < 100 && last_pushed.load(Ordering::SeqCst) < 2_000 {
                std::thread::yield_now();
            }
            assert!(stream.remove_output(removed.id()));
            pushed_before_removal = last_pushed.load(Ordering::SeqCst);
        });

        let seqs = removed.rtp_seqs();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "delivered twice or out of order");
        assert!(seqs.iter().all(|&seq| seq <= pushed_before_removal));
        assert_eq!(kept.rtp_seqs(), (1..=2_000).collect::<Vec<u16>>());
        assert_eq!(stream.eye_count(), 1);
    }

    #[test]
    fn late_joiner_skips_history_unless_buffered() {
        let plain = stream();
        plain.push_packet_at(0, &rtp_bytes(1, 42), false);
        let output = Recorder::new();
        plain.add_output(output.clone(), Some(0)).unwrap();
        plain.push_packet_at(10, &rtp_bytes(2, 42), false);
        plain.reflect_packets(20);
        assert_eq!(output.rtp_seqs(), vec![2]);

        let buffered = stream_with(
            ReflectorConfig::default(),
            SourceDescriptor::new("127.0.0.1:5004".parse().unwrap()).buffering(true),
        );
        buffered.push_packet_at(0, &rtp_bytes(1, 42), false);
        buffered.reflect_packets(5);
        let output = Recorder::new();
        buffered.add_output(output.clone(), Some(0)).unwrap();
        buffered.push_packet_at(10, &rtp_bytes(2, 42), false);
        buffered.reflect_packets(20);
        assert_eq!(output.rtp_seqs(), vec![1, 2]);
    }

    #[test]
    fn rtcp_only_reaches_outputs_that_want_it() {
        let stream = stream();
        let both = Recorder::new();
        let rtp_only = Recorder::wanting(Some(PacketKind::Rtp));
        stream.add_output(both.clone(), Some(0)).unwrap();
        stream.add_output(rtp_only.clone(), Some(0)).unwrap();

        stream.push_packet_at(0, &rtp_bytes(1, 42), false);
        stream.push_packet_at(0, &sender_report(42, 1_000, 0), true);
        stream.reflect_packets(10);

        assert_eq!(both.rtcp_count(), 1);
        assert_eq!(rtp_only.rtcp_count(), 0);
        assert_eq!(rtp_only.rtp_seqs(), vec![1]);
    }

    #[test]
    fn wall_clock_anchored_once() {
        let stream = stream();
        assert_eq!(stream.rtp_time_to_wall_clock(0), None);

        stream.push_packet_at(0, &sender_report(42, 1_000, 90_000), true);
        assert_eq!(stream.rtp_time_to_wall_clock(180_000), Some(1_001_000));
        assert_eq!(stream.rtp_time_to_wall_clock(0), Some(999_000));

        // a later report disagreeing with the first does not move the anchor
        stream.push_packet_at(10, &sender_report(42, 5_000, 90_000), true);
        assert_eq!(stream.rtp_time_to_wall_clock(180_000), Some(1_001_000));
    }

    #[test]
    fn interleaved_channels_route_by_number() {
        let stream = stream_with(
            ReflectorConfig::default(),
            SourceDescriptor::new("127.0.0.1:5004".parse().unwrap()).interleaved(2, 3),
        );
        assert!(stream.push_interleaved(2, &rtp_bytes(1, 42)));
        assert!(stream.push_interleaved(3, &sender_report(42, 1, 0)));
        assert!(!stream.push_interleaved(4, &rtp_bytes(2, 42)));
        let stats = stream.stats();
        assert_eq!(stats.rtp_queue_len, 1);
        assert_eq!(stats.rtcp_queue_len, 1);
        assert_eq!(stats.counters.packets_received, 2);
    }

    #[test]
    fn relay_payload_is_packetized() {
        let stream = stream();
        let output = Recorder::new();
        stream.add_output(output.clone(), Some(0)).unwrap();

        let payload = vec![0x55; 3_000];
        assert_eq!(stream.push_relay_payload(&payload, 1234), 3);
        stream.reflect_packets(milliseconds() + 1);

        let packets = output.packets.lock().clone();
        assert_eq!(packets.len(), 3);
        let seqs: Vec<_> = packets.iter().map(|(p, _)| rtp::sequence_number(p)).collect();
        assert_eq!(seqs[1], seqs[0].wrapping_add(1));
        assert!(rtp::marker(&packets[2].0));
        assert!(!rtp::marker(&packets[0].0));
        assert_eq!(rtp::timestamp(&packets[1].0), 1234);
    }

    #[test]
    fn malformed_and_oversized_pushes_are_counted() {
        let stream = stream();
        assert!(!stream.push_packet_at(0, &[0x80, 96, 0], false));
        assert!(!stream.push_packet_at(0, &vec![0x80; 4_000], false));
        assert!(!stream.push_packet_at(0, &[0x00; 8], true));
        assert_eq!(stream.relay_stats().snapshot().malformed, 3);
    }

    #[test]
    fn push_path_filters_ssrc() {
        let stream = stream_with(
            ReflectorConfig::default(),
            SourceDescriptor::new("127.0.0.1:5004".parse().unwrap())
                .ssrc_filter(true)
                .ssrc_timeout(Duration::from_secs(30)),
        );
        assert!(stream.push_packet_at(0, &rtp_bytes(1, 42), false));
        assert!(!stream.push_packet_at(10, &rtp_bytes(2, 99), false));
        assert!(stream.push_packet_at(20, &rtp_bytes(3, 42), false));
        assert_eq!(stream.relay_stats().snapshot().ssrc_rejected, 1);
    }

    #[test]
    fn teardown_calls_hooks() {
        let stream = stream();
        let outputs: Vec<_> = (0..3).map(|_| Recorder::new()).collect();
        for output in &outputs {
            stream.add_output(output.clone(), None).unwrap();
        }
        assert_eq!(stream.teardown_all_outputs(), 3);
        assert_eq!(stream.eye_count(), 0);
        assert!(outputs.iter().all(|o| o.torn_down.load(Ordering::SeqCst)));
    }

    #[test]
    fn unusable_flag_and_task_retirement() {
        let stream = stream();
        assert!(stream.is_source_usable());
        stream.mark_unusable();
        assert!(!stream.is_source_usable());
        assert!(!stream.stats().source_usable);

        assert!(stream.run(0).is_some());
        let pool = SocketPool::new(Arc::new(ReflectorConfig::default()));
        assert!(!stream.unbind(&pool));
        assert_eq!(stream.run(10), None);
    }

    #[test]
    fn own_receiver_report_is_ignored() {
        let stream = stream();
        let own = stream.inner.lock().packetizer.ssrc();
        let report = ReceiverReport {
            reporter_ssrc: own,
            block: None,
            cname: "x".to_string(),
            eye_count: 0,
        };
        assert!(!stream.push_packet_at(0, &report.marshal(), true));
        assert_eq!(stream.stats().rtcp_queue_len, 0);
    }

    #[test]
    fn loss_reported_in_stats() {
        let stream = stream();
        for seq in [1, 2, 4, 5] {
            stream.push_packet_at(0, &rtp_bytes(seq, 42), false);
        }
        assert_eq!(stream.stats().lost, 1);
    }
}
