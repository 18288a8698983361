//! Per-kind packet queue and the bucketed fan-out pass.
//!
//! A stream has two senders, one for RTP and one for RTCP. Each owns an
//! oldest-first queue of shared packets. Queue ids are contiguous, so an
//! output's cursor (the next id it has not been offered) maps straight to a
//! queue index. A packet leaves the queue once every interested output's
//! cursor has moved past it, or once it is too old to be worth keeping.
//!
//! ```text
//!  front_id                                   next_id
//!     │                                          │
//!     ▼                                          ▼
//!    [12] [13] [14] [15] [16] [17] [18] [19]  ·
//!           ▲              ▲
//!     bucket 3 cursor   bucket 0 cursor
//! ```

use std::collections::VecDeque;

use crate::bucket::{BucketTable, OutputSlot};
use crate::output::TrackId;
use crate::packet::{PacketKind, SharedPacket};
use crate::stats::RelayStats;
use crate::thinning::ThinningPolicy;
use crate::time::Millis;

/// Wait before offering a packet again to an output that refused it.
pub const RETRY_DELAY: Millis = 10;

#[derive(Debug)]
struct QueuedPacket {
    id: u64,
    packet: SharedPacket,
}

/// Everything a delivery pass needs besides the queue and the bucket table.
pub struct ReflectContext<'a> {
    pub track: TrackId,
    pub policy: &'a dyn ThinningPolicy,
    pub thinning_lag: Millis,
    pub max_packet_age: Millis,
    /// Buffer window kept for new outputs, when buffering is enabled.
    pub overbuffer: Option<Millis>,
    pub stats: &'a RelayStats,
}

impl ReflectContext<'_> {
    fn retention(&self) -> Millis {
        match self.overbuffer {
            Some(window) => window.min(self.max_packet_age),
            None => self.max_packet_age,
        }
    }
}

#[derive(Debug)]
pub struct Sender {
    kind: PacketKind,
    queue: VecDeque<QueuedPacket>,
    next_id: u64,
    has_new_packets: bool,
    next_time_to_run: Option<Millis>,
}

impl Sender {
    pub fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            queue: VecDeque::new(),
            next_id: 0,
            has_new_packets: false,
            next_time_to_run: None,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Append a packet and return its queue id.
    pub fn enqueue(&mut self, packet: SharedPacket) -> u64 {
        let id = self.next_id;
        self.queue.push_back(QueuedPacket { id, packet });
        self.next_id += 1;
        self.has_new_packets = true;
        id
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Id of the oldest queued packet, or `next_id` when the queue is empty.
    pub fn front_id(&self) -> u64 {
        self.queue.front().map_or(self.next_id, |q| q.id)
    }

    /// Id the next enqueued packet will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Where a newly attached output starts reading.
    ///
    /// Without buffering the output only sees packets that arrive after it
    /// attached. With buffering it is replayed the whole retained window.
    pub fn first_packet_for_new_output(&self, buffering: bool) -> u64 {
        if buffering {
            self.front_id()
        } else {
            self.next_id
        }
    }

    /// Whether new packets arrived or a previously requested wakeup is due.
    pub fn should_reflect_now(&self, now: Millis) -> bool {
        self.has_new_packets || self.next_time_to_run.is_some_and(|at| now >= at)
    }

    pub fn next_time_to_run(&self) -> Option<Millis> {
        self.next_time_to_run
    }

    /// Run one delivery pass over every bucket.
    ///
    /// Returns the next time this sender needs to run, or `None` when the
    /// queue is empty and nothing is pending.
    pub fn reflect_packets(
        &mut self,
        now: Millis,
        buckets: &mut BucketTable,
        ctx: &ReflectContext<'_>,
    ) -> Option<Millis> {
        let mut next_wake: Option<Millis> = None;

        for (delay, slots) in buckets.buckets_mut() {
            for slot in slots.iter_mut().flatten() {
                if !slot.output.wants(self.kind) {
                    continue;
                }
                if let Some(due) = self.send_packets_to_output(slot, delay, now, ctx) {
                    next_wake = earliest(next_wake, due);
                }
            }
        }

        self.has_new_packets = false;
        self.remove_old_packets(now, buckets, ctx);

        if let Some(front) = self.queue.front() {
            let expiry = front.packet.arrival() + ctx.retention() + 1;
            next_wake = earliest(next_wake, expiry.max(now));
        }
        self.next_time_to_run = next_wake;
        next_wake
    }

    /// Offer every due packet to one output, in queue order.
    ///
    /// Returns when the output should be visited again: the due time of its
    /// next packet, or a short retry if it refused one.
    fn send_packets_to_output(
        &self,
        slot: &mut OutputSlot,
        delay: Millis,
        now: Millis,
        ctx: &ReflectContext<'_>,
    ) -> Option<Millis> {
        let k = self.kind.index();
        let front = self.front_id();
        if slot.cursors[k] < front {
            slot.cursors[k] = front;
        }

        loop {
            let cursor = slot.cursors[k];
            let queued = self.queue.get((cursor - front) as usize)?;
            let packet = &queued.packet;

            let due = packet.arrival() + delay;
            if due > now {
                return Some(due);
            }

            if self.kind == PacketKind::Rtp && cursor >= slot.live_from[k] {
                let lag = now - due;
                if lag > ctx.thinning_lag && ctx.policy.is_droppable(packet) {
                    slot.cursors[k] += 1;
                    slot.thinned += 1;
                    ctx.stats.record_thinned();
                    tracing::trace!(output = %slot.id(), lag, "packet thinned");
                    continue;
                }
            }

            match slot
                .output
                .accept(packet.as_bytes(), self.kind.is_rtcp(), ctx.track)
            {
                Ok(()) => {
                    slot.cursors[k] += 1;
                    slot.consecutive_failures = 0;
                    ctx.stats.record_delivered(packet.len());
                }
                Err(e) => {
                    slot.consecutive_failures += 1;
                    ctx.stats.record_delivery_failure();
                    tracing::trace!(
                        output = %slot.id(),
                        failures = slot.consecutive_failures,
                        error = %e,
                        "output refused packet"
                    );
                    return Some(now + RETRY_DELAY);
                }
            }
        }
    }

    /// Release packets nobody needs any more and pull lagging cursors forward.
    pub fn remove_old_packets(
        &mut self,
        now: Millis,
        buckets: &mut BucketTable,
        ctx: &ReflectContext<'_>,
    ) {
        let min_cursor = buckets.min_cursor(self.kind);

        while let Some(front) = self.queue.front() {
            let age = now - front.packet.arrival();
            let consumed = min_cursor.is_none_or(|min| front.id < min);
            let release = if age > ctx.max_packet_age {
                true
            } else if consumed {
                ctx.overbuffer.is_none_or(|window| age > window)
            } else {
                false
            };
            if !release {
                break;
            }
            self.queue.pop_front();
        }

        let skipped = buckets.clamp_cursors(self.kind, self.front_id());
        if skipped > 0 {
            ctx.stats.record_evicted(skipped);
            tracing::debug!(kind = %self.kind, skipped, "aged packets dropped before delivery");
        }
    }

    /// Drop every queued packet.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.has_new_packets = false;
        self.next_time_to_run = None;
    }
}

fn earliest(current: Option<Millis>, candidate: Millis) -> Option<Millis> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{Output, OutputId};
    use crate::packet::PacketPool;
    use crate::packet::rtp::RtpHeader;
    use crate::thinning::NoThinning;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        id: OutputId,
        seqs: Mutex<Vec<u16>>,
        fail_next: AtomicU32,
        always_fail: bool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: OutputId::next(),
                seqs: Mutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
                always_fail: false,
            })
        }

        fn broken() -> Arc<Self> {
            Arc::new(Self {
                id: OutputId::next(),
                seqs: Mutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
                always_fail: true,
            })
        }

        fn seqs(&self) -> Vec<u16> {
            self.seqs.lock().clone()
        }
    }

    impl Output for Recorder {
        fn id(&self) -> OutputId {
            self.id
        }

        fn accept(&self, packet: &[u8], _is_rtcp: bool, _track: TrackId) -> io::Result<()> {
            if self.always_fail
                || self
                    .fail_next
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            self.seqs.lock().push(crate::packet::rtp::sequence_number(packet));
            Ok(())
        }
    }

    struct Fixture {
        pool: Arc<PacketPool>,
        sender: Sender,
        buckets: BucketTable,
        stats: RelayStats,
        overbuffer: Option<Millis>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pool: PacketPool::with_preallocated(4),
                sender: Sender::new(PacketKind::Rtp),
                buckets: BucketTable::new(4, 1, 73),
                stats: RelayStats::new(),
                overbuffer: None,
            }
        }

        fn push(&mut self, seq: u16, arrival: Millis) {
            let mut header = RtpHeader::new(96, 42);
            header.set_sequence(seq);
            let mut buf = self.pool.acquire();
            let mut bytes = header.write(false).to_vec();
            bytes.extend_from_slice(&[0u8; 20]);
            assert!(buf.set(&bytes));
            buf.stamp(PacketKind::Rtp, arrival);
            let shared = self.pool.share(buf);
            self.sender.enqueue(shared);
        }

        fn attach(&mut self, output: Arc<Recorder>, bucket: usize) -> usize {
            let start = self.sender.first_packet_for_new_output(self.overbuffer.is_some());
            let live = self.sender.next_id();
            self.buckets
                .add(
                    OutputSlot::new(output, [start, 0], [live, 0]),
                    Some(bucket),
                )
                .unwrap()
        }

        fn reflect(&mut self, now: Millis) -> Option<Millis> {
            self.reflect_with(now, &NoThinning)
        }

        fn reflect_with(&mut self, now: Millis, policy: &dyn ThinningPolicy) -> Option<Millis> {
            let ctx = ReflectContext {
                track: 1,
                policy,
                thinning_lag: 1_500,
                max_packet_age: 10_000,
                overbuffer: self.overbuffer,
                stats: &self.stats,
            };
            self.sender.reflect_packets(now, &mut self.buckets, &ctx)
        }
    }

    #[test]
    fn delivers_in_queue_order() {
        let mut fx = Fixture::new();
        let out = Recorder::new();
        fx.attach(out.clone(), 0);
        for seq in 1..=3 {
            fx.push(seq, 1_000);
        }
        assert!(fx.sender.should_reflect_now(1_000));
        fx.reflect(1_000);

        assert_eq!(out.seqs(), vec![1, 2, 3]);
        assert_eq!(fx.sender.queue_len(), 0);
        assert!(!fx.sender.should_reflect_now(1_000));
        assert_eq!(fx.stats.snapshot().delivered, 3);
    }

    #[test]
    fn later_buckets_wait_for_their_delay() {
        let mut fx = Fixture::new();
        let early = Recorder::new();
        let late = Recorder::new();
        fx.attach(early.clone(), 0);
        fx.attach(late.clone(), 2);
        fx.push(1, 1_000);

        let wake = fx.reflect(1_000);
        assert_eq!(wake, Some(1_146));
        assert_eq!(early.seqs(), vec![1]);
        assert!(late.seqs().is_empty());
        assert_eq!(fx.sender.queue_len(), 1);

        assert!(!fx.sender.should_reflect_now(1_145));
        fx.reflect(1_145);
        assert!(late.seqs().is_empty());

        assert!(fx.sender.should_reflect_now(1_146));
        fx.reflect(1_146);
        assert_eq!(late.seqs(), vec![1]);
        assert_eq!(fx.sender.queue_len(), 0);
    }

    #[test]
    fn new_output_starts_from_now() {
        let mut fx = Fixture::new();
        let first = Recorder::new();
        fx.attach(first.clone(), 0);
        fx.push(1, 0);
        fx.push(2, 0);
        fx.reflect(0);

        let second = Recorder::new();
        fx.attach(second.clone(), 1);
        fx.push(3, 10);
        fx.reflect(100);

        assert_eq!(first.seqs(), vec![1, 2, 3]);
        assert_eq!(second.seqs(), vec![3]);
    }

    #[test]
    fn buffering_replays_window_to_new_output() {
        let mut fx = Fixture::new();
        fx.overbuffer = Some(5_000);
        fx.push(1, 0);
        fx.push(2, 100);
        fx.reflect(200);
        assert_eq!(fx.sender.queue_len(), 2);

        let out = Recorder::new();
        fx.attach(out.clone(), 0);
        fx.push(3, 300);
        fx.reflect(300);
        assert_eq!(out.seqs(), vec![1, 2, 3]);

        // window expiry releases the packets even though they were delivered
        fx.reflect(5_101);
        assert_eq!(fx.sender.queue_len(), 1);
        fx.reflect(5_301);
        assert_eq!(fx.sender.queue_len(), 0);
    }

    #[test]
    fn refusing_output_does_not_hold_back_others() {
        let mut fx = Fixture::new();
        let healthy = Recorder::new();
        let flaky = Recorder::new();
        flaky.fail_next.store(3, Ordering::SeqCst);
        fx.attach(healthy.clone(), 0);
        fx.attach(flaky.clone(), 1);
        for seq in 1..=3 {
            fx.push(seq, 0);
        }

        let mut now = 100;
        for _ in 0..3 {
            let wake = fx.reflect(now);
            assert_eq!(wake, Some(now + RETRY_DELAY));
            now += RETRY_DELAY;
        }
        assert_eq!(healthy.seqs(), vec![1, 2, 3]);
        assert!(flaky.seqs().is_empty());
        assert_eq!(fx.sender.queue_len(), 3);

        fx.reflect(now);
        assert_eq!(flaky.seqs(), vec![1, 2, 3]);
        assert_eq!(fx.sender.queue_len(), 0);
        assert_eq!(fx.stats.snapshot().delivery_failures, 3);
    }

    #[test]
    fn old_packets_are_released_anyway() {
        let mut fx = Fixture::new();
        let broken = Recorder::broken();
        fx.attach(broken, 0);
        fx.push(1, 0);
        fx.push(2, 0);

        fx.reflect(100);
        assert_eq!(fx.sender.queue_len(), 2);

        fx.reflect(10_001);
        assert_eq!(fx.sender.queue_len(), 0);
        assert_eq!(fx.stats.snapshot().evicted_undelivered, 2);
        assert_eq!(fx.pool.free_count(), 4);
    }

    #[test]
    fn lagging_output_is_thinned() {
        let mut fx = Fixture::new();
        let out = Recorder::broken();
        fx.attach(out.clone(), 0);
        for seq in 1..=3 {
            fx.push(seq, 0);
        }
        fx.reflect(10);

        let drop_odd = |p: &crate::packet::PacketBuffer| p.sequence_number() % 2 == 1;
        // still failing, but lag past the threshold makes odd packets droppable
        fx.reflect_with(2_000, &drop_odd);
        let slot = fx.buckets.slots().next().unwrap();
        assert_eq!(slot.thinned(), 1);
        assert_eq!(slot.cursor(PacketKind::Rtp), 1);
        assert_eq!(fx.stats.snapshot().thinned, 1);
    }

    #[test]
    fn prebuffered_packets_are_never_thinned() {
        let mut fx = Fixture::new();
        fx.overbuffer = Some(9_000);
        fx.push(1, 0);
        fx.push(2, 0);
        let out = Recorder::new();
        fx.attach(out.clone(), 0);
        fx.push(3, 3_000);

        let drop_all = |_: &crate::packet::PacketBuffer| true;
        fx.reflect_with(5_000, &drop_all);
        assert_eq!(out.seqs(), vec![1, 2]);
        assert_eq!(fx.stats.snapshot().thinned, 1);
    }

    #[test]
    fn empty_sender_sleeps() {
        let mut fx = Fixture::new();
        fx.attach(Recorder::new(), 0);
        assert_eq!(fx.reflect(0), None);
        assert!(!fx.sender.should_reflect_now(1_000_000));
    }
}
