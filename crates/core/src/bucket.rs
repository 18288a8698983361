//! Two-dimensional roster of attached outputs.
//!
//! Outputs live in `buckets[bucket][slot]`. Every bucket is a cohort whose
//! deliveries run `bucket * bucket_delay` behind the packet's arrival, which
//! spreads the sends for a popular stream over time instead of bursting them
//! all at once.
//!
//! Placement fills slot 0 of every bucket before slot 1 of any bucket, so
//! small audiences are spread across as many cohorts as possible. The table
//! doubles when full. Removal clears a slot in place; nothing shifts, so the
//! bucket index of every other output stays stable.

use std::sync::Arc;

use crate::error::{ReflectorError, Result};
use crate::output::{Output, OutputId};
use crate::packet::PacketKind;
use crate::time::Millis;

/// One attached output plus its delivery bookkeeping.
pub struct OutputSlot {
    pub(crate) output: Arc<dyn Output>,
    /// Next queue id to offer, per packet kind.
    pub(crate) cursors: [u64; 2],
    /// First queue id that arrived after attach; anything older is prebuffer.
    pub(crate) live_from: [u64; 2],
    pub(crate) consecutive_failures: u32,
    pub(crate) thinned: u64,
}

impl OutputSlot {
    pub(crate) fn new(output: Arc<dyn Output>, start: [u64; 2], live_from: [u64; 2]) -> Self {
        Self {
            output,
            cursors: start,
            live_from,
            consecutive_failures: 0,
            thinned: 0,
        }
    }

    pub fn id(&self) -> OutputId {
        self.output.id()
    }

    pub fn output(&self) -> &Arc<dyn Output> {
        &self.output
    }

    pub fn cursor(&self, kind: PacketKind) -> u64 {
        self.cursors[kind.index()]
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn thinned(&self) -> u64 {
        self.thinned
    }
}

impl std::fmt::Debug for OutputSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSlot")
            .field("output", &self.output.id())
            .field("cursors", &self.cursors)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

#[derive(Debug)]
pub struct BucketTable {
    buckets: Vec<Vec<Option<OutputSlot>>>,
    bucket_size: usize,
    bucket_delay: Millis,
    len: usize,
}

impl BucketTable {
    pub fn new(min_buckets: usize, bucket_size: usize, bucket_delay: Millis) -> Self {
        let bucket_size = bucket_size.max(1);
        let buckets = (0..min_buckets.max(1))
            .map(|_| (0..bucket_size).map(|_| None).collect())
            .collect();
        Self {
            buckets,
            bucket_size,
            bucket_delay,
            len: 0,
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Number of attached outputs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delivery delay of the bucket at `index`.
    ///
    /// The delay grows without bound as the table grows. A bucket whose
    /// delay reaches the sender's `max_packet_age` is attached but never
    /// delivered to: with the default 73 ms stagger and 10 s age that is
    /// bucket 137 onward, about 2,200 outputs at 16 slots per bucket.
    pub fn bucket_delay(&self, index: usize) -> Millis {
        Millis::try_from(index).map_or(Millis::MAX, |index| self.bucket_delay.saturating_mul(index))
    }

    /// Place a slot, preferring `preferred` when it exists and has room.
    ///
    /// A preferred index outside the table never grows it; the slot goes
    /// wherever [`find_bucket`](Self::find_bucket) puts it instead. Adding
    /// an output that is already attached returns its current bucket.
    pub fn add(&mut self, slot: OutputSlot, preferred: Option<usize>) -> Result<usize> {
        if let Some(existing) = self.bucket_of(slot.id()) {
            return Ok(existing);
        }

        let bucket = match preferred {
            Some(index) if self.free_slot(index).is_some() => index,
            _ => self.find_bucket()?,
        };

        let slot_index = self
            .free_slot(bucket)
            .ok_or(ReflectorError::BucketAllocation)?;
        self.buckets[bucket][slot_index] = Some(slot);
        self.len += 1;
        Ok(bucket)
    }

    /// First bucket with a free slot, scanning slot-major. Grows when full.
    pub fn find_bucket(&mut self) -> Result<usize> {
        if self.len >= self.bucket_size * self.buckets.len() {
            self.grow(self.buckets.len() * 2)?;
        }
        for slot in 0..self.bucket_size {
            for (index, bucket) in self.buckets.iter().enumerate() {
                if bucket[slot].is_none() {
                    return Ok(index);
                }
            }
        }
        Err(ReflectorError::BucketAllocation)
    }

    pub fn remove(&mut self, id: OutputId) -> Option<OutputSlot> {
        for bucket in &mut self.buckets {
            for entry in bucket.iter_mut() {
                if entry.as_ref().is_some_and(|s| s.id() == id) {
                    self.len -= 1;
                    return entry.take();
                }
            }
        }
        None
    }

    pub fn bucket_of(&self, id: OutputId) -> Option<usize> {
        self.buckets
            .iter()
            .position(|bucket| bucket.iter().flatten().any(|s| s.id() == id))
    }

    pub fn contains(&self, id: OutputId) -> bool {
        self.bucket_of(id).is_some()
    }

    /// Remove every slot, keeping the table's shape.
    pub fn drain(&mut self) -> Vec<OutputSlot> {
        let slots: Vec<_> = self
            .buckets
            .iter_mut()
            .flat_map(|bucket| bucket.iter_mut().filter_map(Option::take))
            .collect();
        self.len = 0;
        slots
    }

    pub fn slots(&self) -> impl Iterator<Item = &OutputSlot> {
        self.buckets.iter().flatten().flatten()
    }

    /// Buckets in index order with their delay and mutable slots.
    pub(crate) fn buckets_mut(
        &mut self,
    ) -> impl Iterator<Item = (Millis, &mut [Option<OutputSlot>])> {
        let delay = self.bucket_delay;
        self.buckets
            .iter_mut()
            .enumerate()
            .map(move |(index, bucket)| (delay.saturating_mul(index as Millis), bucket.as_mut_slice()))
    }

    /// Lowest cursor among outputs that want `kind`.
    pub(crate) fn min_cursor(&self, kind: PacketKind) -> Option<u64> {
        self.slots()
            .filter(|s| s.output.wants(kind))
            .map(|s| s.cursor(kind))
            .min()
    }

    /// Move cursors that point at released packets up to `floor`.
    ///
    /// Returns how many packets were skipped in total.
    pub(crate) fn clamp_cursors(&mut self, kind: PacketKind, floor: u64) -> u64 {
        let mut skipped = 0;
        for slot in self.buckets.iter_mut().flatten().flatten() {
            if !slot.output.wants(kind) {
                continue;
            }
            let cursor = &mut slot.cursors[kind.index()];
            if *cursor < floor {
                skipped += floor - *cursor;
                *cursor = floor;
            }
        }
        skipped
    }

    fn free_slot(&self, bucket: usize) -> Option<usize> {
        self.buckets.get(bucket)?.iter().position(Option::is_none)
    }

    fn grow(&mut self, num_buckets: usize) -> Result<()> {
        let additional = num_buckets.saturating_sub(self.buckets.len());
        self.buckets
            .try_reserve(additional)
            .map_err(|_| ReflectorError::BucketAllocation)?;
        for _ in 0..additional {
            let mut bucket = Vec::new();
            bucket
                .try_reserve_exact(self.bucket_size)
                .map_err(|_| ReflectorError::BucketAllocation)?;
            bucket.resize_with(self.bucket_size, || None);
            self.buckets.push(bucket);
        }
        tracing::debug!(
            buckets = self.buckets.len(),
            bucket_size = self.bucket_size,
            "bucket table grown"
        );
        Ok(())
    }
}
