//! Free-buffer recycling for received packets.
//!
//! Packets are shared between every sender queue that still needs them.
//! Instead of tracking per-bucket "seen" bits by hand, each queue holds an
//! `Arc` and the buffer goes back to its pool when the last holder lets go.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::PacketBuffer;

/// A packet shared by every queue that still references it.
pub type SharedPacket = Arc<PooledPacket>;

/// Pool of reusable [`PacketBuffer`]s owned by a socket (or a stream for
/// pushed packets).
#[derive(Debug)]
pub struct PacketPool {
    free: Mutex<Vec<PacketBuffer>>,
    allocated: AtomicUsize,
    next_stream_count_id: AtomicU64,
}

impl PacketPool {
    /// Create a pool with `preallocated` buffers ready to use.
    pub fn with_preallocated(preallocated: usize) -> Arc<Self> {
        let free = (0..preallocated).map(|_| PacketBuffer::new()).collect();
        Arc::new(Self {
            free: Mutex::new(free),
            allocated: AtomicUsize::new(preallocated),
            next_stream_count_id: AtomicU64::new(1),
        })
    }

    /// Take a free buffer, allocating a new one if the pool is empty.
    pub fn acquire(&self) -> PacketBuffer {
        if let Some(packet) = self.free.lock().pop() {
            return packet;
        }
        self.allocated.fetch_add(1, Ordering::Relaxed);
        PacketBuffer::new()
    }

    /// Hand a filled buffer out for sharing.
    ///
    /// Assigns the packet's stream-count id. The buffer returns to this pool
    /// when the last [`SharedPacket`] clone is dropped.
    pub fn share(self: &Arc<Self>, mut packet: PacketBuffer) -> SharedPacket {
        let id = self.next_stream_count_id.fetch_add(1, Ordering::Relaxed);
        packet.set_stream_count_id(id);
        Arc::new(PooledPacket {
            packet,
            pool: Arc::downgrade(self),
        })
    }

    /// Return an unshared buffer (e.g. a dropped datagram) to the pool.
    pub fn recycle(&self, mut packet: PacketBuffer) {
        packet.reset();
        self.free.lock().push(packet);
    }

    /// Buffers currently sitting in the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Buffers ever allocated by this pool.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// A [`PacketBuffer`] that finds its way home when dropped.
#[derive(Debug)]
pub struct PooledPacket {
    packet: PacketBuffer,
    pool: Weak<PacketPool>,
}

impl Deref for PooledPacket {
    type Target = PacketBuffer;

    fn deref(&self) -> &PacketBuffer {
        &self.packet
    }
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(std::mem::take(&mut self.packet));
        }
    }
}
