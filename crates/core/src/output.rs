//! The downstream packet-sink contract.
//!
//! An [`Output`] is whatever serializes reflected packets onto one client's
//! transport: a UDP pair, an interleaved RTSP connection, a recorder. The
//! reflector only needs to hand it bytes, ask which halves of the stream it
//! wants, and tell outputs apart.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::packet::PacketKind;

static OUTPUT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity used for bucket placement and removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(u64);

impl OutputId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        Self(OUTPUT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Track identity passed along with every packet.
pub type TrackId = u32;

/// Downstream consumer of reflected packets.
///
/// `accept` is called while the owning stream's lock is held, so it must not
/// block and must not call back into the same stream. An `Err` is treated as
/// a transient failure: the packet is offered again on the next pass and the
/// other outputs are unaffected. Detaching an output that keeps failing is
/// the job of whoever owns its lifecycle.
pub trait Output: Send + Sync {
    fn id(&self) -> OutputId;

    /// Write one packet to the downstream transport.
    fn accept(&self, packet: &[u8], is_rtcp: bool, track: TrackId) -> io::Result<()>;

    /// Whether this output wants packets of `kind`.
    fn wants(&self, kind: PacketKind) -> bool {
        let _ = kind;
        true
    }

    /// Called by `teardown_all_outputs` before the output is detached.
    fn tear_down(&self) {}
}
