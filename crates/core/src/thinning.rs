//! Per-output thinning policy.
//!
//! When an output falls behind, the sender asks the stream's policy whether
//! the next packet may be skipped for that output alone. What counts as
//! droppable depends on the payload format, so the predicate is pluggable.
//! RTCP is never thinned.

use crate::packet::PacketBuffer;

/// Decides which RTP packets a lagging output may skip.
pub trait ThinningPolicy: Send + Sync {
    fn is_droppable(&self, packet: &PacketBuffer) -> bool;
}

/// Never skips anything; lagging outputs simply catch up late.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoThinning;

impl ThinningPolicy for NoThinning {
    fn is_droppable(&self, _packet: &PacketBuffer) -> bool {
        false
    }
}

/// Skips packets whose RTP payload type is in the given list.
///
/// Useful when a source multiplexes a low-priority layer (e.g. redundancy or
/// an enhancement layer) under its own payload type.
#[derive(Debug, Clone, Default)]
pub struct PayloadTypeThinning {
    droppable: Vec<u8>,
}

impl PayloadTypeThinning {
    pub fn new(droppable: impl IntoIterator<Item = u8>) -> Self {
        Self {
            droppable: droppable.into_iter().collect(),
        }
    }
}

impl ThinningPolicy for PayloadTypeThinning {
    fn is_droppable(&self, packet: &PacketBuffer) -> bool {
        self.droppable.contains(&packet.payload_type())
    }
}

impl<F> ThinningPolicy for F
where
    F: Fn(&PacketBuffer) -> bool + Send + Sync,
{
    fn is_droppable(&self, packet: &PacketBuffer) -> bool {
        self(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::rtp::RtpHeader;

    fn packet_with_pt(pt: u8) -> PacketBuffer {
        let mut packet = PacketBuffer::new();
        packet.set(&RtpHeader::new(pt, 1).write(false));
        packet
    }

    #[test]
    fn no_thinning_keeps_everything() {
        assert!(!NoThinning.is_droppable(&packet_with_pt(96)));
    }

    #[test]
    fn payload_type_policy() {
        let policy = PayloadTypeThinning::new([97]);
        assert!(policy.is_droppable(&packet_with_pt(97)));
        assert!(!policy.is_droppable(&packet_with_pt(96)));
    }

    #[test]
    fn closure_policy() {
        let policy = |p: &PacketBuffer| !p.marker();
        let mut marked = PacketBuffer::new();
        marked.set(&RtpHeader::new(96, 1).write(true));
        assert!(!policy.is_droppable(&marked));
        assert!(policy.is_droppable(&packet_with_pt(96)));
    }
}
