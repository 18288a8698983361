use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use reflector::{Output, OutputId, TrackId};

/// Forwards reflected packets to one UDP receiver.
///
/// RTP goes to `rtp_addr`, RTCP to the port above it. All outputs share one
/// ephemeral socket; this layer only knows addresses.
pub struct UdpOutput {
    id: OutputId,
    socket: Arc<UdpSocket>,
    rtp_addr: SocketAddr,
    rtcp_addr: SocketAddr,
}

impl UdpOutput {
    pub fn new(socket: Arc<UdpSocket>, rtp_addr: SocketAddr) -> Self {
        let rtcp_port = rtp_addr.port().wrapping_add(1);
        Self {
            id: OutputId::next(),
            socket,
            rtp_addr,
            rtcp_addr: SocketAddr::new(rtp_addr.ip(), rtcp_port),
        }
    }
}

impl Output for UdpOutput {
    fn id(&self) -> OutputId {
        self.id
    }

    fn accept(&self, packet: &[u8], is_rtcp: bool, _track: TrackId) -> io::Result<()> {
        let addr = if is_rtcp { self.rtcp_addr } else { self.rtp_addr };
        self.socket.send_to(packet, addr).map(|_| ())
    }

    fn tear_down(&self) {
        tracing::debug!(addr = %self.rtp_addr, "output closed");
    }
}
