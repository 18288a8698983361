//! Integration tests: real UDP sources reflected over loopback.
//!
//! Each test binds its own fixed ports so tests can run in parallel.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reflector::packet::rtcp;
use reflector::packet::rtp::{self, RtpHeader};
use reflector::{
    Output, OutputId, PacketKind, ReflectorConfig, ReflectorRegistry, Scheduler,
    SourceDescriptor, TrackId,
};

/// Forwards RTP to a fixed UDP address.
struct UdpForward {
    id: OutputId,
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpForward {
    fn new(target: &str) -> Arc<Self> {
        Arc::new(Self {
            id: OutputId::next(),
            socket: UdpSocket::bind("127.0.0.1:0").unwrap(),
            target: target.parse().unwrap(),
        })
    }
}

impl Output for UdpForward {
    fn id(&self) -> OutputId {
        self.id
    }

    fn accept(&self, packet: &[u8], _is_rtcp: bool, _track: TrackId) -> io::Result<()> {
        self.socket.send_to(packet, self.target).map(|_| ())
    }

    fn wants(&self, kind: PacketKind) -> bool {
        kind == PacketKind::Rtp
    }
}

fn rtp_packet(seq: u16) -> Vec<u8> {
    let mut header = RtpHeader::new(96, 0x1234_5678);
    header.set_sequence(seq);
    header.set_timestamp(u32::from(seq) * 3000);
    let mut packet = header.write(false).to_vec();
    packet.extend_from_slice(b"payload");
    packet
}

fn sender_report() -> Vec<u8> {
    let mut sr = vec![0x80, rtcp::PT_SENDER_REPORT, 0, 6];
    sr.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    sr.extend_from_slice(&0xE000_0000u32.to_be_bytes());
    sr.extend_from_slice(&[0; 16]);
    sr
}

fn start(config: ReflectorConfig) -> (Scheduler, ReflectorRegistry) {
    let scheduler = Scheduler::new(2);
    scheduler.start().expect("scheduler start");
    let registry = ReflectorRegistry::with_scheduler(config, scheduler.clone());
    (scheduler, registry)
}

#[test]
fn udp_source_reflected_once_per_sequence() {
    const SOURCE: &str = "127.0.0.1:27200";
    const VIEWER: &str = "127.0.0.1:27210";

    let (scheduler, registry) = start(ReflectorConfig::default());
    let stream = registry
        .bind(SourceDescriptor::new(SOURCE.parse().unwrap()))
        .expect("bind source");

    let viewer = UdpSocket::bind(VIEWER).unwrap();
    viewer
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(stream.add_output(UdpForward::new(VIEWER), None).unwrap(), 0);

    let broadcaster = UdpSocket::bind("127.0.0.1:0").unwrap();
    for seq in [1, 2, 2, 3] {
        broadcaster.send_to(&rtp_packet(seq), SOURCE).unwrap();
    }

    let mut buf = [0u8; 2048];
    let mut seqs = Vec::new();
    for _ in 0..3 {
        let (len, _) = viewer.recv_from(&mut buf).expect("reflected packet");
        assert_eq!(&buf[rtp::HEADER_LEN..len], b"payload");
        seqs.push(rtp::sequence_number(&buf[..len]));
    }
    assert_eq!(seqs, vec![1, 2, 3]);

    viewer
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(viewer.recv_from(&mut buf).is_err(), "duplicate was reflected");

    let stats = registry.stats();
    assert_eq!(stats.packets_received, 3);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.delivered, 3);

    registry.remove(stream.id()).unwrap();
    scheduler.stop().unwrap();
}

#[test]
fn receiver_report_returns_to_rtcp_sender() {
    const SOURCE: &str = "127.0.0.1:27300";
    const SOURCE_RTCP: &str = "127.0.0.1:27301";

    let config = ReflectorConfig::default().receiver_report_interval(Duration::from_millis(200));
    let (scheduler, registry) = start(config);
    let stream = registry
        .bind(SourceDescriptor::new(SOURCE.parse().unwrap()).ssrc_filter(true))
        .expect("bind source");
    stream
        .add_output(UdpForward::new("127.0.0.1:27320"), None)
        .unwrap();

    let rtp_out = UdpSocket::bind("127.0.0.1:27310").unwrap();
    let rtcp_out = UdpSocket::bind("127.0.0.1:27311").unwrap();
    rtcp_out
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();

    rtcp_out.send_to(&sender_report(), SOURCE_RTCP).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    for seq in 10..20 {
        rtp_out.send_to(&rtp_packet(seq), SOURCE).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut buf = [0u8; 2048];
    let report = loop {
        assert!(Instant::now() < deadline, "no receiver report");
        let Ok((len, _)) = rtcp_out.recv_from(&mut buf) else {
            continue;
        };
        if rtcp::find_packet(&buf[..len], rtcp::PT_RECEIVER_REPORT).is_some() {
            break buf[..len].to_vec();
        }
    };

    assert_eq!(rtcp::app_eye_count(&report), Some(1));
    let rr = rtcp::find_packet(&report, rtcp::PT_RECEIVER_REPORT).unwrap();
    let block_ssrc = u32::from_be_bytes([rr[8], rr[9], rr[10], rr[11]]);
    assert_eq!(block_ssrc, 0x1234_5678);

    assert!(registry.stats().receiver_reports >= 1);
    registry.remove(stream.id()).unwrap();
    scheduler.stop().unwrap();
}

#[test]
fn removed_stream_stops_reflecting() {
    const SOURCE: &str = "127.0.0.1:27400";
    const VIEWER: &str = "127.0.0.1:27410";

    let (scheduler, registry) = start(ReflectorConfig::default());
    let stream = registry
        .bind(SourceDescriptor::new(SOURCE.parse().unwrap()))
        .unwrap();
    let viewer = UdpSocket::bind(VIEWER).unwrap();
    viewer
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    stream.add_output(UdpForward::new(VIEWER), None).unwrap();

    registry.remove(stream.id()).unwrap();
    assert_eq!(stream.eye_count(), 0);
    assert_eq!(registry.stream_count(), 0);

    let broadcaster = UdpSocket::bind("127.0.0.1:0").unwrap();
    let _ = broadcaster.send_to(&rtp_packet(1), SOURCE);
    let mut buf = [0u8; 2048];
    assert!(viewer.recv_from(&mut buf).is_err());

    scheduler.stop().unwrap();
}
