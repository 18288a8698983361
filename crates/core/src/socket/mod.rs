//! UDP endpoints bound to a broadcast source.
//!
//! A [`SourceSocket`] reads datagrams without blocking, drops the ones that
//! are malformed or carry the wrong SSRC, and hands the rest to every stream
//! registered on it. Each socket owns its own [`PacketPool`].

pub mod pool;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::ReflectorConfig;
use crate::error::Result;
use crate::packet::{PacketBuffer, PacketKind, PacketPool};
use crate::scheduler::Task;
use crate::stream::{ReflectorStream, StreamId};
use crate::time::{Millis, duration_ms};

pub use pool::{SocketPair, SocketPool};

/// Handle on whatever keeps a broadcaster's announce session alive.
pub trait BroadcasterSession: Send + Sync {
    /// Push the session's idle timeout out again.
    fn refresh_timeout(&self);
}

/// Learns the source SSRC from the first packet and rejects others.
///
/// After `timeout` without a matching packet the learned SSRC is forgotten
/// and the next packet's SSRC becomes the valid one.
#[derive(Debug, Clone)]
pub struct SsrcFilter {
    enabled: bool,
    timeout: Millis,
    valid: Option<u32>,
    last_seen: Millis,
}

impl SsrcFilter {
    pub fn new(enabled: bool, timeout: Millis) -> Self {
        Self {
            enabled,
            timeout,
            valid: None,
            last_seen: 0,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn valid_ssrc(&self) -> Option<u32> {
        self.valid
    }

    pub fn accept(&mut self, ssrc: u32, now: Millis) -> bool {
        if !self.enabled {
            return true;
        }
        match self.valid {
            Some(valid) if valid == ssrc => {
                self.last_seen = now;
                true
            }
            Some(valid) if now - self.last_seen > self.timeout => {
                tracing::warn!(
                    old = format_args!("{valid:#010X}"),
                    new = format_args!("{ssrc:#010X}"),
                    "source SSRC timed out, switching"
                );
                self.valid = Some(ssrc);
                self.last_seen = now;
                true
            }
            Some(_) => false,
            None => {
                tracing::debug!(ssrc = format_args!("{ssrc:#010X}"), "source SSRC learned");
                self.valid = Some(ssrc);
                self.last_seen = now;
                true
            }
        }
    }
}

/// A stream registered to receive this socket's packets.
#[derive(Debug, Clone)]
pub struct SenderRef {
    id: StreamId,
    stream: Weak<ReflectorStream>,
}

impl SenderRef {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Arc<ReflectorStream>> {
        self.stream.upgrade()
    }
}

struct SocketState {
    senders: Vec<SenderRef>,
    filter: SsrcFilter,
    broadcaster: Option<Arc<dyn BroadcasterSession>>,
    next_refresh: Millis,
}

pub struct SourceSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    kind: PacketKind,
    pool: Arc<PacketPool>,
    config: Arc<ReflectorConfig>,
    state: Mutex<SocketState>,
    failed: AtomicBool,
    closed: AtomicBool,
}

impl SourceSocket {
    /// Bind the endpoint packets for `addr` arrive on.
    ///
    /// A multicast `addr` binds the wildcard address on its port and joins
    /// the group; anything else binds `addr` directly.
    pub fn bind(addr: SocketAddr, kind: PacketKind, config: Arc<ReflectorConfig>) -> Result<Self> {
        let socket = match addr.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, addr.port()))?;
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
                socket
            }
            IpAddr::V6(group) if group.is_multicast() => {
                let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, addr.port()))?;
                socket.join_multicast_v6(&group, 0)?;
                socket
            }
            _ => UdpSocket::bind(addr)?,
        };
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        tracing::info!(addr = %addr, local = %local_addr, kind = %kind, "source socket bound");

        Ok(Self {
            socket,
            local_addr,
            kind,
            pool: PacketPool::with_preallocated(config.preallocated_packets),
            config,
            state: Mutex::new(SocketState {
                senders: Vec::new(),
                filter: SsrcFilter::disabled(),
                broadcaster: None,
                next_refresh: 0,
            }),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    pub fn add_sender(&self, stream: &Arc<ReflectorStream>) {
        let mut state = self.state.lock();
        let id = stream.id();
        if state.senders.iter().any(|s| s.id == id) {
            return;
        }
        state.senders.push(SenderRef {
            id,
            stream: Arc::downgrade(stream),
        });
        tracing::debug!(addr = %self.local_addr, stream = %id, "sender registered");
    }

    pub fn remove_sender(&self, id: StreamId) -> bool {
        let mut state = self.state.lock();
        let before = state.senders.len();
        state.senders.retain(|s| s.id != id);
        state.senders.len() != before
    }

    pub fn has_sender(&self) -> bool {
        !self.state.lock().senders.is_empty()
    }

    pub fn set_ssrc_filter(&self, enabled: bool, timeout: Millis) {
        self.state.lock().filter = SsrcFilter::new(enabled, timeout);
    }

    pub fn valid_ssrc(&self) -> Option<u32> {
        self.state.lock().filter.valid_ssrc()
    }

    pub fn set_broadcaster_session(&self, session: Option<Arc<dyn BroadcasterSession>>) {
        let mut state = self.state.lock();
        state.broadcaster = session;
        state.next_refresh = 0;
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    /// Read one datagram if there is one. `Ok(false)` means nothing to read.
    pub fn receive_once(&self, now: Millis) -> io::Result<bool> {
        let mut packet = self.pool.acquire();
        match self.socket.recv_from(packet.recv_buffer()) {
            Ok((len, remote)) => {
                if !packet.set_len(len) {
                    tracing::trace!(addr = %self.local_addr, %remote, "oversized packet dropped");
                    for stream in self.streams() {
                        stream.relay_stats().record_malformed();
                    }
                    self.pool.recycle(packet);
                    return Ok(true);
                }
                packet.stamp(self.kind, now);
                self.process(now, packet, remote);
                Ok(true)
            }
            Err(e) => {
                self.pool.recycle(packet);
                match e.kind() {
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => Ok(false),
                    // ICMP unreachable for an earlier send, reported by some platforms
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => {
                        tracing::trace!(addr = %self.local_addr, "ignoring ICMP error on source socket");
                        Ok(true)
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// Filter one received packet and hand it to every registered stream.
    ///
    /// Returns true when at least one stream took it.
    pub fn process(&self, now: Millis, packet: PacketBuffer, remote: SocketAddr) -> bool {
        let (streams, ssrc_ok) = {
            let mut state = self.state.lock();
            let streams: Vec<_> = state.senders.iter().filter_map(SenderRef::upgrade).collect();
            let ssrc_ok = !packet.is_well_formed()
                || self.kind.is_rtcp()
                || state.filter.accept(packet.ssrc(), now);
            (streams, ssrc_ok)
        };

        if streams.is_empty() {
            self.pool.recycle(packet);
            return false;
        }

        if !packet.is_well_formed() {
            tracing::trace!(addr = %self.local_addr, %remote, len = packet.len(), "malformed packet dropped");
            for stream in &streams {
                stream.relay_stats().record_malformed();
            }
            self.pool.recycle(packet);
            return false;
        }

        if !ssrc_ok {
            tracing::trace!(
                addr = %self.local_addr,
                ssrc = format_args!("{:#010X}", packet.ssrc()),
                "packet from unexpected SSRC dropped"
            );
            for stream in &streams {
                stream.relay_stats().record_ssrc_rejected();
            }
            self.pool.recycle(packet);
            return false;
        }

        let shared = self.pool.share(packet);
        let mut taken = false;
        for stream in &streams {
            taken |= stream.ingest(now, shared.clone(), Some(remote));
        }
        taken
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fail_senders(&self, error: &io::Error) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            tracing::warn!(addr = %self.local_addr, error = %error, "source socket failed");
        }
        for stream in self.streams() {
            stream.mark_unusable();
        }
    }

    fn streams(&self) -> Vec<Arc<ReflectorStream>> {
        self.state
            .lock()
            .senders
            .iter()
            .filter_map(SenderRef::upgrade)
            .collect()
    }

    fn refresh_broadcaster(&self, now: Millis) {
        let session = {
            let mut state = self.state.lock();
            if state.senders.is_empty() || now < state.next_refresh {
                return;
            }
            let Some(session) = state.broadcaster.clone() else {
                return;
            };
            state.next_refresh = now + duration_ms(self.config.broadcaster_refresh_interval);
            session
        };
        session.refresh_timeout();
        tracing::trace!(addr = %self.local_addr, "broadcaster session refreshed");
    }
}

impl Task for SourceSocket {
    fn run(&self, now: Millis) -> Option<Millis> {
        if self.is_closed() {
            tracing::debug!(addr = %self.local_addr, "source socket task retired");
            return None;
        }

        // a full batch means more is probably waiting in the kernel
        let mut backlog = self.config.max_packets_per_pass > 0;
        for _ in 0..self.config.max_packets_per_pass {
            match self.receive_once(now) {
                Ok(true) => {}
                Ok(false) => {
                    backlog = false;
                    break;
                }
                Err(e) => {
                    self.fail_senders(&e);
                    backlog = false;
                    break;
                }
            }
        }

        self.refresh_broadcaster(now);
        if backlog {
            Some(now)
        } else {
            Some(now + duration_ms(self.config.socket_poll_interval))
        }
    }
}

impl std::fmt::Debug for SourceSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSocket")
            .field("local_addr", &self.local_addr)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}
