//! Shared RTP/RTCP socket pairs keyed by destination address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ReflectorConfig;
use crate::error::{ReflectorError, Result};
use crate::packet::PacketKind;

use super::SourceSocket;

/// The RTP socket on `port` and the RTCP socket on `port + 1`.
#[derive(Debug)]
pub struct SocketPair {
    addr: SocketAddr,
    rtp: Arc<SourceSocket>,
    rtcp: Arc<SourceSocket>,
}

impl SocketPair {
    pub fn bind(addr: SocketAddr, config: Arc<ReflectorConfig>) -> Result<Self> {
        let rtcp_port = addr
            .port()
            .checked_add(1)
            .ok_or(ReflectorError::PortRangeExhausted)?;
        let rtp = SourceSocket::bind(addr, PacketKind::Rtp, config.clone())?;
        let rtcp = SourceSocket::bind(
            SocketAddr::new(addr.ip(), rtcp_port),
            PacketKind::Rtcp,
            config,
        )?;
        Ok(Self {
            addr,
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn rtp(&self) -> &Arc<SourceSocket> {
        &self.rtp
    }

    pub fn rtcp(&self) -> &Arc<SourceSocket> {
        &self.rtcp
    }

    pub fn socket(&self, kind: PacketKind) -> &Arc<SourceSocket> {
        match kind {
            PacketKind::Rtp => &self.rtp,
            PacketKind::Rtcp => &self.rtcp,
        }
    }

    fn close(&self) {
        self.rtp.close();
        self.rtcp.close();
    }
}

struct PoolEntry {
    pair: Arc<SocketPair>,
    refs: usize,
}

/// Reference-counted table of bound socket pairs.
///
/// Streams that share a destination share its sockets. The pair is closed
/// when the last stream releases it, which retires its socket tasks.
pub struct SocketPool {
    config: Arc<ReflectorConfig>,
    pairs: Mutex<HashMap<SocketAddr, PoolEntry>>,
}

impl SocketPool {
    pub fn new(config: Arc<ReflectorConfig>) -> Self {
        Self {
            config,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Get the pair for `addr`, binding it on first use.
    ///
    /// The flag is true when the pair was bound by this call.
    pub fn acquire(&self, addr: SocketAddr) -> Result<(Arc<SocketPair>, bool)> {
        let mut pairs = self.pairs.lock();
        if let Some(entry) = pairs.get_mut(&addr) {
            entry.refs += 1;
            return Ok((entry.pair.clone(), false));
        }
        let pair = Arc::new(SocketPair::bind(addr, self.config.clone())?);
        pairs.insert(
            addr,
            PoolEntry {
                pair: pair.clone(),
                refs: 1,
            },
        );
        Ok((pair, true))
    }

    /// Drop one reference. Returns true when the pair was closed.
    pub fn release(&self, addr: SocketAddr) -> bool {
        let mut pairs = self.pairs.lock();
        let Some(entry) = pairs.get_mut(&addr) else {
            return false;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        if let Some(entry) = pairs.remove(&addr) {
            entry.pair.close();
            tracing::info!(addr = %addr, "socket pair closed");
        }
        true
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<SocketPair>> {
        self.pairs.lock().get(&addr).map(|e| e.pair.clone())
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
