//! Table of live streams, keyed by broadcast destination.
//!
//! The signalling layer binds a stream when a broadcast is announced and
//! removes it when the broadcast goes away. Relay sources that are not live
//! sockets inject through [`ReflectorRegistry::push_raw_packet`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ReflectorConfig;
use crate::error::{ReflectorError, Result};
use crate::scheduler::Scheduler;
use crate::socket::SocketPool;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::stream::{ReflectorStream, SourceDescriptor, StreamId};
use crate::time::{Millis, milliseconds};

#[derive(Clone)]
pub struct ReflectorRegistry {
    streams: Arc<RwLock<HashMap<StreamId, Arc<ReflectorStream>>>>,
    sockets: Arc<SocketPool>,
    config: Arc<ReflectorConfig>,
    scheduler: Option<Scheduler>,
}

impl ReflectorRegistry {
    /// A registry whose streams are driven by the caller.
    pub fn new(config: ReflectorConfig) -> Self {
        let config = Arc::new(config);
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            sockets: Arc::new(SocketPool::new(config.clone())),
            config,
            scheduler: None,
        }
    }

    /// A registry that schedules every bound stream and socket on `scheduler`.
    pub fn with_scheduler(config: ReflectorConfig, scheduler: Scheduler) -> Self {
        Self {
            scheduler: Some(scheduler),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &Arc<ReflectorConfig> {
        &self.config
    }

    /// Bind a broadcast source, or share the stream already bound for it.
    ///
    /// A stream whose source socket failed is not handed out again; remove
    /// it and bind afresh.
    pub fn bind(&self, descriptor: SourceDescriptor) -> Result<Arc<ReflectorStream>> {
        descriptor.validate()?;
        let id = descriptor.id();

        let mut streams = self.streams.write();
        if let Some(existing) = streams.get(&id) {
            if !existing.is_source_usable() {
                return Err(ReflectorError::SourceUnusable(id));
            }
            return Ok(existing.clone());
        }

        let stream = ReflectorStream::new(
            descriptor,
            self.config.clone(),
            Arc::new(RelayStats::new()),
        );
        let fresh = stream.bind(&self.sockets)?;

        if let Some(scheduler) = &self.scheduler {
            let now = milliseconds();
            if fresh && let Some(pair) = stream.sockets() {
                scheduler.schedule(pair.rtp().clone(), now);
                scheduler.schedule(pair.rtcp().clone(), now);
            }
            scheduler.schedule(stream.clone(), now);
        }

        streams.insert(id, stream.clone());
        tracing::info!(stream = %id, "stream registered");
        Ok(stream)
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<ReflectorStream>> {
        self.streams.read().get(&id).cloned()
    }

    /// Tear down a stream's outputs, release its sockets and forget it.
    pub fn remove(&self, id: StreamId) -> Result<Arc<ReflectorStream>> {
        let stream = self
            .streams
            .write()
            .remove(&id)
            .ok_or(ReflectorError::StreamNotFound(id))?;
        stream.teardown_all_outputs();
        stream.unbind(&self.sockets);
        tracing::info!(stream = %id, "stream removed");
        Ok(stream)
    }

    /// Inject one packet into a registered stream.
    ///
    /// `Ok(false)` means the stream dropped it (malformed, duplicate or
    /// filtered), which is counted in the stream's stats.
    pub fn push_raw_packet(&self, id: StreamId, data: &[u8], is_rtcp: bool) -> Result<bool> {
        let stream = self.get(id).ok_or(ReflectorError::StreamNotFound(id))?;
        Ok(stream.push_packet(data, is_rtcp))
    }

    pub fn stream_count(&self) -> usize {
        self.streams.read().len()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.read().keys().copied().collect()
    }

    /// Counters summed over every registered stream.
    pub fn stats(&self) -> StatsSnapshot {
        self.streams
            .read()
            .values()
            .fold(StatsSnapshot::default(), |mut total, stream| {
                total += stream.relay_stats().snapshot();
                total
            })
    }

    /// Drive every stream on the calling thread. Used when no scheduler is
    /// attached.
    pub fn reflect_all(&self, now: Millis) {
        let streams: Vec<_> = self.streams.read().values().cloned().collect();
        for stream in streams {
            stream.reflect_if_due(now);
        }
    }

    pub fn socket_pool(&self) -> &Arc<SocketPool> {
        &self.sockets
    }
}

impl std::fmt::Debug for ReflectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectorRegistry")
            .field("streams", &self.stream_count())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
