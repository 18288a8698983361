//! RTP/RTCP reflection engine.
//!
//! Receives one broadcast source per [`ReflectorStream`] and fans its
//! packets out to a changing set of [`Output`]s. Outputs are grouped into
//! buckets whose deliveries are staggered in time so a popular stream does
//! not burst the network, and every output has its own delivery cursor so a
//! slow one never holds back the rest.
//!
//! ```no_run
//! use reflector::{ReflectorConfig, ReflectorRegistry, Scheduler, SourceDescriptor};
//!
//! let config = ReflectorConfig::default();
//! let scheduler = Scheduler::new(config.worker_threads);
//! scheduler.start()?;
//!
//! let registry = ReflectorRegistry::with_scheduler(config, scheduler.clone());
//! let stream = registry.bind(SourceDescriptor::new("239.1.1.1:5004".parse().unwrap()))?;
//! // stream.add_output(..) for every client that starts playing
//! # Ok::<(), reflector::ReflectorError>(())
//! ```

pub mod bucket;
pub mod config;
pub mod dedup;
pub mod error;
pub mod output;
pub mod packet;
pub mod registry;
pub mod scheduler;
pub mod sender;
pub mod socket;
pub mod stats;
pub mod stream;
pub mod thinning;
pub mod time;

pub use bucket::BucketTable;
pub use config::ReflectorConfig;
pub use dedup::{DuplicateFilter, SeqStatus};
pub use error::{ReflectorError, Result};
pub use output::{Output, OutputId, TrackId};
pub use packet::{PacketBuffer, PacketKind, PacketPool};
pub use registry::ReflectorRegistry;
pub use scheduler::{Scheduler, Task, TaskId};
pub use sender::Sender;
pub use socket::{BroadcasterSession, SocketPool, SourceSocket};
pub use stats::{BitRateMeter, RelayStats, StatsSnapshot, StreamStats};
pub use stream::{ReflectorStream, SourceDescriptor, StreamId};
pub use thinning::{NoThinning, PayloadTypeThinning, ThinningPolicy};
