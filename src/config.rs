use crate::clock::Clock;
use crate::ids::{Mode, NodeId, SequenceId, StreamId, Streamlet, STREAM_MAX_USER_DEFINED};
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Duration;

/// All the configuration for a single user-defined stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Arbitrary name to refer to the stream by, unique among all streams.
    pub name: String,
    pub id: StreamId,
    pub mode: Mode,
    /// Broadcast streams address every node at once; chunks on them must carry target 0.
    pub broadcast: bool,
}

/// Process-wide configuration. Validated once at startup and shared read-only between tasks
///  as an `Arc<Config>` after that.
pub struct Config {
    /// The id of the local node. The host is node 1.
    pub node: NodeId,

    pub streams: FxHashMap<StreamId, StreamConfig>,

    /// The maximum data size of a single chunk; packets bigger than this are split. The implied
    ///  datagram size must be supported end-to-end, so this is the application's responsibility
    ///  to choose, the same way an MTU would be.
    pub max_chunk_data_size: usize,

    /// Min and max amount of time to wait between sending position chunks on a quiescent
    ///  reliable stream.
    pub position_chunk_min: Duration,
    pub position_chunk_max: Duration,

    /// How often the receive pipeline confirms received reliable sequences.
    pub confirmation: Duration,

    /// How many sequence ids an incomplete unreliable packet may lag behind the newest one
    ///  before it is silently discarded.
    pub max_unreliable_age: SequenceId,

    /// The first sequence the receiver expects per reliable streamlet.
    pub starts: FxHashMap<Streamlet, SequenceId>,

    pub clock: Arc<dyn Clock>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node == 0 {
            bail!("node id 0 is reserved");
        }
        if self.max_chunk_data_size < 25 || self.max_chunk_data_size > 30000 {
            bail!(
                "max_chunk_data_size must be in the range [25, 30000], was {}",
                self.max_chunk_data_size
            );
        }
        if self.position_chunk_min >= self.position_chunk_max {
            bail!("position_chunk_min must be smaller than position_chunk_max");
        }
        let mut names = FxHashSet::default();
        for (&id, stream) in &self.streams {
            if id == 0 {
                bail!("stream id 0 is invalid");
            }
            if id >= STREAM_MAX_USER_DEFINED {
                bail!(
                    "stream id {} collides with the reserved range starting at {}",
                    id,
                    STREAM_MAX_USER_DEFINED
                );
            }
            if stream.id != id {
                bail!("stream {:?} is registered under id {}", stream, id);
            }
            if !names.insert(stream.name.as_str()) {
                bail!("two streams share the name {:?}", stream.name);
            }
        }
        Ok(())
    }

    pub fn stream_by_id(&self, id: StreamId) -> Option<&StreamConfig> {
        self.streams.get(&id)
    }

    pub fn stream_by_name(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.values().find(|stream| stream.name == name)
    }

    pub fn id_from_name(&self, name: &str) -> Option<StreamId> {
        self.stream_by_name(name).map(|stream| stream.id)
    }

    /// The first sequence expected from the given streamlet, 1 if none was configured.
    pub fn start_for(&self, streamlet: Streamlet) -> SequenceId {
        self.starts.get(&streamlet).copied().unwrap_or(1)
    }
}
