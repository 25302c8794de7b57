use crate::chunk::Chunk;
use crate::ids::{NodeId, SequenceId, StreamId, Streamlet};
use crate::sequence_tracker::SequenceTracker;
use rustc_hash::FxHashMap;

/// Sender-side cache of reliable chunks kept around for retransmission, keyed by streamlet and
///  then by sequence. Entries are added for every reliable chunk sent and removed when the peer
///  truncates; truncation is entirely peer-driven, there is no local expiry.
#[derive(Default)]
pub struct PacketTracker {
    chunks: FxHashMap<Streamlet, FxHashMap<SequenceId, Chunk>>,
}

impl PacketTracker {
    pub fn new() -> PacketTracker {
        PacketTracker::default()
    }

    pub fn add(&mut self, chunk: Chunk) {
        let streamlet = Streamlet {
            stream: chunk.stream,
            node: chunk.source,
        };
        self.chunks
            .entry(streamlet)
            .or_default()
            .insert(chunk.sequence, chunk);
    }

    pub fn remove(&mut self, stream: StreamId, node: NodeId, sequence: SequenceId) {
        let streamlet = Streamlet { stream, node };
        if let Some(inner) = self.chunks.get_mut(&streamlet) {
            inner.remove(&sequence);
            if inner.is_empty() {
                self.chunks.remove(&streamlet);
            }
        }
    }

    /// Removes every cached chunk on the streamlet with a sequence <= `sequence`.
    pub fn remove_up_to_and_including(
        &mut self,
        stream: StreamId,
        node: NodeId,
        sequence: SequenceId,
    ) {
        let streamlet = Streamlet { stream, node };
        if let Some(inner) = self.chunks.get_mut(&streamlet) {
            inner.retain(|&s, _| s > sequence);
            if inner.is_empty() {
                self.chunks.remove(&streamlet);
            }
        }
    }

    /// Removes every cached chunk whose sequence the tracker reports as observed.
    pub fn remove_matching(&mut self, tracker: &SequenceTracker) {
        let streamlet = Streamlet {
            stream: tracker.stream(),
            node: tracker.node(),
        };
        if let Some(inner) = self.chunks.get_mut(&streamlet) {
            inner.retain(|&s, _| !tracker.contains(s));
            if inner.is_empty() {
                self.chunks.remove(&streamlet);
            }
        }
    }

    pub fn get(&self, stream: StreamId, node: NodeId, sequence: SequenceId) -> Option<&Chunk> {
        self.chunks
            .get(&Streamlet { stream, node })
            .and_then(|inner| inner.get(&sequence))
    }

    pub fn contains(&self, stream: StreamId, node: NodeId, sequence: SequenceId) -> bool {
        self.get(stream, node, sequence).is_some()
    }

    /// True iff any chunks at all are cached for the streamlet. Because empty inner maps are
    ///  pruned eagerly, this is the "no outstanding reliable chunks" signal the reminder uses.
    pub fn contains_any_for(&self, stream: StreamId, node: NodeId) -> bool {
        self.chunks.contains_key(&Streamlet { stream, node })
    }
}
