use crate::chunk::DATAGRAM_CRC_LEN;
use crate::config::Config;
use crate::ids::{NodeId, SequenceId, StreamId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashSet;

/// Receiver-side record of which sequence ids have been observed on one streamlet, compacted
///  into a contiguous prefix plus a sparse set of ids beyond it.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    stream: StreamId,
    node: NodeId,

    /// The highest id such that every id at or below it has been observed.
    max_contiguous: SequenceId,

    /// Observed ids strictly beyond max_contiguous + 1.
    others: FxHashSet<SequenceId>,
}

impl SequenceTracker {
    /// A tracker whose first missing sequence is `start`.
    pub fn new(stream: StreamId, node: NodeId, start: SequenceId) -> SequenceTracker {
        SequenceTracker {
            stream,
            node,
            max_contiguous: start.saturating_sub(1),
            others: FxHashSet::default(),
        }
    }

    /// Idempotent; compacts the contiguous prefix as gaps close.
    pub fn add(&mut self, id: SequenceId) {
        if self.contains(id) {
            return;
        }
        self.others.insert(id);
        while self.others.remove(&(self.max_contiguous + 1)) {
            self.max_contiguous += 1;
        }
    }

    pub fn contains(&self, id: SequenceId) -> bool {
        id <= self.max_contiguous || self.others.contains(&id)
    }

    /// True iff every id up to and including `id` has been observed.
    pub fn contains_all_up_to(&self, id: SequenceId) -> bool {
        id <= self.max_contiguous
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn max_contiguous(&self) -> SequenceId {
        self.max_contiguous
    }
}

fn put_header(buf: &mut BytesMut, tracker: &SequenceTracker) {
    buf.put_u16_le(tracker.stream);
    buf.put_u16_le(tracker.node);
    buf.put_u32_le(tracker.max_contiguous);
}

/// Serializes a tracker into one or more chunk payloads of the form
///  `(stream, node, max_contiguous, sparse_ids...)`. Each payload is independently usable - the
///  header is repeated - and the union of the trackers parsed from all of them observes exactly
///  the ids the original does. A new payload is started before the running one reaches
///  `max_chunk_data_size - 4`.
pub fn make_sequence_tracker_chunk_datas(config: &Config, tracker: &SequenceTracker) -> Vec<Bytes> {
    let cutoff = config.max_chunk_data_size - DATAGRAM_CRC_LEN;

    let mut ret = Vec::new();
    let mut current = BytesMut::with_capacity(cutoff);
    put_header(&mut current, tracker);
    for &sequence in &tracker.others {
        if current.len() >= cutoff {
            ret.push(current.split().freeze());
            current.reserve(cutoff);
            put_header(&mut current, tracker);
        }
        current.put_u32_le(sequence);
    }
    ret.push(current.freeze());
    ret
}

/// Parses one payload produced by [make_sequence_tracker_chunk_datas]. A short read anywhere
///  invalidates the whole payload.
pub fn parse_sequence_tracker_chunk_data(data: &[u8]) -> anyhow::Result<SequenceTracker> {
    let mut data = data;
    let stream = Buf::try_get_u16_le(&mut data)?;
    let node = Buf::try_get_u16_le(&mut data)?;
    let max_contiguous = Buf::try_get_u32_le(&mut data)?;
    let mut others = FxHashSet::default();
    while data.has_remaining() {
        others.insert(Buf::try_get_u32_le(&mut data)?);
    }
    Ok(SequenceTracker {
        stream,
        node,
        max_contiguous,
        others,
    })
}
