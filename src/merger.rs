use crate::chunk::Chunk;
use crate::ids::{SequenceId, SubsequenceIndex};
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;

/// Collects the chunks of one packet and detects when it is complete.
///
/// The number of chunks in the packet is not transmitted; it is deduced. A subsequence-0 chunk
///  means a single-chunk packet. Otherwise all interior chunks of a packet have the same
///  (maximal) data length and the terminal chunk is strictly shorter - the writer appends a
///  zero-length terminator when the tail would have been full-sized, so a length differential
///  always exists. The first pair of differently-sized chunks therefore pins down the terminal
///  index, which equals the chunk count.
struct ChunkSequencer {
    chunks: FxHashMap<SubsequenceIndex, Chunk>,
    last_seen: Option<(SubsequenceIndex, usize)>,
    num_chunks: usize,
    /// The sequence id of the first chunk of the packet.
    origin: SequenceId,
    /// Set once the payload was taken; `done` stays true afterwards so duplicates keep being
    ///  recognized and `now` arithmetic keeps working without the payload.
    shed: bool,
}

impl ChunkSequencer {
    fn new(origin: SequenceId) -> ChunkSequencer {
        ChunkSequencer {
            chunks: FxHashMap::default(),
            last_seen: None,
            num_chunks: 0,
            origin,
            shed: false,
        }
    }

    fn add_chunk(&mut self, chunk: Chunk) {
        assert_eq!(
            chunk.origin_sequence(),
            self.origin,
            "chunk routed to a sequencer with a different origin sequence"
        );

        if self.num_chunks == 0 {
            if chunk.subsequence == 0 {
                self.num_chunks = 1;
            } else {
                match self.last_seen {
                    Some((last_sub, last_len)) if chunk.data.len() != last_len => {
                        self.num_chunks = if chunk.data.len() < last_len {
                            chunk.subsequence as usize
                        } else {
                            last_sub as usize
                        };
                    }
                    _ => self.last_seen = Some((chunk.subsequence, chunk.data.len())),
                }
            }
        }
        self.chunks.insert(chunk.subsequence, chunk);
    }

    /// The `<=` guard (rather than `==`) tolerates a hostile sender slipping extra subsequence
    ///  indexes into a packet.
    fn done(&self) -> bool {
        self.num_chunks > 0 && (self.shed || self.num_chunks <= self.chunks.len())
    }

    fn num_chunks(&self) -> SequenceId {
        self.num_chunks as SequenceId
    }

    /// Concatenates the packet and sheds the payload, keeping only `num_chunks` for the
    ///  sequence arithmetic of the callers.
    fn take_packet(&mut self) -> Bytes {
        debug_assert!(self.done());

        let packet = if self.num_chunks == 1 {
            self.chunks.remove(&0).map(|c| c.data).unwrap_or_default()
        } else {
            let total = self.chunks.values().map(|c| c.data.len()).sum();
            let mut buf = BytesMut::with_capacity(total);
            // subsequence indexes are 1-based; a hostile sender can force completion with
            //  gaps in them, and malformed input must never panic
            for i in 1..=self.num_chunks {
                if let Some(chunk) = self.chunks.remove(&(i as SubsequenceIndex)) {
                    buf.put_slice(&chunk.data);
                }
            }
            buf.freeze()
        };

        self.chunks = FxHashMap::default();
        self.shed = true;
        packet
    }
}

/// Reassembly substrate for unreliable streams: a sliding window of sequencers keyed by origin
///  sequence. Anything older than the horizon is silently discarded, completed packets leave a
///  tombstone behind for dedup until the horizon passes them.
struct UnreliableMerger {
    chunks: FxHashMap<SequenceId, Option<ChunkSequencer>>,
    /// The lowest origin sequence still admissible.
    horizon: SequenceId,
    max_age: SequenceId,
}

impl UnreliableMerger {
    fn new(max_age: SequenceId) -> UnreliableMerger {
        UnreliableMerger {
            chunks: FxHashMap::default(),
            horizon: 0,
            max_age,
        }
    }

    fn add_chunk(&mut self, chunk: Chunk) -> Option<(Bytes, SequenceId)> {
        let origin = chunk.origin_sequence();
        if origin < self.horizon {
            return None;
        }

        if !self.chunks.contains_key(&origin) {
            self.chunks.insert(origin, Some(ChunkSequencer::new(origin)));

            if origin > self.max_age && origin - self.max_age > self.horizon {
                self.horizon = origin - self.max_age;
                let horizon = self.horizon;
                self.chunks.retain(|&sequence, _| sequence >= horizon);
            }
        }

        let slot = self.chunks.get_mut(&origin).expect("slot was just ensured");
        let sequencer = slot.as_mut()?; // tombstone: this packet was already emitted

        sequencer.add_chunk(chunk);
        if !sequencer.done() {
            return None;
        }
        let packet = sequencer.take_packet();
        let num_chunks = sequencer.num_chunks();
        *slot = None;
        Some((packet, num_chunks))
    }
}

/// Reassembly substrate for reliable streams: keeps every sequencer from `now` on. `now` is the
///  next origin sequence whose packet has not been fully released yet; it advances through every
///  consecutive completed sequencer, freeing them as it goes.
struct ReliableMerger {
    chunks: FxHashMap<SequenceId, ChunkSequencer>,
    now: SequenceId,
}

impl ReliableMerger {
    fn new(start: SequenceId) -> ReliableMerger {
        ReliableMerger {
            chunks: FxHashMap::default(),
            now: start,
        }
    }

    fn add_chunk(&mut self, chunk: Chunk) -> Option<(Bytes, SequenceId)> {
        let origin = chunk.origin_sequence();
        if origin < self.now {
            return None;
        }
        if self.chunks.get(&origin).is_some_and(ChunkSequencer::done) {
            // duplicate for a packet that was already completed
            return None;
        }

        let sequencer = self
            .chunks
            .entry(origin)
            .or_insert_with(|| ChunkSequencer::new(origin));
        sequencer.add_chunk(chunk);
        if !sequencer.done() {
            return None;
        }
        let packet = sequencer.take_packet();
        let num_chunks = sequencer.num_chunks();

        while let Some(sequencer) = self.chunks.get(&self.now) {
            if !sequencer.done() {
                break;
            }
            let next = self.now + sequencer.num_chunks();
            self.chunks.remove(&self.now);
            self.now = next;
        }

        Some((packet, num_chunks))
    }
}

/// Per-streamlet reassembly with the mode's ordering/dedup discipline applied on top. Built once
///  per (stream, source) by the receive pipeline; the mode is fixed at construction so the hot
///  path never re-branches on it.
pub struct ChunkMerger {
    kind: MergerKind,
}

enum MergerKind {
    UnreliableUnordered {
        merger: UnreliableMerger,
    },
    UnreliableOrdered {
        merger: UnreliableMerger,
        now: SequenceId,
    },
    ReliableUnordered {
        merger: ReliableMerger,
    },
    ReliableOrdered {
        merger: ReliableMerger,
        now: SequenceId,
        pending: FxHashMap<SequenceId, (Bytes, SequenceId)>,
    },
}

impl ChunkMerger {
    /// No reliability or ordering; `max_age` bounds how far an incomplete packet may lag behind
    ///  the newest one before being discarded.
    pub fn unreliable_unordered(max_age: SequenceId) -> ChunkMerger {
        ChunkMerger {
            kind: MergerKind::UnreliableUnordered {
                merger: UnreliableMerger::new(max_age),
            },
        }
    }

    /// No reliability, but packets that do arrive are delivered in send order. A packet that
    ///  completes after a newer one was already delivered is dropped.
    pub fn unreliable_ordered(start: SequenceId, max_age: SequenceId) -> ChunkMerger {
        ChunkMerger {
            kind: MergerKind::UnreliableOrdered {
                merger: UnreliableMerger::new(max_age),
                now: start,
            },
        }
    }

    /// Every packet is delivered exactly once, in whatever order it completes.
    pub fn reliable_unordered(start: SequenceId) -> ChunkMerger {
        ChunkMerger {
            kind: MergerKind::ReliableUnordered {
                merger: ReliableMerger::new(start),
            },
        }
    }

    /// Every packet is delivered exactly once, in send order. Completed packets are buffered
    ///  until the chain starting at `now` is unbroken, then released together.
    pub fn reliable_ordered(start: SequenceId) -> ChunkMerger {
        ChunkMerger {
            kind: MergerKind::ReliableOrdered {
                merger: ReliableMerger::new(start),
                now: start,
                pending: FxHashMap::default(),
            },
        }
    }

    /// Adds a chunk, returning any packets that become deliverable. All but the
    ///  reliable/ordered variant return at most one packet.
    pub fn add_chunk(&mut self, chunk: Chunk) -> Vec<Bytes> {
        match &mut self.kind {
            MergerKind::UnreliableUnordered { merger } => match merger.add_chunk(chunk) {
                Some((packet, _)) => vec![packet],
                None => vec![],
            },

            MergerKind::UnreliableOrdered { merger, now } => {
                let origin = chunk.origin_sequence();
                if origin < *now {
                    return vec![];
                }
                match merger.add_chunk(chunk) {
                    Some((packet, num_chunks)) => {
                        *now = origin + num_chunks;
                        vec![packet]
                    }
                    None => vec![],
                }
            }

            MergerKind::ReliableUnordered { merger } => match merger.add_chunk(chunk) {
                Some((packet, _)) => vec![packet],
                None => vec![],
            },

            MergerKind::ReliableOrdered { merger, now, pending } => {
                let origin = chunk.origin_sequence();
                if origin < *now {
                    return vec![];
                }
                let Some((packet, num_chunks)) = merger.add_chunk(chunk) else {
                    return vec![];
                };
                pending.insert(origin, (packet, num_chunks));

                let mut released = Vec::new();
                while let Some((packet, num_chunks)) = pending.remove(now) {
                    released.push(packet);
                    *now += num_chunks;
                }
                released
            }
        }
    }
}
