use crate::chunk::Chunk;
use crate::config::StreamConfig;
use crate::ids::{NodeId, SequenceId, SubsequenceIndex};
use bytes::Bytes;
use std::cmp::min;
use tokio::sync::mpsc;

/// Breaks application packets into chunks, assigning consecutive sequence ids and the
///  subsequence indexes reassembly relies on.
pub struct ChunkWriter {
    stream: StreamConfig,
    source: NodeId,
    target: NodeId,
    max_chunk_data_size: usize,
    next_sequence: SequenceId,
}

impl ChunkWriter {
    pub fn new(
        stream: StreamConfig,
        source: NodeId,
        target: NodeId,
        max_chunk_data_size: usize,
        start_sequence: SequenceId,
    ) -> ChunkWriter {
        assert!(max_chunk_data_size > 0, "max_chunk_data_size must be positive");
        assert!(
            !stream.broadcast || target == 0,
            "cannot target a specific node on a broadcast stream"
        );

        ChunkWriter {
            stream,
            source,
            target,
            max_chunk_data_size,
            next_sequence: start_sequence,
        }
    }

    fn emit(&mut self, subsequence: SubsequenceIndex, data: Bytes) -> Chunk {
        let chunk = Chunk {
            sender_addr: None,
            source: self.source,
            target: self.target,
            stream: self.stream.id,
            sequence: self.next_sequence,
            subsequence,
            data,
        };
        self.next_sequence += 1;
        chunk
    }

    /// Splits `packet` into chunks with data length <= max_chunk_data_size. A zero-length chunk
    ///  is appended if the last chunk's length would otherwise have been exactly
    ///  max_chunk_data_size, so the terminal chunk of a multi-chunk packet is always strictly
    ///  shorter than its predecessors and can be detected by its size alone.
    pub fn chunk_packet(&mut self, mut packet: Bytes) -> Vec<Chunk> {
        if packet.len() <= self.max_chunk_data_size {
            return vec![self.emit(0, packet)];
        }

        let mut chunks = Vec::new();
        let mut subsequence: SubsequenceIndex = 1;
        let mut last_len = self.max_chunk_data_size;
        while !packet.is_empty() || last_len == self.max_chunk_data_size {
            let data = packet.split_to(min(self.max_chunk_data_size, packet.len()));
            last_len = data.len();
            chunks.push(self.emit(subsequence, data));
            subsequence += 1;
        }
        chunks
    }
}

/// Task form of the writer: reads packets, emits chunks until either channel closes.
pub async fn run_writer(
    stream: StreamConfig,
    source: NodeId,
    target: NodeId,
    max_chunk_data_size: usize,
    mut packets: mpsc::Receiver<Bytes>,
    chunks: mpsc::Sender<Chunk>,
) {
    let mut writer = ChunkWriter::new(stream, source, target, max_chunk_data_size, 1);
    while let Some(packet) = packets.recv().await {
        for chunk in writer.chunk_packet(packet) {
            if chunks.send(chunk).await.is_err() {
                return;
            }
        }
    }
}
