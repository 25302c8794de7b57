use crate::chunk::{Chunk, Packet};
use crate::config::Config;
use crate::ids::{is_reserved, Mode, ReservedStream, Streamlet};
use crate::merger::ChunkMerger;
use crate::sequence_tracker::{make_sequence_tracker_chunk_datas, SequenceTracker};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

fn make_merger(config: &Config, mode: Mode, streamlet: Streamlet) -> ChunkMerger {
    let start = config.start_for(streamlet);
    match mode {
        Mode::UnreliableUnordered => ChunkMerger::unreliable_unordered(config.max_unreliable_age),
        Mode::UnreliableOrdered => {
            ChunkMerger::unreliable_ordered(start, config.max_unreliable_age)
        }
        Mode::ReliableUnordered => ChunkMerger::reliable_unordered(start),
        Mode::ReliableOrdered => ChunkMerger::reliable_ordered(start),
    }
}

/// The client's incoming half: reassembles chunks from the host into packets for the
///  application, routes reserved chunks over to the send pipeline unchanged, and periodically
///  confirms the reliable sequences observed so far.
///
/// Per-streamlet mergers are built lazily on the first chunk from a given sender, so state
///  exists only for streamlets that actually carry traffic. Closure of `from_host` closes
///  `reserved` and returns.
pub async fn run_receive_pipeline(
    config: Arc<Config>,
    mut from_host: mpsc::Receiver<Chunk>,
    to_core: mpsc::Sender<Packet>,
    to_host: mpsc::Sender<Chunk>,
    reserved: mpsc::Sender<Chunk>,
) {
    let mut mergers: FxHashMap<Streamlet, ChunkMerger> = FxHashMap::default();
    let mut trackers: FxHashMap<Streamlet, SequenceTracker> = FxHashMap::default();
    let mut next_confirmation = config.clock.now() + config.confirmation;

    loop {
        tokio::select! {
            chunk = from_host.recv() => {
                // dropping `reserved` on the way out is what closes it
                let Some(chunk) = chunk else { return };

                if is_reserved(chunk.stream) {
                    if reserved.send(chunk).await.is_err() {
                        return;
                    }
                    continue;
                }
                let Some(stream) = config.stream_by_id(chunk.stream) else {
                    warn!("received a chunk on unknown stream {}", chunk.stream);
                    continue;
                };

                let streamlet = Streamlet {
                    stream: chunk.stream,
                    node: chunk.source,
                };
                if stream.mode.reliable() {
                    trackers
                        .entry(streamlet)
                        .or_insert_with(|| {
                            SequenceTracker::new(
                                streamlet.stream,
                                streamlet.node,
                                config.start_for(streamlet),
                            )
                        })
                        .add(chunk.sequence);
                }

                let mode = stream.mode;
                let source = chunk.source;
                let stream_id = stream.id;
                let merger = mergers
                    .entry(streamlet)
                    .or_insert_with(|| make_merger(&config, mode, streamlet));
                for data in merger.add_chunk(chunk) {
                    let packet = Packet {
                        stream: stream_id,
                        source,
                        data,
                    };
                    if to_core.send(packet).await.is_err() {
                        return;
                    }
                }
            }

            _ = config.clock.sleep_until(next_confirmation) => {
                next_confirmation = config.clock.now() + config.confirmation;
                for tracker in trackers.values() {
                    for data in make_sequence_tracker_chunk_datas(&config, tracker) {
                        let chunk = Chunk {
                            sender_addr: None,
                            source: config.node,
                            target: 0,
                            stream: ReservedStream::Confirm.into(),
                            sequence: 0,
                            subsequence: 0,
                            data,
                        };
                        if to_host.send(chunk).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::config::StreamConfig;
    use crate::ids::{NodeId, SequenceId, StreamId};
    use crate::sequence_tracker::parse_sequence_tracker_chunk_data;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::time::Duration;
    use tokio::time;

    fn test_config() -> Arc<Config> {
        let streams = [
            ("UU", 7, Mode::UnreliableUnordered),
            ("UO", 8, Mode::UnreliableOrdered),
            ("RU", 9, Mode::ReliableUnordered),
            ("RO", 10, Mode::ReliableOrdered),
        ]
        .into_iter()
        .map(|(name, id, mode)| {
            (
                id,
                StreamConfig {
                    name: name.to_string(),
                    id,
                    mode,
                    broadcast: false,
                },
            )
        })
        .collect();

        let starts = [
            (Streamlet { stream: 9, node: 777 }, 5),
            (Streamlet { stream: 10, node: 777 }, 5),
            (Streamlet { stream: 9, node: 778 }, 25),
            (Streamlet { stream: 10, node: 778 }, 25),
        ]
        .into_iter()
        .collect();

        Arc::new(Config {
            node: 5,
            streams,
            max_chunk_data_size: 50,
            position_chunk_min: Duration::from_millis(20),
            position_chunk_max: Duration::from_millis(50),
            confirmation: Duration::from_millis(10),
            max_unreliable_age: 25,
            starts,
            clock: Arc::new(TokioClock),
        })
    }

    struct Harness {
        from_host: mpsc::Sender<Chunk>,
        to_core: mpsc::Receiver<Packet>,
        to_host: mpsc::Receiver<Chunk>,
        reserved: mpsc::Receiver<Chunk>,
    }

    fn spawn_pipeline(config: Arc<Config>) -> Harness {
        let (from_host_tx, from_host_rx) = mpsc::channel(1024);
        let (to_core_tx, to_core_rx) = mpsc::channel(1024);
        let (to_host_tx, to_host_rx) = mpsc::channel(1024);
        let (reserved_tx, reserved_rx) = mpsc::channel(1024);
        tokio::spawn(run_receive_pipeline(
            config,
            from_host_rx,
            to_core_tx,
            to_host_tx,
            reserved_tx,
        ));
        Harness {
            from_host: from_host_tx,
            to_core: to_core_rx,
            to_host: to_host_rx,
            reserved: reserved_rx,
        }
    }

    /// A packet of `count` chunks whose payload encodes its own identity, so the reassembled
    ///  packet can be verified. Interior chunks are padded to the full chunk size.
    fn make_packet_chunks(
        config: &Config,
        stream: StreamId,
        node: NodeId,
        start: SequenceId,
        count: usize,
    ) -> Vec<Chunk> {
        (0..count)
            .map(|i| {
                let sequence = start + i as SequenceId;
                let subsequence = (i + 1) as u16;
                let mut data = BytesMut::new();
                data.put_u16_le(stream);
                data.put_u16_le(node);
                data.put_u32_le(sequence);
                let fill = if i + 1 == count {
                    // terminal chunk is strictly shorter
                    config.max_chunk_data_size - data.len() - 1
                } else {
                    config.max_chunk_data_size - data.len()
                };
                data.put_bytes(0, fill);
                Chunk {
                    sender_addr: None,
                    source: node,
                    target: 0,
                    stream,
                    sequence,
                    subsequence,
                    data: data.freeze(),
                }
            })
            .collect()
    }

    fn verify_packet(
        config: &Config,
        packet: &Packet,
        stream: StreamId,
        node: NodeId,
        start: SequenceId,
        count: usize,
    ) {
        assert_eq!(packet.stream, stream);
        assert_eq!(packet.source, node);
        let expected = make_packet_chunks(config, stream, node, start, count)
            .iter()
            .flat_map(|c| c.data.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(packet.data.as_ref(), expected.as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reassembles_chunks_into_packets() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        let mut chunks = Vec::new();
        // the packet at 0 is before the stream's start and must not be delivered
        chunks.extend(make_packet_chunks(&config, 10, 777, 0, 5));
        chunks.extend(make_packet_chunks(&config, 10, 777, 5, 5));
        chunks.extend(make_packet_chunks(&config, 10, 778, 25, 5));
        chunks.extend(make_packet_chunks(&config, 10, 777, 10, 5));
        for chunk in chunks {
            h.from_host.send(chunk).await.unwrap();
        }

        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 10, 777, 5, 5);
        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 10, 778, 25, 5);
        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 10, 777, 10, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserved_chunks_are_routed_through() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        for stream in [
            ReservedStream::Truncate,
            ReservedStream::Ping,
            ReservedStream::Ding,
            ReservedStream::Resend,
        ] {
            h.from_host
                .send(Chunk {
                    sender_addr: None,
                    source: 1,
                    target: 0,
                    stream: stream.into(),
                    sequence: 0,
                    subsequence: 0,
                    data: Bytes::from_static(b"payload"),
                })
                .await
                .unwrap();
        }

        for expected in [
            ReservedStream::Truncate,
            ReservedStream::Ping,
            ReservedStream::Ding,
            ReservedStream::Resend,
        ] {
            let routed = h.reserved.recv().await.unwrap();
            assert_eq!(routed.stream, StreamId::from(expected));
            assert_eq!(routed.data.as_ref(), b"payload");
        }

        tokio::select! {
            packet = h.to_core.recv() => panic!("reserved chunk reached the core: {:?}", packet),
            _ = time::sleep(Duration::from_millis(1)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreliable_unordered_delivery() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        // withhold the first chunk of each packet; the last two packets are beyond
        //  max_unreliable_age from the first ones
        let packet_starts = [1, 6, 11, 16, 26, 36];
        let mut held_back = Vec::new();
        for &start in &packet_starts {
            let mut chunks = make_packet_chunks(&config, 7, 777, start, 5);
            held_back.push(chunks.remove(0));
            for chunk in chunks {
                h.from_host.send(chunk).await.unwrap();
            }
        }
        // complete them in the order 11, 16, 1, 6, 36, 26; 1 and 6 are behind the horizon
        for index in [2, 3, 0, 1, 5, 4] {
            h.from_host.send(held_back[index].clone()).await.unwrap();
        }

        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 7, 777, 11, 5);
        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 7, 777, 16, 5);
        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 7, 777, 36, 5);
        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 7, 777, 26, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreliable_ordered_delivery() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        let packet_starts = [1, 6, 11, 16, 21, 26];
        let mut held_back = Vec::new();
        for &start in &packet_starts {
            let mut chunks = make_packet_chunks(&config, 8, 777, start, 5);
            held_back.push(chunks.remove(0));
            for chunk in chunks {
                h.from_host.send(chunk).await.unwrap();
            }
        }
        // completion order 11, 16, 1, 6, 26, 21: 1 and 6 are late, 21 completes after 26
        for index in [2, 3, 0, 1, 5, 4] {
            h.from_host.send(held_back[index].clone()).await.unwrap();
        }

        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 8, 777, 11, 5);
        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 8, 777, 16, 5);
        let packet = h.to_core.recv().await.unwrap();
        verify_packet(&config, &packet, 8, 777, 26, 5);

        tokio::select! {
            packet = h.to_core.recv() => panic!("out-of-order delivery: {:?}", packet),
            _ = time::sleep(Duration::from_millis(1)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_unordered_delivers_everything() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        let mut chunks = Vec::new();
        // the packet at 0 is before the configured start for (9, 777)
        for start in [0, 5, 10, 15, 20, 25] {
            chunks.extend(make_packet_chunks(&config, 9, 777, start, 5));
        }
        for chunk in chunks.into_iter().rev() {
            h.from_host.send(chunk).await.unwrap();
        }

        // reversed input completes packets newest-first
        for start in [25, 20, 15, 10, 5] {
            let packet = h.to_core.recv().await.unwrap();
            verify_packet(&config, &packet, 9, 777, start, 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_ordered_delivers_everything_in_order() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        let mut chunks = Vec::new();
        for start in [5, 10, 15, 20, 25] {
            chunks.extend(make_packet_chunks(&config, 10, 777, start, 5));
        }
        for chunk in chunks.into_iter().rev() {
            h.from_host.send(chunk).await.unwrap();
        }

        for start in [5, 10, 15, 20, 25] {
            let packet = h.to_core.recv().await.unwrap();
            verify_packet(&config, &packet, 10, 777, start, 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_chunks_cover_observed_sequences() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        let mut golden = SequenceTracker::new(9, 777, 5);
        for chunk in make_packet_chunks(&config, 9, 777, 5, 20) {
            golden.add(chunk.sequence);
            h.from_host.send(chunk).await.unwrap();
        }
        h.to_core.recv().await.unwrap();

        time::sleep(config.confirmation + Duration::from_millis(1)).await;

        let confirm = h.to_host.recv().await.unwrap();
        assert_eq!(confirm.stream, StreamId::from(ReservedStream::Confirm));
        assert_eq!(confirm.source, config.node);

        let tracker = parse_sequence_tracker_chunk_data(&confirm.data).unwrap();
        assert_eq!(tracker.stream(), 9);
        assert_eq!(tracker.node(), 777);
        for sequence in 0..40 {
            assert_eq!(tracker.contains(sequence), golden.contains(sequence), "sequence {}", sequence);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_streams_are_dropped() {
        let config = test_config();
        let mut h = spawn_pipeline(config.clone());

        let mut unknown = make_packet_chunks(&config, 42, 777, 1, 1);
        unknown[0].subsequence = 0;
        h.from_host.send(unknown.remove(0)).await.unwrap();

        tokio::select! {
            packet = h.to_core.recv() => panic!("chunk on unknown stream delivered: {:?}", packet),
            _ = time::sleep(Duration::from_millis(1)) => {}
        }
    }
}
