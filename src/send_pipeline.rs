use crate::chunk::Chunk;
use crate::config::Config;
use crate::ids::ReservedStream;
use crate::packet_tracker::PacketTracker;
use crate::reminder::StreamReminder;
use crate::reserved::{
    make_position_chunk_datas, parse_resend_chunk_data, parse_truncate_chunk_data, PositionUpdate,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The client's outgoing half: forwards user chunks to the host, keeps reliable ones cached for
///  retransmission until the host truncates them, answers resend requests from the cache, and
///  paces position chunks on reliable streams that have gone quiet.
///
/// `reserved` carries control chunks routed over from the receive pipeline. Closure of either
///  input channel terminates the loop; the reminder task is torn down on the way out.
pub async fn run_send_pipeline(
    config: Arc<Config>,
    mut from_core: mpsc::Receiver<Chunk>,
    mut reserved: mpsc::Receiver<Chunk>,
    to_host: mpsc::Sender<Chunk>,
) {
    let mut tracker = PacketTracker::new();
    let mut positions = PositionUpdate::default();
    let mut reminder = StreamReminder::new(
        config.position_chunk_min,
        config.position_chunk_max,
        config.clock.clone(),
    );

    loop {
        tokio::select! {
            chunk = from_core.recv() => {
                let Some(chunk) = chunk else { return };
                let Some(stream) = config.stream_by_id(chunk.stream) else {
                    warn!("tried to send a chunk on unknown stream {}", chunk.stream);
                    continue;
                };
                let reliable = stream.mode.reliable();
                let stream_id = stream.id;

                if to_host.send(chunk.clone()).await.is_err() {
                    return;
                }
                if reliable {
                    reminder.update(stream_id);
                    let position = positions.entry(stream_id).or_insert(0);
                    if chunk.sequence > *position {
                        *position = chunk.sequence;
                    }
                    tracker.add(chunk);
                }
            }

            chunk = reserved.recv() => {
                let Some(chunk) = chunk else { return };
                match ReservedStream::try_from(chunk.stream) {
                    Ok(ReservedStream::Resend) => {
                        if !handle_resend(&config, &tracker, &to_host, &chunk.data).await {
                            return;
                        }
                    }
                    Ok(ReservedStream::Truncate) => {
                        handle_truncate(&config, &mut tracker, &reminder, &chunk.data);
                    }
                    _ => {
                        debug!("ignoring reserved chunk on stream {}", chunk.stream);
                    }
                }
            }

            Some(streams) = reminder.recv() => {
                let update = streams
                    .iter()
                    .filter_map(|stream| positions.get(stream).map(|&sequence| (*stream, sequence)))
                    .collect::<PositionUpdate>();
                for data in make_position_chunk_datas(&config, &update) {
                    let chunk = Chunk {
                        sender_addr: None,
                        source: config.node,
                        target: 0,
                        stream: ReservedStream::Position.into(),
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

/// Replays the requested chunks from the retransmit cache. A sequence that is no longer cached
///  means the peer's truncate discipline and its resend requests disagree; that is logged and
///  the rest of the request is still served. Returns false iff `to_host` closed.
async fn handle_resend(
    config: &Config,
    tracker: &PacketTracker,
    to_host: &mpsc::Sender<Chunk>,
    data: &[u8],
) -> bool {
    let req = match parse_resend_chunk_data(data) {
        Ok(req) => req,
        Err(e) => {
            warn!("error parsing resend chunk data: {:#}", e);
            return true;
        }
    };
    for (stream, sequences) in req {
        if !config.stream_by_id(stream).is_some_and(|s| s.mode.reliable()) {
            warn!("resend requested for non-reliable stream {} - ignoring", stream);
            continue;
        }
        for sequence in sequences {
            match tracker.get(stream, config.node, sequence) {
                Some(cached) => {
                    if to_host.send(cached.clone()).await.is_err() {
                        return false;
                    }
                }
                None => {
                    warn!(
                        "resend requested for stream/sequence {}/{}, but that chunk is no longer cached",
                        stream, sequence
                    );
                }
            }
        }
    }
    true
}

/// Drops cached chunks the host will never ask for again. Replays are harmless: removing up to
///  an already-passed sequence is a no-op. Streams whose cache empties stop being reminded.
fn handle_truncate(
    config: &Config,
    tracker: &mut PacketTracker,
    reminder: &StreamReminder,
    data: &[u8],
) {
    let req = match parse_truncate_chunk_data(data) {
        Ok(req) => req,
        Err(e) => {
            warn!("error parsing truncate chunk data: {:#}", e);
            return;
        }
    };
    for (stream, sequence) in req {
        tracker.remove_up_to_and_including(stream, config.node, sequence);
        if !tracker.contains_any_for(stream, config.node) {
            reminder.clear(stream);
        }
    }
}
