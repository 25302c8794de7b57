use crate::chunk::DATAGRAM_CRC_LEN;
use crate::config::Config;
use crate::ids::{SequenceId, StreamId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;

/// Which sequences per stream the receiver wants retransmitted.
pub type ResendRequest = FxHashMap<StreamId, Vec<SequenceId>>;

/// The newest sequence per stream whose cached chunks the sender can forget.
pub type TruncateRequest = FxHashMap<StreamId, SequenceId>;

/// The newest sequence per stream the sender has sent.
pub type PositionUpdate = FxHashMap<StreamId, SequenceId>;

/// All three reserved payloads share one skeleton: fixed-width `(stream, sequence)` records
///  written back to back. A new payload is cut before the running one reaches
///  `max_chunk_data_size - 4`, so each resulting chunk is independently usable even if the
///  others are lost.
fn make_chunk_datas(
    config: &Config,
    records: impl Iterator<Item = (StreamId, SequenceId)>,
) -> Vec<Bytes> {
    let cutoff = config.max_chunk_data_size - DATAGRAM_CRC_LEN;

    let mut ret = Vec::new();
    let mut current = BytesMut::new();
    for (stream, sequence) in records {
        if current.len() >= cutoff {
            ret.push(current.split().freeze());
        }
        current.put_u16_le(stream);
        current.put_u32_le(sequence);
    }
    if !current.is_empty() {
        ret.push(current.freeze());
    }
    ret
}

fn parse_records(data: &[u8], mut record: impl FnMut(StreamId, SequenceId)) -> anyhow::Result<()> {
    let mut data = data;
    while data.has_remaining() {
        let stream = Buf::try_get_u16_le(&mut data)?;
        let sequence = Buf::try_get_u32_le(&mut data)?;
        record(stream, sequence);
    }
    Ok(())
}

/// Serializes a resend request into zero or more independently usable chunk payloads.
pub fn make_resend_chunk_datas(config: &Config, req: &ResendRequest) -> Vec<Bytes> {
    make_chunk_datas(
        config,
        req.iter()
            .flat_map(|(&stream, sequences)| sequences.iter().map(move |&s| (stream, s))),
    )
}

pub fn parse_resend_chunk_data(data: &[u8]) -> anyhow::Result<ResendRequest> {
    let mut req = ResendRequest::default();
    parse_records(data, |stream, sequence| {
        req.entry(stream).or_default().push(sequence)
    })?;
    Ok(req)
}

/// Serializes a truncate request into zero or more independently usable chunk payloads.
pub fn make_truncate_chunk_datas(config: &Config, req: &TruncateRequest) -> Vec<Bytes> {
    make_chunk_datas(config, req.iter().map(|(&stream, &sequence)| (stream, sequence)))
}

pub fn parse_truncate_chunk_data(data: &[u8]) -> anyhow::Result<TruncateRequest> {
    let mut req = TruncateRequest::default();
    parse_records(data, |stream, sequence| {
        req.insert(stream, sequence);
    })?;
    Ok(req)
}

/// Serializes a position update into zero or more independently usable chunk payloads.
pub fn make_position_chunk_datas(config: &Config, update: &PositionUpdate) -> Vec<Bytes> {
    make_chunk_datas(config, update.iter().map(|(&stream, &sequence)| (stream, sequence)))
}

pub fn parse_position_chunk_data(data: &[u8]) -> anyhow::Result<PositionUpdate> {
    let mut update = PositionUpdate::default();
    parse_records(data, |stream, sequence| {
        update.insert(stream, sequence);
    })?;
    Ok(update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    fn config_with_chunk_size(max_chunk_data_size: usize) -> Config {
        Config {
            node: 5,
            streams: FxHashMap::default(),
            max_chunk_data_size,
            position_chunk_min: Duration::from_millis(20),
            position_chunk_max: Duration::from_millis(50),
            confirmation: Duration::from_millis(10),
            max_unreliable_age: 25,
            starts: FxHashMap::default(),
            clock: Arc::new(TokioClock),
        }
    }

    #[test]
    fn test_empty_request_serializes_to_no_chunks() {
        let config = config_with_chunk_size(50);
        assert!(make_resend_chunk_datas(&config, &ResendRequest::default()).is_empty());
        assert!(make_truncate_chunk_datas(&config, &TruncateRequest::default()).is_empty());
        assert!(make_position_chunk_datas(&config, &PositionUpdate::default()).is_empty());
    }

    #[test]
    fn test_resend_round_trip() {
        let config = config_with_chunk_size(100);
        let mut req = ResendRequest::default();
        req.insert(9, vec![5, 7, 20]);
        req.insert(10, vec![90]);

        let datas = make_resend_chunk_datas(&config, &req);
        assert_eq!(datas.len(), 1);

        let parsed = parse_resend_chunk_data(&datas[0]).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_truncate_round_trip() {
        let config = config_with_chunk_size(100);
        let mut req = TruncateRequest::default();
        req.insert(9, 30);
        req.insert(10, 90);

        let datas = make_truncate_chunk_datas(&config, &req);
        assert_eq!(datas.len(), 1);
        assert_eq!(datas[0].len(), 12);

        let parsed = parse_truncate_chunk_data(&datas[0]).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_position_round_trip() {
        let config = config_with_chunk_size(100);
        let mut update = PositionUpdate::default();
        update.insert(9, 99);
        update.insert(10, 99);

        let datas = make_position_chunk_datas(&config, &update);
        assert_eq!(datas.len(), 1);

        let parsed = parse_position_chunk_data(&datas[0]).unwrap();
        assert_eq!(parsed, update);
    }

    /// A request too large for one chunk is cut into several, each independently parsable, whose
    ///  union is the original request.
    #[test]
    fn test_large_resend_request_is_cut_into_chunks() {
        let config = config_with_chunk_size(50);
        let mut req = ResendRequest::default();
        req.insert(9, (0..100).collect());

        let datas = make_resend_chunk_datas(&config, &req);
        assert!(datas.len() > 1);
        for data in &datas {
            assert!(data.len() <= 50 - DATAGRAM_CRC_LEN + 6);
            assert_eq!(data.len() % 6, 0);
        }

        let mut union = ResendRequest::default();
        for data in &datas {
            for (stream, sequences) in parse_resend_chunk_data(data).unwrap() {
                union.entry(stream).or_default().extend(sequences);
            }
        }
        union.get_mut(&9).unwrap().sort_unstable();
        assert_eq!(union, req);
    }

    #[rstest]
    #[case::cut_short_in_stream(&[9, 0, 5][..])]
    #[case::cut_short_in_sequence(&[9, 0, 5, 0, 0][..])]
    #[case::trailing_partial_record(&[9, 0, 5, 0, 0, 0, 10, 0][..])]
    fn test_parse_rejects_short_reads(#[case] data: &[u8]) {
        assert!(parse_resend_chunk_data(data).is_err());
        assert!(parse_truncate_chunk_data(data).is_err());
        assert!(parse_position_chunk_data(data).is_err());
    }
}
