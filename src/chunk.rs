use crate::ids::{NodeId, SequenceId, StreamId, SubsequenceIndex};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use std::net::SocketAddr;

/// CRC-32/Castagnoli, computed over everything in a datagram after the leading checksum. This is
///  part of the interoperability contract and must not change.
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Number of bytes reserved at the front of every datagram for the checksum.
pub const DATAGRAM_CRC_LEN: usize = 4;

const CHUNK_HEADER_LEN: usize = 14;

/// The unit of transmission: part or all of one packet, together with the addressing and
///  sequencing data needed to route and reassemble it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Chunk {
    /// Stamped on received chunks with the transport address the datagram came from. Never
    ///  serialized.
    pub sender_addr: Option<SocketAddr>,

    pub source: NodeId,
    pub target: NodeId,
    pub stream: StreamId,
    pub sequence: SequenceId,
    pub subsequence: SubsequenceIndex,

    pub data: Bytes,
}

impl Chunk {
    /// The number of bytes `ser` will append, without serializing.
    pub fn serialized_len(&self) -> usize {
        CHUNK_HEADER_LEN + self.data.len()
    }

    /// The sequence id of the first chunk of the packet this chunk belongs to.
    pub fn origin_sequence(&self) -> SequenceId {
        if self.subsequence == 0 {
            self.sequence
        } else {
            // subsequence indexes are 1-based
            self.sequence + 1 - self.subsequence as SequenceId
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let data_len = u16::try_from(self.data.len())
            .expect("chunk data length is bounded by max_chunk_data_size");

        buf.put_u16_le(self.source);
        buf.put_u16_le(self.target);
        buf.put_u16_le(self.stream);
        buf.put_u32_le(self.sequence);
        buf.put_u16_le(self.subsequence);
        buf.put_u16_le(data_len);
        buf.put_slice(&self.data);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Chunk> {
        let source = buf.try_get_u16_le()?;
        let target = buf.try_get_u16_le()?;
        let stream = buf.try_get_u16_le()?;
        let sequence = buf.try_get_u32_le()?;
        let subsequence = buf.try_get_u16_le()?;
        let data_len = buf.try_get_u16_le()? as usize;
        if buf.remaining() < data_len {
            bail!(
                "chunk declares {} bytes of data but only {} remain",
                data_len,
                buf.remaining()
            );
        }
        let data = buf.copy_to_bytes(data_len);

        Ok(Chunk {
            sender_addr: None,
            source,
            target,
            stream,
            sequence,
            subsequence,
            data,
        })
    }
}

/// A fully reassembled byte string as handed to the application.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub stream: StreamId,
    pub source: NodeId,
    pub data: Bytes,
}

/// Patches the checksum of a complete datagram into its four reserved leading bytes.
pub fn seal_datagram(buf: &mut [u8]) {
    let checksum = CASTAGNOLI.checksum(&buf[DATAGRAM_CRC_LEN..]);
    buf[..DATAGRAM_CRC_LEN].copy_from_slice(&checksum.to_le_bytes());
}

/// Parses a datagram as produced by the batcher: checks the leading CRC, then consumes chunks
///  until the buffer is exhausted. Any failure invalidates the whole datagram.
pub fn parse_chunks(buf: &[u8]) -> anyhow::Result<Vec<Chunk>> {
    let mut buf = buf;
    let checksum = Buf::try_get_u32_le(&mut buf)?;
    if checksum != CASTAGNOLI.checksum(buf) {
        bail!("datagram checksum mismatch");
    }
    let mut chunks = Vec::new();
    while buf.has_remaining() {
        chunks.push(Chunk::deser(&mut buf)?);
    }
    Ok(chunks)
}
