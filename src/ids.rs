use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Identifies a node in the overlay. The host always has id 1, and ids are not reused: a client
///  that disconnects and reconnects is assigned a fresh id. 0 is reserved and never assigned.
pub type NodeId = u16;

/// Identifies a stream. User streams get ids below [STREAM_MAX_USER_DEFINED]; everything at or
///  above it is reserved for the overlay's own control streams.
pub type StreamId = u16;

/// Orders chunks within a streamlet. Even unordered and unreliable streams carry sequence ids -
///  they are what reassembly is keyed by. Sequences start at 1 and increment once per chunk
///  (not per packet). Wrap-around is not handled.
pub type SequenceId = u32;

/// Orders the chunks that came from the same packet. A packet that fits into a single chunk has
///  subsequence 0; otherwise the chunks carry 1, 2, 3, ... in order, with sequence and
///  subsequence incrementing together.
pub type SubsequenceIndex = u16;

pub const HOST_NODE_ID: NodeId = 1;

/// The first stream id that is not available to user-defined streams.
pub const STREAM_MAX_USER_DEFINED: StreamId = 1 << 15;

pub fn is_reserved(stream: StreamId) -> bool {
    stream >= STREAM_MAX_USER_DEFINED
}

/// The overlay's own control streams. All of them deal in individual chunks and never rely on
///  any higher-level reassembly or reliability machinery.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ReservedStream {
    /// Sent from a receiver to confirm receipt of reliable chunks (serialized SequenceTrackers).
    Confirm = STREAM_MAX_USER_DEFINED + 1,

    /// Sent from the host to a client to let it know which cached chunks it can forget about.
    Truncate,

    /// Sent from the host to a client to ask it to resend chunks that never arrived.
    Resend,

    /// Sent from a client to the host to report the newest sequence sent per reliable stream.
    Position,

    /// Ping is initiated by the host, Pong is the client's response.
    Ping,
    Pong,

    /// Ding/Dang/Dong measure how fast two clients can talk to each other: the host sends a Ding
    ///  to client A naming client B, A sends a Dang to B, and B sends a Dong back to the host.
    Ding,
    Dang,
    Dong,

    /// Tells a client to start or stop sending data directly to another client.
    Punch,

    /// Latency statistics reported from a client back to the host.
    Stats,

    /// Join and Leave are sent from the host to each client whenever membership changes.
    Join,
    Leave,
}

/// What kind of delivery a stream guarantees. Regardless of the mode, chunks that do arrive are
///  CRC-checked, reassembled to their original packet, and (except for UnreliableUnordered)
///  deduplicated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Mode {
    /// Packets can arrive out of order and dropped packets are not resent. Closest to raw UDP,
    ///  least overhead.
    UnreliableUnordered = 0,

    /// Packets may be dropped, but the ones that arrive are delivered in send order. A packet
    ///  that technically arrives late and complete is still rejected if a newer packet has
    ///  already been delivered.
    UnreliableOrdered,

    /// Every packet is delivered, possibly out of order.
    ReliableUnordered,

    /// Every packet is delivered in send order. Closest to TCP.
    ReliableOrdered,
}

impl Mode {
    pub fn reliable(self) -> bool {
        matches!(self, Mode::ReliableUnordered | Mode::ReliableOrdered)
    }

    pub fn ordered(self) -> bool {
        matches!(self, Mode::UnreliableOrdered | Mode::ReliableOrdered)
    }

    pub fn deduped(self) -> bool {
        self != Mode::UnreliableUnordered
    }
}

/// The pair (stream, sending node) - the grain at which all receiver-side state is kept.
///  Different senders produce independent sequence spaces on the same stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Streamlet {
    pub stream: StreamId,
    pub node: NodeId,
}
