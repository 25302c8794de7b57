//! Sluice is a datagram-oriented multiplexed messaging overlay. It accepts variable-size
//!  application *packets*, splits them into fixed-maximum-size *chunks*, sends the chunks over
//!  an unreliable datagram transport between a host and its clients, and reassembles them on
//!  receipt.
//!
//! ## Design goals
//!
//! * Several logical *streams* are multiplexed over a single transport endpoint, each with its
//!   own delivery discipline chosen from four modes:
//!   * unreliable/unordered - raw datagram semantics with reassembly and CRC only
//!   * unreliable/ordered - late packets are dropped rather than delivered out of order
//!   * reliable/unordered - everything arrives, completion order is whatever it is
//!   * reliable/ordered - everything arrives in send order, TCP style
//! * The abstraction is sending / receiving *packets* (defined-length chunks of data as opposed
//!   to streams of bytes)
//! * Big packets are sent without IP-level fragmentation - the overlay takes care of chunking,
//!   buffering and reassembling against a configured maximum chunk size
//! * Small chunks are combined into a single datagram, delaying the send for a configurable
//!   cutoff in bytes or milliseconds
//! * Reliability is negotiated with four control chunk kinds rather than per-packet acks:
//!   * *Position* - the sender names the newest sequence per quiet reliable stream, paced by a
//!     per-stream reminder with a min/max quiescence window
//!   * *Confirm* - the receiver periodically serializes its observed-sequence trackers
//!   * *Resend* - the receiver asks for specific sequences it is missing
//!   * *Truncate* - the peer releases the sender's retransmit cache up to a sequence
//! * There is a reliable checksum per datagram; a corrupt datagram is dropped whole and the
//!   connection carries on
//! * Per-chunk failures never tear anything down - cancellation propagates only by closing
//!   channels
//!
//! ## Wire format
//!
//! A datagram payload is a CRC followed by back-to-back chunks - all integers little-endian,
//!  the CRC is CRC-32/Castagnoli over everything after it:
//!
//! ```ascii
//! datagram := u32 crc  chunk*
//! chunk    := u16 source  u16 target  u16 stream  u32 sequence
//!             u16 subsequence  u16 data_len  bytes[data_len]
//! ```
//!
//! A chunk therefore serializes to `14 + data_len` bytes. For a packet split into N chunks the
//!  chunks carry consecutive sequence ids `s .. s+N-1` and subsequence ids `1 .. N`; a packet
//!  that fits one chunk carries subsequence 0. The terminal chunk of a split packet is always
//!  strictly shorter than its predecessors (a zero-length terminator is appended when the tail
//!  would have been exactly full-size), which is how the receiver recovers the chunk count
//!  without a length header.
//!
//! Stream ids below `2^15` are user-defined; the ids at `2^15 + 1 ..` are reserved for the
//!  overlay's control streams (Confirm, Truncate, Resend, Position, Ping, Pong, Ding, Dang,
//!  Dong, Punch, Stats, Join, Leave).
//!
//! ## Task model
//!
//! Every long-running piece is a cooperative task owning its state outright and talking to its
//!  neighbors over typed channels:
//!
//! ```ascii
//! [user packets] -> writer -> [chunks] -> send pipeline -> batcher --datagram--> peer
//! peer --datagram--> splitter -> [chunks] -> receive pipeline -> [packets] -> [user]
//!                                            |  reserved chunks routed back to the
//!                                            `-> send pipeline (Resend / Truncate)
//! ```
//!
//! Socket I/O, membership, latency probing and NAT punching live outside this crate, behind the
//!  [batch::DatagramWriter] / [batch::DatagramReader] seams.

pub mod batch;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod ids;
pub mod merger;
pub mod packet_tracker;
pub mod receive_pipeline;
pub mod reminder;
pub mod reserved;
pub mod send_pipeline;
pub mod sequence_tracker;
pub mod writer;
