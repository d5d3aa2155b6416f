//! # orbit-relay
//!
//! One-way block and transaction relay over lossy datagram links
//! (typified by satellite multicast).
//!
//! The sender ingests blocks and mempool transactions, compresses them
//! (orbit-compact), cuts them into FEC-protected chunks (orbit-fec),
//! interleaves chunks from a rolling window of blocks, and paces
//! transmission under per-group bitrate budgets. The receiver reconstructs
//! blocks from whatever subset of chunks arrives, in any order, shortcuts
//! body bytes it can regenerate from its own mempool, and survives process
//! restarts by persisting in-progress decodes on disk.
//!
//! There is no return channel: no acknowledgments, no retransmission
//! requests, no congestion control. Loss tolerance comes entirely from FEC
//! overhead and the continuous backfill cycle.
//!
//! ## Task model
//!
//! ```text
//! reader ──► dispatch ──► partial-block registry ──► reassembly ──► validator
//!                   └────► mempool (tx contents)
//!
//! interleaver(s) ──► priority-3 ring buffer ─┐
//! txn relay(s)   ──► priority-2 ring buffer ─┼──► writer ──► socket(s)
//! dispatch       ──► priority-0/1 buffers  ──┘   (token bucket per group)
//! ```
//!
//! One reader drives all sockets; one writer owns transmission; per-group
//! interleaver and txn tasks feed the background priorities. A startup task
//! reloads partial blocks from disk, and a sweeper times out abandoned
//! ones.

pub mod chain;
pub mod config;
mod error;
pub mod fecmsg;
pub mod interleave;
pub mod node;
pub mod partial;
pub mod queue;
pub mod recv;
pub mod ringbuffer;
pub mod throttle;
pub mod wire;

pub use chain::{AcceptStatus, BlockSource, BlockValidator, Mempool};
pub use config::{MulticastConfig, RelayConfig, UdpNodeConfig, UdpPortConfig};
pub use error::{RelayError, Result};
pub use node::RelayNode;
pub use partial::{
    parse_chunk_file_name, BlockState, ChunkFileNameParts, PartialBlock, PartialBlockRegistry,
};
pub use queue::{OutboundMessage, TxQueues, MAX_CONSECUTIVE_TX};
pub use recv::{ConnectionInfo, RelayCore};
pub use throttle::Throttle;
pub use wire::{MsgType, HEADER_SIZE, MAX_UDP_MESSAGE_LENGTH, PACKET_SIZE, UDP_PROTOCOL_VERSION};
