//! Interfaces to the node the relay is embedded in.
//!
//! The relay never validates or stores blocks itself; it reads history for
//! backfill, consults the mempool to shortcut body reconstruction, and hands
//! finished blocks to the validator.

use std::sync::Arc;

use orbit_compact::{Block, Transaction};

/// Outcome of handing a reassembled block to the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStatus {
    Accepted,
    Invalid,
    /// The parent is unknown; on a one-way link the block is dropped and
    /// will come around again on the backfill cycle.
    MissingParent,
}

/// Read access to the local chain.
pub trait BlockSource: Send + Sync {
    fn read_block(&self, height: u64) -> Option<Block>;
    fn chain_tip(&self) -> u64;
    fn is_initial_sync(&self) -> bool;
}

/// Access to the local transaction pool.
pub trait Mempool: Send + Sync {
    fn get_tx(&self, wtxid: &[u8; 32]) -> Option<Arc<Transaction>>;
    fn get_by_txid(&self, txid: &[u8; 32]) -> Option<Arc<Transaction>>;
    /// Transactions ordered by ancestor fee rate, best first.
    fn by_ancestor_score(&self) -> Vec<Arc<Transaction>>;
    /// Offers a transaction received over the relay.
    fn submit(&self, tx: Transaction);
}

/// Hands reassembled blocks to consensus validation.
pub trait BlockValidator: Send + Sync {
    fn accept_block(&self, block: Block, from_trusted: bool) -> AcceptStatus;
}
