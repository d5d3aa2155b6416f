//! Sender-side block backfill with chunk interleaving, plus the mempool
//! transaction relay.
//!
//! Each multicast transmit group walks the chain continuously, keeping a
//! window of blocks FEC-encoded in memory and emitting one chunk from each
//! window entry per pass. Receivers with short receive windows therefore
//! see partial progress on many blocks rather than all-or-nothing on one.
//! `depth` bounds the walk to recent history (0 cycles the whole chain) and
//! `offset` staggers parallel streams.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::chain::{BlockSource, Mempool};
use crate::config::MulticastConfig;
use crate::fecmsg::{block_to_messages, tx_to_messages};
use crate::queue::{OutboundMessage, TxQueues, PRIO_BACKGROUND_BLOCK, PRIO_BACKGROUND_TX};
use crate::throttle::Throttle;
use crate::wire::multicast_magic;

/// Transactions remembered as already relayed (about a day's worth).
const SENT_TXN_CACHE: usize = 500_000;

/// Poll cadence while waiting for the initial sync to finish.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One block being interleaved out.
#[derive(Debug)]
struct WindowBlock {
    msgs: Vec<Vec<u8>>,
    next_index: usize,
}

/// The rolling window of in-flight blocks for one transmit group.
#[derive(Debug, Default)]
pub struct BlockWindow {
    map: BTreeMap<u64, WindowBlock>,
    bytes_in_window: u64,
}

impl BlockWindow {
    fn insert(&mut self, height: u64, msgs: Vec<Vec<u8>>) -> bool {
        // The walk can legitimately come back around to a block that is
        // still transmitting; leave it alone.
        if self.map.contains_key(&height) {
            return false;
        }
        self.bytes_in_window += (msgs.len() * orbit_fec::FEC_CHUNK_SIZE) as u64;
        self.map.insert(height, WindowBlock { msgs, next_index: 0 });
        true
    }

    /// Pops the next message of each block, in height order.
    fn next_round(&mut self) -> Vec<Vec<u8>> {
        let mut round = Vec::with_capacity(self.map.len());
        for entry in self.map.values_mut() {
            debug_assert!(entry.next_index < entry.msgs.len());
            round.push(entry.msgs[entry.next_index].clone());
            entry.next_index += 1;
        }
        round
    }

    /// Drops fully transmitted blocks, maintaining the byte accounting.
    fn gc(&mut self) {
        let bytes_in_window = &mut self.bytes_in_window;
        self.map.retain(|_, entry| {
            if entry.next_index == entry.msgs.len() {
                *bytes_in_window -= (entry.msgs.len() * orbit_fec::FEC_CHUNK_SIZE) as u64;
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn bytes_in_window(&self) -> u64 {
        self.bytes_in_window
    }

    /// Snapshot for stats consumers.
    pub fn snapshot(&self) -> WindowSnapshot {
        let mut snapshot = WindowSnapshot {
            bytes_in_window: self.bytes_in_window,
            ..Default::default()
        };
        for (height, entry) in &self.map {
            snapshot.min_height = Some(snapshot.min_height.map_or(*height, |h: u64| h.min(*height)));
            snapshot.max_height = Some(snapshot.max_height.map_or(*height, |h: u64| h.max(*height)));
            if entry.msgs.len() > snapshot.largest_chunks {
                snapshot.largest_chunks = entry.msgs.len();
                snapshot.largest_height = Some(*height);
            }
        }
        snapshot
    }
}

/// Point-in-time description of a block window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub bytes_in_window: u64,
    pub min_height: Option<u64>,
    pub max_height: Option<u64>,
    pub largest_height: Option<u64>,
    pub largest_chunks: usize,
}

/// Next height of the backfill walk given `depth`/`offset` bounds.
fn advance_height(current: u64, chain_height: u64, depth: u64) -> u64 {
    let mut height = current + 1;
    let window_bottom = (chain_height + 1).saturating_sub(depth);
    if depth > 0 && height < window_bottom {
        height = window_bottom;
    } else if height > chain_height {
        height = if depth == 0 { 0 } else { window_bottom };
    }
    height
}

/// Starting height honoring the configured offset.
fn start_height(chain_height: u64, depth: u64, offset: u64) -> u64 {
    if depth == 0 {
        offset % (chain_height + 1)
    } else {
        (chain_height + 1).saturating_sub(depth) + (offset % depth)
    }
}

/// The backfill task of one multicast transmit group.
pub async fn run_interleaver(
    cfg: MulticastConfig,
    dest: SocketAddr,
    queues: Arc<TxQueues>,
    chain: Arc<dyn BlockSource>,
    window: Arc<Mutex<BlockWindow>>,
    stop: Arc<AtomicBool>,
) {
    // Backfill only makes sense once the chain is usable.
    while chain.is_initial_sync() && !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(SYNC_POLL_INTERVAL).await;
    }
    if stop.load(Ordering::Relaxed) {
        return;
    }

    let chain_height = chain.chain_tip();
    let mut height = start_height(chain_height, cfg.depth, cfg.offset);
    let target_window = cfg.interleave.max(1);
    debug!(
        "interleaver group {} starting at height {} (tip {}, depth {}, window {})",
        cfg.group, height, chain_height, cfg.depth, target_window
    );

    while !stop.load(Ordering::Relaxed) {
        // Fill the interleaving window.
        let mut consecutive_skips = 0usize;
        while window.lock().expect("window poisoned").len() < target_window
            && !stop.load(Ordering::Relaxed)
        {
            let wanted = !window.lock().expect("window poisoned").map.contains_key(&height);
            if wanted {
                consecutive_skips = 0;
                let Some(block) = chain.read_block(height) else {
                    warn!("backfill block at height {} unavailable", height);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                };
                match block_to_messages(&block, height as i32) {
                    Ok((hash_prefix, msgs)) => {
                        trace!(
                            "fill block {:016x} height {} with {} chunks",
                            hash_prefix,
                            height,
                            msgs.len()
                        );
                        window.lock().expect("window poisoned").insert(height, msgs);
                    }
                    Err(e) => warn!("failed to encode block at height {}: {}", height, e),
                }
            } else {
                // Every candidate height is already in flight (the walk is
                // shorter than the window); transmit with what we have.
                consecutive_skips += 1;
                if consecutive_skips > target_window {
                    break;
                }
            }
            height = advance_height(height, chain.chain_tip(), cfg.depth);
        }

        // Emit one chunk from every window entry, in height order.
        let round = window.lock().expect("window poisoned").next_round();
        for bytes in round {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let msg = OutboundMessage {
                bytes,
                dest,
                magic: multicast_magic(),
            };
            if !queues.send(cfg.group, PRIO_BACKGROUND_BLOCK, msg).await {
                return;
            }
        }

        window.lock().expect("window poisoned").gc();
    }
}

/// The mempool transaction relay task of one transmit group.
///
/// Transactions go out in ancestor-score order, unsent in-mempool parents
/// first, under a transactions-per-second budget. A bounded LRU remembers
/// what was already relayed.
pub async fn run_txn_relay(
    cfg: MulticastConfig,
    dest: SocketAddr,
    queues: Arc<TxQueues>,
    chain: Arc<dyn BlockSource>,
    mempool: Arc<dyn Mempool>,
    stop: Arc<AtomicBool>,
) {
    debug_assert!(cfg.txn_per_sec > 0);
    while chain.is_initial_sync() && !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(SYNC_POLL_INTERVAL).await;
    }

    let mut sent: LruCache<[u8; 32], ()> =
        LruCache::new(NonZeroUsize::new(SENT_TXN_CACHE).expect("nonzero cache size"));
    let mut throttle = Throttle::new(cfg.txn_per_sec as f64);
    throttle.set_max_quota(2.0 * cfg.txn_per_sec as f64);

    while !stop.load(Ordering::Relaxed) {
        // Wait for at least one second's worth of quota before scanning.
        let quota = throttle.get_quota();
        if quota < cfg.txn_per_sec {
            let wait = throttle.estimate_wait(cfg.txn_per_sec as usize);
            tokio::time::sleep(Duration::from_millis(wait.max(10))).await;
            continue;
        }
        // Consume the whole batch quota whether or not the mempool can fill
        // it, so idle periods do not bank an unbounded burst.
        throttle.use_quota(quota as usize);

        let mut batch = Vec::with_capacity(quota as usize);
        for tx in mempool.by_ancestor_score() {
            if batch.len() >= quota as usize {
                break;
            }
            if sent.contains(&tx.txid()) {
                continue;
            }
            // Relay in-mempool parents first so receivers can accept the
            // child immediately.
            let mut pending = vec![tx];
            while let Some(next) = pending.pop() {
                let mut missing_parent = false;
                for input in &next.inputs {
                    if let Some(parent) = mempool.get_by_txid(&input.prevout.txid) {
                        if !sent.contains(&parent.txid())
                            && !pending.iter().any(|p| p.txid() == parent.txid())
                        {
                            pending.push(next.clone());
                            pending.push(parent);
                            missing_parent = true;
                            break;
                        }
                    }
                }
                if !missing_parent && sent.put(next.txid(), ()).is_none() {
                    batch.push(next);
                }
            }
        }

        for tx in batch {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            match tx_to_messages(&tx) {
                Ok(msgs) => {
                    for bytes in msgs {
                        let msg = OutboundMessage {
                            bytes,
                            dest,
                            magic: multicast_magic(),
                        };
                        if !queues.send(cfg.group, PRIO_BACKGROUND_TX, msg).await {
                            return;
                        }
                    }
                }
                Err(e) => debug!("failed to encode transaction: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_accounting() {
        let mut window = BlockWindow::default();
        assert!(window.insert(5, vec![vec![0u8; 10]; 3]));
        assert!(window.insert(6, vec![vec![0u8; 10]; 2]));
        // Re-inserting an in-flight height is a no-op.
        assert!(!window.insert(5, vec![vec![0u8; 10]; 9]));

        assert_eq!(window.len(), 2);
        assert_eq!(
            window.bytes_in_window(),
            5 * orbit_fec::FEC_CHUNK_SIZE as u64
        );

        // Two rounds drain the smaller block.
        assert_eq!(window.next_round().len(), 2);
        assert_eq!(window.next_round().len(), 2);
        window.gc();
        assert_eq!(window.len(), 1);
        assert_eq!(
            window.bytes_in_window(),
            3 * orbit_fec::FEC_CHUNK_SIZE as u64
        );

        assert_eq!(window.next_round().len(), 1);
        window.gc();
        assert!(window.is_empty());
        assert_eq!(window.bytes_in_window(), 0);
    }

    #[test]
    fn test_window_snapshot() {
        let mut window = BlockWindow::default();
        window.insert(10, vec![vec![0u8; 1]; 2]);
        window.insert(20, vec![vec![0u8; 1]; 7]);
        window.insert(15, vec![vec![0u8; 1]; 4]);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.min_height, Some(10));
        assert_eq!(snapshot.max_height, Some(20));
        assert_eq!(snapshot.largest_height, Some(20));
        assert_eq!(snapshot.largest_chunks, 7);
    }

    #[test]
    fn test_advance_height_cycles_whole_chain() {
        // depth 0: cycle 0..=tip forever.
        assert_eq!(advance_height(0, 10, 0), 1);
        assert_eq!(advance_height(9, 10, 0), 10);
        assert_eq!(advance_height(10, 10, 0), 0);
    }

    #[test]
    fn test_advance_height_trailing_depth() {
        // depth 4 on tip 10: heights 7..=10.
        assert_eq!(advance_height(7, 10, 4), 8);
        assert_eq!(advance_height(10, 10, 4), 7);
        // The tip moved forward; the walk snaps into the new window.
        assert_eq!(advance_height(3, 10, 4), 7);
    }

    #[test]
    fn test_start_height() {
        assert_eq!(start_height(10, 0, 0), 0);
        assert_eq!(start_height(10, 0, 25), 3);
        assert_eq!(start_height(10, 4, 0), 7);
        assert_eq!(start_height(10, 4, 2), 9);
        assert_eq!(start_height(10, 4, 6), 9);
    }
}
