//! End-to-end loopback: a transmitting node feeds a receiving node over
//! real UDP sockets on localhost, and the receiver's validator sees the
//! original blocks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use orbit_compact::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use orbit_relay::queue::{GroupQueue, PRIO_BACKGROUND_BLOCK};
use orbit_relay::wire::multicast_magic;
use orbit_relay::{
    AcceptStatus, BlockSource, BlockValidator, ConnectionInfo, Mempool, OutboundMessage,
    PartialBlockRegistry, RelayCore, TxQueues,
};

struct TestChain {
    blocks: Vec<Block>,
}

impl BlockSource for TestChain {
    fn read_block(&self, height: u64) -> Option<Block> {
        self.blocks.get(height as usize).cloned()
    }
    fn chain_tip(&self) -> u64 {
        self.blocks.len() as u64 - 1
    }
    fn is_initial_sync(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct TestMempool {
    txs: Mutex<Vec<Arc<Transaction>>>,
    submitted: AtomicUsize,
}

impl Mempool for TestMempool {
    fn get_tx(&self, wtxid: &[u8; 32]) -> Option<Arc<Transaction>> {
        self.txs.lock().unwrap().iter().find(|t| &t.wtxid() == wtxid).cloned()
    }
    fn get_by_txid(&self, txid: &[u8; 32]) -> Option<Arc<Transaction>> {
        self.txs.lock().unwrap().iter().find(|t| &t.txid() == txid).cloned()
    }
    fn by_ancestor_score(&self) -> Vec<Arc<Transaction>> {
        self.txs.lock().unwrap().clone()
    }
    fn submit(&self, _tx: Transaction) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct TestValidator {
    accepted: Mutex<Vec<Block>>,
}

impl BlockValidator for TestValidator {
    fn accept_block(&self, block: Block, _from_trusted: bool) -> AcceptStatus {
        self.accepted.lock().unwrap().push(block);
        AcceptStatus::Accepted
    }
}

fn test_block(seed: u8, n_txs: usize) -> Block {
    Block {
        header: BlockHeader {
            version: 0x2000_0000,
            prev_block: [seed; 32],
            merkle_root: [seed.wrapping_add(1); 32],
            time: 1_700_000_000 + seed as u32,
            bits: 0x1d00_ffff,
            nonce: seed as u32,
        },
        txs: (0..n_txs)
            .map(|i| Transaction {
                version: 2,
                lock_time: 0,
                inputs: vec![TxIn {
                    prevout: OutPoint {
                        txid: [seed ^ i as u8; 32],
                        vout: i as u32,
                    },
                    script_sig: vec![seed.wrapping_add(i as u8); 20],
                    sequence: 0xffff_ffff,
                    witness: Vec::new(),
                }],
                outputs: vec![TxOut {
                    value: 25_000,
                    script_pubkey: orbit_compact::script::p2pkh_script(&[i as u8; 20]),
                }],
            })
            .collect(),
    }
}

/// Sender scheduler to receiver dispatch over real sockets.
#[tokio::test]
async fn test_blocks_relay_over_udp() {
    let rx_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let rx_addr = rx_socket.local_addr().unwrap();
    let tx_socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let tx_addr = tx_socket.local_addr().unwrap();

    // Sender side: a queue set and the writer task.
    let mut queues = TxQueues::new();
    queues.insert(0, GroupQueue::rate_limited(10_000_000.0, true));
    let queues = Arc::new(queues);
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let scheduler = tokio::spawn(orbit_relay::queue::run_scheduler(
        queues.clone(),
        std::collections::BTreeMap::from([(0usize, tx_socket)]),
        stop.clone(),
    ));

    // Receiver side: dispatch core fed straight from the socket.
    let tmp = tempfile::tempdir().unwrap();
    let registry = PartialBlockRegistry::new(
        tmp.path().join("partial_blocks"),
        Duration::from_secs(900),
    );
    let mempool = Arc::new(TestMempool::default());
    let validator = Arc::new(TestValidator::default());
    let chain = Arc::new(TestChain { blocks: Vec::new() });
    let mut rx_queues = TxQueues::new();
    rx_queues.insert(0, GroupQueue::unlimited(true));
    let core = Arc::new(RelayCore::new(
        registry,
        chain,
        mempool,
        validator.clone(),
        Arc::new(rx_queues),
        Duration::from_secs(10),
    ));
    core.add_peer(
        tx_addr,
        ConnectionInfo {
            local_magic: multicast_magic(),
            remote_magic: multicast_magic(),
            group: 0,
            trusted: false,
            multicast: false,
            label: "loopback".into(),
        },
    );

    let reader = {
        let core = core.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; orbit_relay::PACKET_SIZE];
            while !stop.load(Ordering::Relaxed) {
                let Ok(recv) = tokio::time::timeout(
                    Duration::from_millis(200),
                    rx_socket.recv_from(&mut buf),
                )
                .await
                else {
                    continue;
                };
                let (len, from) = recv.unwrap();
                core.handle_packet(&mut buf[..len], from).await;
            }
        })
    };

    // Relay two blocks.
    let blocks = [test_block(1, 25), test_block(9, 40)];
    for (height, block) in blocks.iter().enumerate() {
        let (_, msgs) = orbit_relay::fecmsg::block_to_messages(block, height as i32).unwrap();
        for bytes in msgs {
            assert!(
                queues
                    .send(
                        0,
                        PRIO_BACKGROUND_BLOCK,
                        OutboundMessage {
                            bytes,
                            dest: rx_addr,
                            magic: multicast_magic(),
                        },
                    )
                    .await
            );
        }
    }

    // Wait for both blocks to land in the validator.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if validator.accepted.lock().unwrap().len() >= 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "blocks not relayed in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let accepted = validator.accepted.lock().unwrap();
    assert_eq!(accepted.len(), 2);
    assert!(accepted.contains(&blocks[0]));
    assert!(accepted.contains(&blocks[1]));
    drop(accepted);

    stop.store(true, Ordering::Relaxed);
    queues.notify_writer();
    let _ = scheduler.await;
    let _ = reader.await;
}
