//! Per-group transmit queues and the writer task.
//!
//! Each group owns four ring buffers ranked by priority: 0 high, 1
//! best-effort, 2 background transactions, 3 background blocks. A single
//! writer task drains every group, consuming rate-limiter quota per packet
//! and filling the packet authenticator on the way out. Sockets are
//! nonblocking; a full socket parks the writer on writability rather than
//! spinning.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::ringbuffer::{BufferStats, RingBuffer};
use crate::throttle::Throttle;
use crate::wire::{authenticator_is_blank, fill_authenticator, PACKET_SIZE};

/// Number of priority buffers per group.
pub const NUM_BUFFERS: usize = 4;

pub const PRIO_HIGH: usize = 0;
pub const PRIO_BEST_EFFORT: usize = 1;
pub const PRIO_BACKGROUND_TX: usize = 2;
pub const PRIO_BACKGROUND_BLOCK: usize = 3;

/// Outbound messages pending per buffer (~10 MB of packets per group).
pub const PENDING_MESSAGES_BUFF_SIZE: usize = 8192;

/// Packets sent back to back from one queue before yielding to others.
pub const MAX_CONSECUTIVE_TX: usize = 10;

/// One packet queued for transmission. The authenticator is filled lazily by
/// the writer, so queued bytes carry zeroed checksum words.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub bytes: Vec<u8>,
    pub dest: SocketAddr,
    pub magic: u64,
}

/// The four priority buffers and rate limiter of one transmit group.
pub struct GroupQueue {
    buffs: [RingBuffer<OutboundMessage>; NUM_BUFFERS],
    throttle: Mutex<Throttle>,
    /// Unlimited queues skip the rate limiter and let the socket push back.
    pub unlimited: bool,
    pub multicast: bool,
}

impl GroupQueue {
    /// A rate-limited queue with the given byte-per-second budget.
    pub fn rate_limited(bytes_per_sec: f64, multicast: bool) -> Self {
        let mut throttle = Throttle::new(bytes_per_sec);
        throttle.set_max_quota(2.0 * bytes_per_sec);
        Self {
            buffs: std::array::from_fn(|_| RingBuffer::new(PENDING_MESSAGES_BUFF_SIZE)),
            throttle: Mutex::new(throttle),
            unlimited: false,
            multicast,
        }
    }

    /// A queue throttled only by the socket.
    pub fn unlimited(multicast: bool) -> Self {
        Self {
            buffs: std::array::from_fn(|_| RingBuffer::new(PENDING_MESSAGES_BUFF_SIZE)),
            throttle: Mutex::new(Throttle::new(0.0)),
            unlimited: true,
            multicast,
        }
    }

    /// Index of the highest-priority buffer holding data.
    pub fn next_buff(&self) -> Option<usize> {
        (0..NUM_BUFFERS).find(|&i| !self.buffs[i].is_empty())
    }

    pub fn buffer(&self, priority: usize) -> &RingBuffer<OutboundMessage> {
        &self.buffs[priority]
    }

    pub fn stats(&self) -> [BufferStats; NUM_BUFFERS] {
        std::array::from_fn(|i| self.buffs[i].stats())
    }

    pub fn abort_all(&self) {
        for buff in &self.buffs {
            buff.abort_write();
        }
    }
}

impl std::fmt::Debug for GroupQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupQueue")
            .field("unlimited", &self.unlimited)
            .field("multicast", &self.multicast)
            .finish()
    }
}

/// The full set of transmit queues, one per group, built once at startup.
#[derive(Debug, Default)]
pub struct TxQueues {
    groups: BTreeMap<usize, Arc<GroupQueue>>,
    non_empty: Notify,
}

impl TxQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: usize, queue: GroupQueue) {
        self.groups.insert(group, Arc::new(queue));
    }

    pub fn group(&self, group: usize) -> Option<&Arc<GroupQueue>> {
        self.groups.get(&group)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&usize, &Arc<GroupQueue>)> {
        self.groups.iter()
    }

    /// Enqueues a message, waking the writer. Returns false on shutdown.
    pub async fn send(
        &self,
        group: usize,
        priority: usize,
        msg: OutboundMessage,
    ) -> bool {
        debug_assert!(priority < NUM_BUFFERS);
        debug_assert!(msg.bytes.len() <= PACKET_SIZE);
        let Some(queue) = self.groups.get(&group) else {
            warn!("send to unknown group {}", group);
            return false;
        };
        let ok = queue.buffs[priority].write(msg).await;
        if ok {
            self.non_empty.notify_one();
        }
        ok
    }

    /// Wakes the writer (used on shutdown).
    pub fn notify_writer(&self) {
        self.non_empty.notify_one();
    }

    fn any_ready(&self) -> bool {
        self.groups.values().any(|q| q.next_buff().is_some())
    }

    /// Per-buffer transmit statistics for every group.
    pub fn stats(&self) -> BTreeMap<usize, [BufferStats; NUM_BUFFERS]> {
        self.groups.iter().map(|(g, q)| (*g, q.stats())).collect()
    }

    pub fn abort_all(&self) {
        for queue in self.groups.values() {
            queue.abort_all();
        }
        self.non_empty.notify_one();
    }
}

/// The writer task: drains all queues into their sockets.
///
/// One scheduler iteration visits every group, sends up to
/// [`MAX_CONSECUTIVE_TX`] packets from its highest-priority non-empty
/// buffer under the rate limit, then decides how to wait: for socket space
/// when everything is full, for work when everything is empty, or until the
/// earliest queue has quota again.
pub async fn run_scheduler(
    queues: Arc<TxQueues>,
    sockets: BTreeMap<usize, Arc<UdpSocket>>,
    stop: Arc<AtomicBool>,
) {
    let mut next_send: HashMap<usize, Instant> = HashMap::new();
    debug!("transmit scheduler running over {} groups", sockets.len());

    loop {
        if stop.load(Ordering::Relaxed) {
            debug!("transmit scheduler stopping");
            return;
        }

        let mut t_next_tx = Instant::now() + Duration::from_secs(3600);
        let mut all_empty = true;
        let mut all_full = !sockets.is_empty();

        for (&group, queue) in queues.groups() {
            let now = Instant::now();
            let scheduled = *next_send.get(&group).unwrap_or(&now);
            if scheduled > now {
                t_next_tx = t_next_tx.min(scheduled);
                continue;
            }
            let Some(socket) = sockets.get(&group) else {
                continue;
            };

            let mut wouldblock = false;
            let mut consecutive = 0;
            while consecutive < MAX_CONSECUTIVE_TX {
                let Some(buff_idx) = queue.next_buff() else {
                    break;
                };
                if !queue.unlimited
                    && !queue.throttle.lock().expect("throttle poisoned").has_quota(PACKET_SIZE)
                {
                    break;
                }
                let buff = queue.buffer(buff_idx);
                let Some(send_result) = buff.with_front_mut(|msg| {
                    if authenticator_is_blank(&msg.bytes) {
                        fill_authenticator(&mut msg.bytes, msg.magic);
                    }
                    (socket.try_send_to(&msg.bytes, msg.dest), msg.bytes.len())
                }) else {
                    // Raced with GC of the buffer; re-select.
                    continue;
                };
                match send_result {
                    (Ok(sent), len) => {
                        if sent != len {
                            warn!("short send on group {}: {} of {}", group, sent, len);
                        }
                        buff.confirm_read(len as u64);
                        if !queue.unlimited {
                            queue
                                .throttle
                                .lock()
                                .expect("throttle poisoned")
                                .use_quota(len);
                        }
                        consecutive += 1;
                    }
                    (Err(e), _) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        wouldblock = true;
                        break;
                    }
                    (Err(e), _) => {
                        warn!("sendto on group {} failed: {}", group, e);
                        break;
                    }
                }
            }

            // A queue that stopped for any reason other than a full socket
            // proves at least one socket still has room.
            if !wouldblock {
                all_full = false;
            }
            if queue.next_buff().is_some() {
                all_empty = false;
            }

            let wait_ms = if queue.unlimited {
                0
            } else {
                queue
                    .throttle
                    .lock()
                    .expect("throttle poisoned")
                    .estimate_wait(PACKET_SIZE)
            };
            let scheduled = Instant::now() + Duration::from_millis(wait_ms);
            next_send.insert(group, scheduled);
            t_next_tx = t_next_tx.min(scheduled);
        }

        // The waits are sequential, not exclusive: a writability wake-up
        // still honors the quota schedule below, and only a genuinely idle
        // writer parks on the work notification.
        if all_full {
            trace!("all sockets full, waiting for writability");
            let mut futs: Vec<_> = queues
                .groups()
                .filter_map(|(group, _)| sockets.get(group))
                .map(|s| Box::pin(s.writable()))
                .collect();
            std::future::poll_fn(|cx| {
                if futs.is_empty() {
                    return Poll::Ready(());
                }
                for fut in futs.iter_mut() {
                    if let Poll::Ready(_) = fut.as_mut().poll(cx) {
                        return Poll::Ready(());
                    }
                }
                Poll::Pending
            })
            .await;
        }
        let notified = queues.non_empty.notified();
        if all_empty && !queues.any_ready() {
            if !stop.load(Ordering::Relaxed) {
                notified.await;
            }
        } else if t_next_tx > Instant::now() {
            // Quota-gated: sleep until the earliest queue can send again.
            tokio::time::sleep_until(tokio::time::Instant::from_std(t_next_tx)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{build_control_message, MsgType};

    fn control_msg(dest: SocketAddr) -> OutboundMessage {
        OutboundMessage {
            bytes: build_control_message(MsgType::Keepalive, None),
            dest,
            magic: crate::wire::multicast_magic(),
        }
    }

    #[tokio::test]
    async fn test_priority_selection() {
        let mut queues = TxQueues::new();
        queues.insert(0, GroupQueue::unlimited(false));
        let queues = Arc::new(queues);
        let dest: SocketAddr = "127.0.0.1:9".parse().unwrap();

        let q = queues.group(0).unwrap();
        assert_eq!(q.next_buff(), None);

        queues.send(0, PRIO_BACKGROUND_BLOCK, control_msg(dest)).await;
        assert_eq!(queues.group(0).unwrap().next_buff(), Some(PRIO_BACKGROUND_BLOCK));

        queues.send(0, PRIO_HIGH, control_msg(dest)).await;
        assert_eq!(queues.group(0).unwrap().next_buff(), Some(PRIO_HIGH));
    }

    #[tokio::test]
    async fn test_scheduler_sends_and_stats() {
        // A receiver socket we can observe.
        let rx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let dest = rx.local_addr().unwrap();
        let tx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let mut queues = TxQueues::new();
        queues.insert(0, GroupQueue::rate_limited(1_000_000.0, false));
        let queues = Arc::new(queues);
        let stop = Arc::new(AtomicBool::new(false));

        let sched = tokio::spawn(run_scheduler(
            queues.clone(),
            BTreeMap::from([(0usize, tx)]),
            stop.clone(),
        ));

        for _ in 0..3 {
            assert!(queues.send(0, PRIO_BEST_EFFORT, control_msg(dest)).await);
        }

        let mut buf = [0u8; PACKET_SIZE];
        for _ in 0..3 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv_from(&mut buf))
                .await
                .expect("packet not delivered")
                .unwrap();
            assert_eq!(len, crate::wire::HEADER_SIZE);
        }

        let stats = queues.stats();
        assert_eq!(stats[&0][PRIO_BEST_EFFORT].tx_pkts, 3);

        stop.store(true, Ordering::Relaxed);
        queues.notify_writer();
        sched.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_paces_to_budget() {
        let rx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let dest = rx.local_addr().unwrap();
        let tx = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        // 40 packets/s worth of budget.
        let mut queues = TxQueues::new();
        queues.insert(0, GroupQueue::rate_limited(40.0 * PACKET_SIZE as f64, true));
        let queues = Arc::new(queues);
        let stop = Arc::new(AtomicBool::new(false));

        let sched = tokio::spawn(run_scheduler(
            queues.clone(),
            BTreeMap::from([(0usize, tx)]),
            stop.clone(),
        ));

        // 60 packets: the first ~40 ride the initial burst, the rest must
        // wait for quota, so the run takes at least ~400 ms.
        let chunk = vec![0u8; orbit_fec::FEC_CHUNK_SIZE];
        let start = Instant::now();
        for i in 0..60u32 {
            let bytes = crate::wire::build_chunk_message(
                MsgType::BlockContents,
                1,
                chunk.len() as u32,
                i,
                1,
                &chunk,
            );
            queues
                .send(
                    0,
                    PRIO_BACKGROUND_BLOCK,
                    OutboundMessage {
                        bytes,
                        dest,
                        magic: crate::wire::multicast_magic(),
                    },
                )
                .await;
        }
        let mut buf = [0u8; PACKET_SIZE];
        for _ in 0..60 {
            tokio::time::timeout(Duration::from_secs(5), rx.recv_from(&mut buf))
                .await
                .expect("packet not delivered")
                .unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");

        stop.store(true, Ordering::Relaxed);
        queues.notify_writer();
        sched.await.unwrap();
    }
}
