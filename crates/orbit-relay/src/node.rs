//! Relay lifecycle: sockets, tasks, shutdown.
//!
//! `RelayNode::start` opens one socket per group (unicast groups on a
//! dual-stack wildcard bind, multicast groups on IPv4 with a
//! source-specific join), then spawns the task set: one reader over all
//! sockets, one writer (the transmit scheduler), one interleaver and
//! optionally one txn-relay task per multicast TX group, a one-shot
//! partial-block recovery scan, and the partial-block timeout sweeper.
//! `stop` tears everything down in reverse order.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{BlockSource, BlockValidator, Mempool};
use crate::config::{MulticastConfig, RelayConfig};
use crate::error::Result;
use crate::interleave::{run_interleaver, run_txn_relay, BlockWindow, WindowSnapshot};
use crate::partial::PartialBlockRegistry;
use crate::queue::{run_scheduler, GroupQueue, TxQueues};
use crate::recv::{ConnectionInfo, RelayCore};
use crate::wire::{multicast_magic, PACKET_SIZE};

/// Kernel receive buffer: room for ~10000 max-size packets.
const RECV_BUFFER_SIZE: usize = 10_000 * PACKET_SIZE;

/// Cadence of the partial-block timeout sweep.
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn nonblocking_udp(domain: Domain) -> std::io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Opens the dual-stack socket of a unicast group.
fn open_unicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = nonblocking_udp(Domain::IPV6)?;
    socket.set_only_v6(false)?;
    socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
    UdpSocket::from_std(socket.into())
}

/// Opens and configures the socket of one multicast group.
fn open_multicast_socket(cfg: &MulticastConfig) -> std::io::Result<UdpSocket> {
    let socket = nonblocking_udp(Domain::IPV4)?;
    let IpAddr::V4(mcast_ip) = cfg.mcast_addr.ip() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "multicast address must be IPv4",
        ));
    };

    if cfg.tx {
        // Transmissions leave through the configured interface, never loop
        // back, and carry the configured TTL and DSCP.
        socket.bind(&SocketAddr::new(IpAddr::V4(cfg.iface), 0).into())?;
        socket.set_multicast_loop_v4(false)?;
        socket.set_multicast_ttl_v4(cfg.ttl)?;
        socket.set_multicast_if_v4(&cfg.iface)?;
        socket.set_tos(cfg.dscp << 2)?;
    } else {
        socket.bind(
            &SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), cfg.mcast_addr.port())
                .into(),
        )?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        let actual = socket.recv_buffer_size()?;
        if actual < RECV_BUFFER_SIZE {
            warn!(
                "kernel clamped receive buffer to {} bytes (wanted {}); \
                 check net.core.rmem_max",
                actual, RECV_BUFFER_SIZE
            );
        }
        // Only accept the group from the configured source.
        let source = cfg.source.expect("rx config carries a source");
        socket.join_ssm_v4(&source, &mcast_ip, &cfg.iface)?;
        info!(
            "multicast rx: group {} on {} from {} (trusted {})",
            mcast_ip, cfg.iface, source, cfg.trusted
        );
    }
    UdpSocket::from_std(socket.into())
}

/// A running relay instance.
pub struct RelayNode {
    pub core: Arc<RelayCore>,
    pub queues: Arc<TxQueues>,
    stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    windows: Vec<(usize, Arc<Mutex<BlockWindow>>)>,
}

impl RelayNode {
    /// Opens sockets per the configuration and spawns the relay task set.
    pub async fn start(
        mut config: RelayConfig,
        chain: Arc<dyn BlockSource>,
        mempool: Arc<dyn Mempool>,
        validator: Arc<dyn BlockValidator>,
    ) -> Result<Self> {
        config.validate()?;
        let stop = Arc::new(AtomicBool::new(false));

        // Sockets and transmit queues, one group at a time. Unicast groups
        // come first with their configured numbering; multicast groups are
        // appended after them.
        let mut sockets: BTreeMap<usize, Arc<UdpSocket>> = BTreeMap::new();
        let mut queues = TxQueues::new();
        for port_cfg in &config.ports {
            let socket = Arc::new(open_unicast_socket(port_cfg.port)?);
            info!(
                "bound port {} for group {} at {} Mbps",
                port_cfg.port, port_cfg.group, port_cfg.mbps
            );
            sockets.insert(port_cfg.group, socket);
            let bytes_per_sec = port_cfg.mbps as f64 * 1e6 / 8.0;
            queues.insert(port_cfg.group, GroupQueue::rate_limited(bytes_per_sec, false));
        }
        let mut next_group = config.ports.len();
        for mcast_cfg in &mut config.multicast {
            mcast_cfg.group = next_group;
            next_group += 1;
            let socket = Arc::new(open_multicast_socket(mcast_cfg)?);
            sockets.insert(mcast_cfg.group, socket);
            if mcast_cfg.tx {
                let queue = if mcast_cfg.bps == 0 {
                    // Externally throttled: let the socket push back.
                    GroupQueue::unlimited(true)
                } else {
                    GroupQueue::rate_limited(mcast_cfg.bps as f64 / 8.0, true)
                };
                queues.insert(mcast_cfg.group, queue);
            }
        }
        let queues = Arc::new(queues);

        let registry =
            PartialBlockRegistry::new(config.partial_blocks_dir(), config.partial_timeout);
        let core = Arc::new(RelayCore::new(
            registry,
            chain.clone(),
            mempool.clone(),
            validator,
            queues.clone(),
            config.log_interval,
        ));

        // Peer table: persistent unicast nodes and multicast sources.
        for node in &config.nodes {
            core.add_peer(
                node.addr,
                ConnectionInfo {
                    local_magic: node.local_magic,
                    remote_magic: node.remote_magic,
                    group: node.group,
                    trusted: node.trusted,
                    multicast: false,
                    label: String::new(),
                },
            );
        }
        for mcast_cfg in &config.multicast {
            if let Some(source) = mcast_cfg.source {
                core.add_peer(
                    SocketAddr::new(IpAddr::V4(source), 0),
                    ConnectionInfo {
                        local_magic: multicast_magic(),
                        remote_magic: multicast_magic(),
                        group: mcast_cfg.group,
                        trusted: mcast_cfg.trusted,
                        multicast: true,
                        label: mcast_cfg.label.clone(),
                    },
                );
            }
        }

        let mut tasks = Vec::new();
        let mut windows = Vec::new();

        // Writer.
        tasks.push(tokio::spawn(run_scheduler(
            queues.clone(),
            sockets.clone(),
            stop.clone(),
        )));

        // Reader over all sockets.
        tasks.push(tokio::spawn(run_reader(
            sockets.values().cloned().collect(),
            core.clone(),
            stop.clone(),
        )));

        // Interleaver and txn tasks per multicast TX group.
        for mcast_cfg in &config.multicast {
            if !mcast_cfg.tx {
                continue;
            }
            if mcast_cfg.interleave > 0 {
                let window = Arc::new(Mutex::new(BlockWindow::default()));
                windows.push((mcast_cfg.group, window.clone()));
                tasks.push(tokio::spawn(run_interleaver(
                    mcast_cfg.clone(),
                    mcast_cfg.mcast_addr,
                    queues.clone(),
                    chain.clone(),
                    window,
                    stop.clone(),
                )));
            }
            if mcast_cfg.txn_per_sec > 0 {
                tasks.push(tokio::spawn(run_txn_relay(
                    mcast_cfg.clone(),
                    mcast_cfg.mcast_addr,
                    queues.clone(),
                    chain.clone(),
                    mempool.clone(),
                    stop.clone(),
                )));
            }
        }

        // One-shot recovery of on-disk partial blocks, then the timeout
        // sweeper.
        {
            let core = core.clone();
            tasks.push(tokio::spawn(async move {
                match core.registry.load_partial_blocks() {
                    Ok(decodable) => {
                        for key in decodable {
                            if let Some(entry) = core.registry.lookup(&key) {
                                let mut block =
                                    entry.lock().expect("partial block poisoned");
                                core.advance_block(&key, &mut block);
                            }
                        }
                    }
                    Err(e) => warn!("partial block recovery failed: {}", e),
                }
            }));
        }
        {
            let core = core.clone();
            let chain = chain.clone();
            let stop = stop.clone();
            tasks.push(tokio::spawn(async move {
                while !stop.load(Ordering::Relaxed) {
                    tokio::time::sleep(TIMEOUT_SWEEP_INTERVAL).await;
                    core.registry.sweep_timeouts(chain.is_initial_sync());
                    core.sweep_tx_decoders();
                }
            }));
        }

        Ok(Self {
            core,
            queues,
            stop,
            tasks,
            windows,
        })
    }

    /// Block-window snapshots of every transmitting group.
    pub fn window_snapshots(&self) -> Vec<(usize, WindowSnapshot)> {
        self.windows
            .iter()
            .map(|(group, window)| (*group, window.lock().expect("window poisoned").snapshot()))
            .collect()
    }

    /// Stops every task and releases the sockets.
    pub async fn stop(mut self) {
        debug!("stopping relay node");
        self.stop.store(true, Ordering::Relaxed);
        self.queues.abort_all();
        self.queues.notify_writer();
        for task in self.tasks.drain(..).rev() {
            task.abort();
            let _ = task.await;
        }
        self.core.registry.reset();
    }
}

/// The reader task: drains every socket into the dispatch core.
async fn run_reader(sockets: Vec<Arc<UdpSocket>>, core: Arc<RelayCore>, stop: Arc<AtomicBool>) {
    // One sub-task per socket keeps the hot path free of fan-in plumbing;
    // they share the dispatch core and die together via the stop flag.
    let mut readers = Vec::new();
    for socket in sockets {
        let core = core.clone();
        let stop = stop.clone();
        readers.push(tokio::spawn(async move {
            let mut buf = vec![0u8; PACKET_SIZE + 1];
            loop {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if len > PACKET_SIZE {
                            continue;
                        }
                        core.handle_packet(&mut buf[..len], from).await;
                    }
                    Err(e) => {
                        warn!("socket read error: {}", e);
                        return;
                    }
                }
            }
        }));
    }
    for reader in readers {
        let _ = reader.await;
    }
}
