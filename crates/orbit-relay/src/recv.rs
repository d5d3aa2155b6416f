//! Inbound packet dispatch and block reassembly.
//!
//! A single reader task drives all sockets. Each packet is authenticated
//! with the peer's magic, then dispatched by type. There is one error
//! frontier here: recoverable problems drop the offending message with a
//! debug log; peer-fatal problems (bad SYN, too-new protocol) answer with a
//! DISCONNECT and forget the peer. Codec failures inside a partial block
//! drop that block only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, trace, warn};

use orbit_compact::{assemble_block, CodecVersion, CompactBlockHeader};
use orbit_fec::FecDecoder;

use crate::chain::{AcceptStatus, BlockSource, BlockValidator, Mempool};
use crate::partial::{
    chunk_file_obj_id, normalize_peer, BlockState, PartialBlock, PartialBlockKey,
    PartialBlockRegistry,
};
use crate::queue::{OutboundMessage, TxQueues, PRIO_HIGH};
use crate::wire::{
    build_control_message, protocol_version_cur, protocol_version_min, verify_authenticator,
    ChunkMessage, MsgType, HEADER_SIZE, PACKET_SIZE, UDP_PROTOCOL_VERSION,
};

/// Largest acceptable FEC object; larger advertisements are garbage.
const MAX_OBJ_SIZE: u32 = 8_000_000;

/// Completed single-transaction objects remembered to suppress rework.
const RECENT_TX_CACHE: usize = 4096;

/// Abandoned single-transaction decodes are dropped after this long.
const TX_DECODER_TIMEOUT: Duration = Duration::from_secs(60);

/// How a peer is attached to the relay.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub local_magic: u64,
    pub remote_magic: u64,
    pub group: usize,
    pub trusted: bool,
    pub multicast: bool,
    pub label: String,
}

/// Live state of one peer.
#[derive(Debug)]
pub struct PeerState {
    pub info: ConnectionInfo,
    pub got_syn: bool,
    pub got_syn_ack: bool,
    pub protocol_version: u64,
    pub last_recv: Instant,
    rx_bytes: u64,
    last_stat: Instant,
}

impl PeerState {
    fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            got_syn: false,
            got_syn_ack: false,
            protocol_version: 0,
            last_recv: Instant::now(),
            rx_bytes: 0,
            last_stat: Instant::now(),
        }
    }
}

/// Receiver-side state shared by the reader and maintenance tasks.
pub struct RelayCore {
    peers: Mutex<HashMap<SocketAddr, PeerState>>,
    pub registry: PartialBlockRegistry,
    tx_decoders: Mutex<HashMap<PartialBlockKey, (FecDecoder, Instant)>>,
    recent_txs: Mutex<LruCache<PartialBlockKey, ()>>,
    chain: Arc<dyn BlockSource>,
    mempool: Arc<dyn Mempool>,
    validator: Arc<dyn BlockValidator>,
    queues: Arc<TxQueues>,
    log_interval: Duration,
}

impl RelayCore {
    pub fn new(
        registry: PartialBlockRegistry,
        chain: Arc<dyn BlockSource>,
        mempool: Arc<dyn Mempool>,
        validator: Arc<dyn BlockValidator>,
        queues: Arc<TxQueues>,
        log_interval: Duration,
    ) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            registry,
            tx_decoders: Mutex::new(HashMap::new()),
            recent_txs: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECENT_TX_CACHE).expect("nonzero cache size"),
            )),
            chain,
            mempool,
            validator,
            queues,
            log_interval,
        }
    }

    pub fn chain(&self) -> &Arc<dyn BlockSource> {
        &self.chain
    }

    pub fn add_peer(&self, addr: SocketAddr, info: ConnectionInfo) {
        let addr = normalize_peer(addr, info.multicast);
        debug!("adding peer {} (group {}, trusted {})", addr, info.group, info.trusted);
        self.peers
            .lock()
            .expect("peers poisoned")
            .insert(addr, PeerState::new(info));
    }

    pub fn remove_peer(&self, addr: &SocketAddr) {
        if self.peers.lock().expect("peers poisoned").remove(addr).is_some() {
            debug!("removed peer {}", addr);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peers poisoned").len()
    }

    /// Finds the peer entry for a packet source. Multicast transmitters send
    /// from arbitrary source ports, so those peers are keyed by IP alone
    /// (port 0).
    fn peer_info(&self, from: SocketAddr) -> Option<(SocketAddr, ConnectionInfo)> {
        let peers = self.peers.lock().expect("peers poisoned");
        if let Some(state) = peers.get(&from) {
            return Some((from, state.info.clone()));
        }
        let normalized = SocketAddr::new(from.ip(), 0);
        peers
            .get(&normalized)
            .map(|state| (normalized, state.info.clone()))
    }

    /// Entry point for every received datagram. `buf` is the packet bytes;
    /// it is descrambled in place.
    pub async fn handle_packet(&self, buf: &mut [u8], from: SocketAddr) {
        if buf.len() < HEADER_SIZE || buf.len() > PACKET_SIZE {
            return;
        }
        let Some((peer_key, info)) = self.peer_info(from) else {
            trace!("packet from unknown sender {}", from);
            return;
        };
        if !verify_authenticator(buf, info.local_magic) {
            // Checksum mismatch: silent drop.
            return;
        }
        let Some(msg_type) = MsgType::from_byte(buf[16]) else {
            debug!("unknown message type {:#x} from {}", buf[16], from);
            return;
        };

        self.touch_peer(&peer_key, buf.len());

        if msg_type.carries_chunk() {
            if buf.len() != PACKET_SIZE {
                debug!("truncated chunk message from {}", from);
                return;
            }
            let msg = match ChunkMessage::decode(&buf[HEADER_SIZE..]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("bad chunk message from {}: {}", from, e);
                    return;
                }
            };
            self.handle_chunk_message(msg_type, msg, peer_key, &info).await;
        } else {
            self.handle_control_message(msg_type, buf, from, peer_key, &info).await;
        }
    }

    fn touch_peer(&self, peer_key: &SocketAddr, len: usize) {
        let mut peers = self.peers.lock().expect("peers poisoned");
        let Some(state) = peers.get_mut(peer_key) else {
            return;
        };
        state.last_recv = Instant::now();
        state.rx_bytes += len as u64;
        let elapsed = state.last_stat.elapsed();
        if elapsed >= self.log_interval {
            let mbps = state.rx_bytes as f64 * 8.0 / elapsed.as_secs_f64() / 1e6;
            debug!(
                "group {} ({}): average bit rate {:.2} Mbit/s",
                state.info.group, state.info.label, mbps
            );
            state.rx_bytes = 0;
            state.last_stat = Instant::now();
        }
    }

    async fn handle_control_message(
        &self,
        msg_type: MsgType,
        buf: &[u8],
        from: SocketAddr,
        peer_key: SocketAddr,
        info: &ConnectionInfo,
    ) {
        let value = (buf.len() == HEADER_SIZE + 8)
            .then(|| u64::from_le_bytes(buf[17..25].try_into().unwrap()));

        match msg_type {
            MsgType::Syn => {
                let Some(version) = value else {
                    debug!("invalidly sized SYN from {}", from);
                    self.disconnect_peer(peer_key, info).await;
                    return;
                };
                let ours = protocol_version_cur(UDP_PROTOCOL_VERSION);
                if protocol_version_min(version) > ours {
                    let err = crate::error::RelayError::ProtocolVersionTooLow {
                        peer_min: protocol_version_min(version),
                        ours,
                    };
                    warn!("{}; disconnecting {}", err, from);
                    self.disconnect_peer(peer_key, info).await;
                    return;
                }
                let mut peers = self.peers.lock().expect("peers poisoned");
                if let Some(state) = peers.get_mut(&peer_key) {
                    state.protocol_version = version;
                    state.got_syn = true;
                }
            }
            MsgType::Keepalive => {
                if buf.len() != HEADER_SIZE {
                    debug!("invalidly sized KEEPALIVE from {}", from);
                    self.disconnect_peer(peer_key, info).await;
                    return;
                }
                // A keepalive without our SYN means the other side was up
                // across our restart; treat the session as established.
                let mut peers = self.peers.lock().expect("peers poisoned");
                if let Some(state) = peers.get_mut(&peer_key) {
                    if !state.got_syn_ack {
                        debug!("session with {} established", from);
                    }
                    state.got_syn = true;
                    state.got_syn_ack = true;
                }
            }
            MsgType::Disconnect => {
                debug!("disconnect from {}", from);
                self.remove_peer(&peer_key);
            }
            MsgType::Ping => {
                let Some(nonce) = value else {
                    debug!("invalidly sized PING from {}", from);
                    self.disconnect_peer(peer_key, info).await;
                    return;
                };
                let reply = OutboundMessage {
                    bytes: build_control_message(MsgType::Pong, Some(nonce)),
                    dest: from,
                    magic: info.remote_magic,
                };
                self.queues.send(info.group, PRIO_HIGH, reply).await;
            }
            MsgType::Pong => {
                if value.is_none() {
                    debug!("invalidly sized PONG from {}", from);
                    self.disconnect_peer(peer_key, info).await;
                } else {
                    trace!("pong from {}", from);
                }
            }
            _ => unreachable!("chunk types handled elsewhere"),
        }
    }

    async fn disconnect_peer(&self, peer_key: SocketAddr, info: &ConnectionInfo) {
        let msg = OutboundMessage {
            bytes: build_control_message(MsgType::Disconnect, None),
            dest: peer_key,
            magic: info.remote_magic,
        };
        self.queues.send(info.group, PRIO_HIGH, msg).await;
        self.remove_peer(&peer_key);
    }

    async fn handle_chunk_message(
        &self,
        msg_type: MsgType,
        msg: ChunkMessage,
        peer_key: SocketAddr,
        info: &ConnectionInfo,
    ) {
        if msg.obj_length == 0 || msg.obj_length > MAX_OBJ_SIZE {
            debug!("object length {} out of range from {}", msg.obj_length, peer_key);
            return;
        }
        if msg_type == MsgType::TxContents {
            self.handle_tx_chunk(msg, peer_key);
        } else {
            self.handle_block_chunk(msg_type == MsgType::BlockHeader, msg, peer_key, info);
        }
    }

    fn handle_block_chunk(
        &self,
        is_header: bool,
        msg: ChunkMessage,
        peer_key: SocketAddr,
        info: &ConnectionInfo,
    ) {
        let key: PartialBlockKey = (msg.hash_prefix, peer_key);
        if self.registry.is_recently_done(&key) {
            return;
        }
        let codec_version = match CodecVersion::from_byte(msg.codec_version) {
            Ok(v) => v,
            Err(e) => {
                // Newer stream than we speak: drop this block only, never
                // the process.
                debug!("{} for block {:016x}; dropping partial", e, msg.hash_prefix);
                self.registry.mark_removed(&key);
                return;
            }
        };
        let Some(entry) = self.registry.get_or_create(msg.hash_prefix, peer_key, info.trusted)
        else {
            return;
        };
        let mut block = entry.lock().expect("partial block poisoned");
        block.codec_version.get_or_insert(codec_version);

        let decoder = if is_header {
            &mut block.header_decoder
        } else {
            &mut block.body_decoder
        };
        if decoder.is_none() {
            let obj_id = chunk_file_obj_id(peer_key, msg.hash_prefix, is_header);
            match FecDecoder::new_mmap(
                msg.obj_length as usize,
                self.registry.dir(),
                Some(&obj_id),
                true,
            ) {
                Ok(new_decoder) => *decoder = Some(new_decoder),
                Err(e) => {
                    warn!("failed to create decoder for {}: {}", obj_id, e);
                    return;
                }
            }
        }
        let decoder = decoder.as_mut().expect("decoder just created");
        if decoder.obj_size() != msg.obj_length as usize {
            debug!(
                "length mismatch for {:016x}: {} vs {}",
                msg.hash_prefix,
                decoder.obj_size(),
                msg.obj_length
            );
            return;
        }

        let before = decoder.chunks_received();
        match decoder.provide_chunk(&msg.payload, msg.chunk_id) {
            Ok(true) => {
                if decoder.chunks_received() > before {
                    block.touch();
                }
            }
            Ok(false) => {
                trace!("chunk id {} rejected for {:016x}", msg.chunk_id, msg.hash_prefix);
                return;
            }
            Err(e) => {
                // Codec breakage poisons only this block.
                warn!("decoder failure for {:016x}: {}; dropping partial", msg.hash_prefix, e);
                drop(block);
                self.registry.mark_removed(&key);
                return;
            }
        }

        if is_header && block.state == BlockState::Init {
            block.state = BlockState::HeaderReceived;
        }
        self.advance_block(&key, &mut block);
    }

    /// Drives a partial block as far as current data allows: processes a
    /// completed header, shortcuts the body from the mempool, reassembles
    /// and validates once the body decodes.
    pub fn advance_block(&self, key: &PartialBlockKey, block: &mut PartialBlock) {
        // Step 1: header finished and not yet parsed.
        if block.is_header_processing() && block.assembler.is_none() && block.body_decoder.is_some()
        {
            let header_bytes = match block.header_decoder.as_mut().unwrap().decoded_data() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("header decode for {:016x} failed: {}", key.0, e);
                    return;
                }
            };
            let compact = match CompactBlockHeader::decode(&header_bytes) {
                Ok(compact) => compact,
                Err(e) => {
                    debug!("bad compact header for {:016x}: {}; dropping partial", key.0, e);
                    self.registry.finish(key, block, BlockState::Removed);
                    return;
                }
            };
            if compact.header.hash_prefix() != key.0 {
                debug!("hash prefix mismatch for {:016x}; dropping partial", key.0);
                self.registry.finish(key, block, BlockState::Removed);
                return;
            }
            block.height = Some(compact.height);
            let body_len = block.body_decoder.as_ref().unwrap().obj_size();
            match orbit_compact::BlockAssembler::new(compact, body_len) {
                Ok(assembler) => block.assembler = Some(assembler),
                Err(e) => {
                    debug!("assembler init for {:016x} failed: {}; dropping partial", key.0, e);
                    self.registry.finish(key, block, BlockState::Removed);
                    return;
                }
            }

            // Shortcut chunks the mempool can regenerate.
            let mempool_txs = self.mempool.by_ancestor_score();
            let assembler = block.assembler.as_mut().unwrap();
            let chunks = assembler.fill_from_mempool(mempool_txs.iter().map(|tx| tx.as_ref()));
            if !chunks.is_empty() {
                debug!(
                    "filled {} body chunks of {:016x} from mempool",
                    chunks.len(),
                    key.0
                );
                let decoder = block.body_decoder.as_mut().unwrap();
                for (chunk_id, chunk) in chunks {
                    if let Err(e) = decoder.provide_chunk(&chunk, chunk_id) {
                        warn!("mempool chunk rejected for {:016x}: {}", key.0, e);
                        break;
                    }
                }
            }
        }

        // Step 2: body finished and header parsed.
        if block.is_decodable() && block.assembler.is_some() {
            if block.state == BlockState::Processing {
                return;
            }
            block.state = BlockState::Processing;
            let body = match block.body_decoder.as_mut().unwrap().decoded_data() {
                Ok(body) => body,
                Err(e) => {
                    warn!("body decode for {:016x} failed: {}", key.0, e);
                    self.registry.finish(key, block, BlockState::Removed);
                    return;
                }
            };
            let assembled = assemble_block(block.assembler.as_ref().unwrap().header(), &body);
            match assembled {
                Ok(full_block) => {
                    let status = self.validator.accept_block(full_block, block.from_trusted);
                    match status {
                        AcceptStatus::Accepted => {
                            debug!("block {:016x} accepted (height {:?})", key.0, block.height);
                            self.registry.finish(key, block, BlockState::Done);
                        }
                        AcceptStatus::Invalid => {
                            warn!("block {:016x} rejected by validator", key.0);
                            self.registry.finish(key, block, BlockState::Removed);
                        }
                        AcceptStatus::MissingParent => {
                            // One-way link: nothing to request from. The
                            // backfill cycle will bring the parent around.
                            debug!("block {:016x} missing parent; dropped", key.0);
                            self.registry.finish(key, block, BlockState::Removed);
                        }
                    }
                }
                Err(e) => {
                    debug!("reassembly of {:016x} failed: {}; dropping partial", key.0, e);
                    self.registry.finish(key, block, BlockState::Removed);
                }
            }
        } else if block.is_decodable() {
            block.state = BlockState::Decodable;
        }
    }

    fn handle_tx_chunk(&self, msg: ChunkMessage, peer_key: SocketAddr) {
        let key: PartialBlockKey = (msg.hash_prefix, peer_key);
        if self.recent_txs.lock().expect("recent txs poisoned").contains(&key) {
            return;
        }
        let codec_version = match CodecVersion::from_byte(msg.codec_version) {
            Ok(v) => v,
            Err(e) => {
                debug!("{} on tx {:016x}; dropping", e, msg.hash_prefix);
                return;
            }
        };

        enum TxAction {
            Keep,
            Drop,
            Complete(Vec<u8>),
        }

        let mut decoders = self.tx_decoders.lock().expect("tx decoders poisoned");
        let action = {
            let (decoder, last) = match decoders.entry(key) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    match FecDecoder::new(msg.obj_length as usize) {
                        Ok(decoder) => e.insert((decoder, Instant::now())),
                        Err(err) => {
                            debug!("tx decoder create failed: {}", err);
                            return;
                        }
                    }
                }
            };
            *last = Instant::now();
            match decoder.provide_chunk(&msg.payload, msg.chunk_id) {
                Err(e) => {
                    debug!("tx decoder failure for {:016x}: {}", msg.hash_prefix, e);
                    TxAction::Drop
                }
                Ok(_) if !decoder.decode_ready() => TxAction::Keep,
                Ok(_) => match decoder.decoded_data() {
                    Ok(data) => TxAction::Complete(data),
                    Err(e) => {
                        debug!("tx decode for {:016x} failed: {}", msg.hash_prefix, e);
                        TxAction::Drop
                    }
                },
            }
        };

        let data = match action {
            TxAction::Keep => return,
            TxAction::Drop => {
                decoders.remove(&key);
                return;
            }
            TxAction::Complete(data) => {
                decoders.remove(&key);
                data
            }
        };
        drop(decoders);
        self.recent_txs.lock().expect("recent txs poisoned").put(key, ());

        match orbit_compact::decompress_tx_bytes(&data, codec_version) {
            Ok(tx) => {
                trace!("relay transaction {:016x} received", msg.hash_prefix);
                self.mempool.submit(tx);
            }
            Err(e) => {
                debug!("tx decompression for {:016x} failed: {}", msg.hash_prefix, e);
            }
        }
    }

    /// Drops single-transaction decoders that stopped making progress.
    pub fn sweep_tx_decoders(&self) -> usize {
        let mut decoders = self.tx_decoders.lock().expect("tx decoders poisoned");
        let before = decoders.len();
        decoders.retain(|_, (_, last)| last.elapsed() < TX_DECODER_TIMEOUT);
        before - decoders.len()
    }
}

impl std::fmt::Debug for RelayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCore")
            .field("peers", &self.peer_count())
            .field("partial_blocks", &self.registry.len())
            .finish()
    }
}
