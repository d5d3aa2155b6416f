//! Partial-block registry: in-progress decodes keyed by sender and hash
//! prefix.
//!
//! Header and body chunks for one block can arrive in any order and
//! interleaved with other blocks; both land in the same entry. Every
//! mmap-backed decoder persists under `<data_dir>/partial_blocks/` with the
//! canonical name `<ip>_<port>_<hashPrefixDecimal>_<header|body>_<lenBytes>`
//! (port 0 for trusted peers), which is the only information needed to pick
//! the decode back up after a restart. Anything else found in that
//! directory is deleted on startup.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, warn};

use orbit_compact::{BlockAssembler, CodecVersion};
use orbit_fec::FecDecoder;

use crate::error::Result;

/// Recently finished blocks remembered to suppress re-decoding.
const RECENT_DONE_CACHE: usize = 1024;

/// Key of one in-progress block: hash prefix plus (normalized) sender.
pub type PartialBlockKey = (u64, SocketAddr);

/// Lifecycle of a partial block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Init,
    HeaderReceived,
    Decodable,
    Processing,
    Done,
    TimedOut,
    /// Tombstone: the block was finished or abandoned; stale chunks must
    /// not resurrect it.
    Removed,
}

/// Decode state for one block from one sender.
#[derive(Debug)]
pub struct PartialBlock {
    pub hash_prefix: u64,
    pub peer: SocketAddr,
    pub from_trusted: bool,
    pub state: BlockState,
    pub header_decoder: Option<FecDecoder>,
    pub body_decoder: Option<FecDecoder>,
    pub assembler: Option<BlockAssembler>,
    pub codec_version: Option<CodecVersion>,
    pub height: Option<i32>,
    pub last_chunk: Instant,
}

impl PartialBlock {
    fn new(hash_prefix: u64, peer: SocketAddr, from_trusted: bool) -> Self {
        Self {
            hash_prefix,
            peer,
            from_trusted,
            state: BlockState::Init,
            header_decoder: None,
            body_decoder: None,
            assembler: None,
            codec_version: None,
            height: None,
            last_chunk: Instant::now(),
        }
    }

    /// The header object is fully received and awaiting (or under)
    /// processing.
    pub fn is_header_processing(&self) -> bool {
        self.header_decoder
            .as_ref()
            .map(|d| d.decode_ready())
            .unwrap_or(false)
    }

    /// The body object is fully received.
    pub fn is_decodable(&self) -> bool {
        self.body_decoder
            .as_ref()
            .map(|d| d.decode_ready())
            .unwrap_or(false)
    }

    /// Restarts the abandonment clock; called on every useful chunk.
    pub fn touch(&mut self) {
        self.last_chunk = Instant::now();
    }

    pub fn header_len(&self) -> usize {
        self.header_decoder.as_ref().map(|d| d.obj_size()).unwrap_or(0)
    }

    pub fn body_len(&self) -> usize {
        self.body_decoder.as_ref().map(|d| d.obj_size()).unwrap_or(0)
    }

    /// Drops both backing files; used when the block is finished or
    /// abandoned.
    pub fn remove_files(&mut self) {
        if let Some(dec) = self.header_decoder.as_mut() {
            dec.remove_backing_file();
        }
        if let Some(dec) = self.body_decoder.as_mut() {
            dec.remove_backing_file();
        }
    }
}

/// Parsed form of a canonical chunk file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFileNameParts {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub hash_prefix: u64,
    pub is_header: bool,
    pub length: usize,
}

impl ChunkFileNameParts {
    pub fn peer(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

/// Checks a file name against `<ip>_<port>_<hash>_<header|body>_<len>`.
///
/// Only exactly matching names are recoverable; everything else in the
/// partial-blocks directory is garbage from an older run.
pub fn parse_chunk_file_name(name: &str) -> Option<ChunkFileNameParts> {
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() != 5 {
        return None;
    }
    // Require plain dotted-quad / digit forms; the strict std parsers do.
    let ip: Ipv4Addr = parts[0].parse().ok()?;
    let port: u16 = parts[1].parse().ok()?;
    let hash_prefix: u64 = parts[2].parse().ok()?;
    let is_header = match parts[3] {
        "header" => true,
        "body" => false,
        _ => return None,
    };
    if parts[4].is_empty() {
        return None;
    }
    let length: usize = parts[4].parse().ok()?;
    Some(ChunkFileNameParts {
        ip,
        port,
        hash_prefix,
        is_header,
        length,
    })
}

/// The sender identity used for keys and file names: trusted peers are
/// normalized to port 0, since their source port may vary.
pub fn normalize_peer(addr: SocketAddr, trusted: bool) -> SocketAddr {
    if trusted {
        SocketAddr::new(addr.ip(), 0)
    } else {
        addr
    }
}

/// File-name prefix (`obj_id`) for one object of one block.
pub fn chunk_file_obj_id(peer: SocketAddr, hash_prefix: u64, is_header: bool) -> String {
    format!(
        "{}_{}_{}_{}",
        peer.ip(),
        peer.port(),
        hash_prefix,
        if is_header { "header" } else { "body" }
    )
}

/// Process-wide map of in-progress blocks.
pub struct PartialBlockRegistry {
    map: Mutex<HashMap<PartialBlockKey, Arc<Mutex<PartialBlock>>>>,
    recent_done: Mutex<LruCache<PartialBlockKey, ()>>,
    dir: PathBuf,
    timeout: Duration,
}

impl PartialBlockRegistry {
    pub fn new(dir: PathBuf, timeout: Duration) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            recent_done: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECENT_DONE_CACHE).expect("nonzero cache size"),
            )),
            dir,
            timeout,
        }
    }

    /// The partial-blocks directory backing mmap decoders.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this block was recently completed (tombstoned).
    pub fn is_recently_done(&self, key: &PartialBlockKey) -> bool {
        self.recent_done.lock().expect("registry poisoned").contains(key)
    }

    pub fn lookup(&self, key: &PartialBlockKey) -> Option<Arc<Mutex<PartialBlock>>> {
        self.map.lock().expect("registry poisoned").get(key).cloned()
    }

    /// Fetches or creates the entry for `(hash_prefix, peer)`. Returns
    /// `None` for tombstoned blocks.
    pub fn get_or_create(
        &self,
        hash_prefix: u64,
        peer: SocketAddr,
        from_trusted: bool,
    ) -> Option<Arc<Mutex<PartialBlock>>> {
        let key = (hash_prefix, peer);
        if self.is_recently_done(&key) {
            return None;
        }
        let mut map = self.map.lock().expect("registry poisoned");
        Some(
            map.entry(key)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(PartialBlock::new(hash_prefix, peer, from_trusted)))
                })
                .clone(),
        )
    }

    /// Removes the entry and tombstones the key after a successful decode.
    ///
    /// Lock order is always entry-after-map-release: the map guard must be
    /// gone before an entry lock is taken, because `finish` runs the other
    /// way around.
    pub fn mark_done(&self, key: &PartialBlockKey) {
        let removed = self.map.lock().expect("registry poisoned").remove(key);
        if let Some(entry) = removed {
            let mut block = entry.lock().expect("partial block poisoned");
            block.state = BlockState::Done;
            block.remove_files();
        }
        self.recent_done.lock().expect("registry poisoned").put(*key, ());
    }

    /// Finishes an entry whose lock the caller already holds: sets the
    /// terminal state, drops the backing files, removes the map entry and
    /// tombstones the key.
    pub fn finish(&self, key: &PartialBlockKey, block: &mut PartialBlock, state: BlockState) {
        block.state = state;
        block.remove_files();
        self.map.lock().expect("registry poisoned").remove(key);
        self.recent_done.lock().expect("registry poisoned").put(*key, ());
    }

    /// Removes a corrupt or unusable entry (tombstoned as well, so stale
    /// chunks do not rebuild it). Must not be called while holding the
    /// entry's own lock; see [`Self::finish`] for that case.
    pub fn mark_removed(&self, key: &PartialBlockKey) {
        let removed = self.map.lock().expect("registry poisoned").remove(key);
        if let Some(entry) = removed {
            let mut block = entry.lock().expect("partial block poisoned");
            block.state = BlockState::Removed;
            block.remove_files();
        }
        self.recent_done.lock().expect("registry poisoned").put(*key, ());
    }

    /// Drops entries whose last useful chunk is older than the timeout.
    ///
    /// Blocks from trusted peers are exempt while the local chain is still
    /// syncing: backfill chunks legitimately trickle in over long windows.
    pub fn sweep_timeouts(&self, is_initial_sync: bool) -> usize {
        let now = Instant::now();
        // Snapshot the entries so the map lock is never held across an
        // entry lock (the reader takes them in the opposite order).
        let entries: Vec<(PartialBlockKey, Arc<Mutex<PartialBlock>>)> = self
            .map
            .lock()
            .expect("registry poisoned")
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect();

        let mut expired = Vec::new();
        for (key, entry) in entries {
            let block = entry.lock().expect("partial block poisoned");
            if block.from_trusted && is_initial_sync {
                continue;
            }
            if now.duration_since(block.last_chunk) > self.timeout {
                expired.push(key);
            }
        }
        for key in &expired {
            debug!("partial block {:016x} from {} timed out", key.0, key.1);
            let removed = self.map.lock().expect("registry poisoned").remove(key);
            if let Some(entry) = removed {
                let mut block = entry.lock().expect("partial block poisoned");
                block.state = BlockState::TimedOut;
                block.remove_files();
            }
        }
        expired.len()
    }

    /// Scans the partial-blocks directory, reloading every canonical chunk
    /// file and deleting everything else. Returns the keys of entries whose
    /// body is already decodable, for immediate processing.
    pub fn load_partial_blocks(&self) -> Result<Vec<PartialBlockKey>> {
        let mut decodable = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            // A missing directory just means nothing to recover.
            Err(_) => return Ok(decodable),
        };

        for dirent in entries.flatten() {
            let path = dirent.path();
            if !path.is_file() {
                continue;
            }
            let name = dirent.file_name();
            let Some(parts) = name.to_str().and_then(parse_chunk_file_name) else {
                debug!("removing unrecognized file {}", path.display());
                let _ = std::fs::remove_file(&path);
                continue;
            };
            // Single-chunk objects are never persisted; such a file is junk.
            if parts.length <= orbit_fec::FEC_CHUNK_SIZE {
                debug!("removing undersized chunk file {}", path.display());
                let _ = std::fs::remove_file(&path);
                continue;
            }

            let decoder = match FecDecoder::recover(parts.length, &path, true) {
                Ok(decoder) => decoder,
                Err(e) => {
                    warn!("failed to recover {}: {}", path.display(), e);
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
            };

            let peer = parts.peer();
            let from_trusted = parts.port == 0;
            let Some(entry) = self.get_or_create(parts.hash_prefix, peer, from_trusted) else {
                continue;
            };
            let mut block = entry.lock().expect("partial block poisoned");
            debug!(
                "recovered {} of {} chunks for {:016x} {} from {}",
                decoder.chunks_received(),
                decoder.chunk_count(),
                parts.hash_prefix,
                if parts.is_header { "header" } else { "body" },
                peer
            );
            if parts.is_header {
                block.header_decoder = Some(decoder);
                if block.state == BlockState::Init {
                    block.state = BlockState::HeaderReceived;
                }
            } else {
                block.body_decoder = Some(decoder);
            }
            if block.is_decodable() {
                block.state = BlockState::Decodable;
                decodable.push((parts.hash_prefix, peer));
            }
        }
        Ok(decodable)
    }

    /// Clears all state (tests and shutdown).
    pub fn reset(&self) {
        self.map.lock().expect("registry poisoned").clear();
        self.recent_done.lock().expect("registry poisoned").clear();
    }
}

impl std::fmt::Debug for PartialBlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartialBlockRegistry")
            .field("entries", &self.len())
            .field("dir", &self.dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}
