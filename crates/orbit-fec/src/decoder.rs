//! FEC object decoder with in-memory and memory-mapped operation.
//!
//! A decoder accepts coded chunks in any order and reports readiness once
//! the object can be reconstructed. In mmap mode every received chunk is
//! persisted to a backing file named after the object, so an interrupted
//! decode survives a process restart: reconstructing a decoder over an
//! existing file replays its contents and resumes exactly where it stopped.
//!
//! Scheme behavior mirrors the encoder:
//!
//! - repetition: one chunk of any id completes the decode
//! - MDS: exactly `chunk_count` distinct-id chunks complete it; the actual
//!   reconstruction runs lazily on first data access
//! - fountain: the codec is consulted from the `chunk_count`-th chunk on and
//!   may ask for more; chunks received past that point are fed to the codec
//!   directly without touching the backing file

use std::path::{Path, PathBuf};

use rand::Rng;
use raptorq::{Decoder as RqDecoder, EncodingPacket, ObjectTransmissionInformation, PayloadId};
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::debug;

use crate::chunk::{
    chunk_count, max_chunk_id, uses_mds, ChunkIdTracker, FEC_CHUNK_SIZE, MDS_MAX_CHUNKS,
};
use crate::error::{FecError, Result};
use crate::storage::ChunkStorage;

/// Where a decoder keeps chunks while the object is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Memory,
    Mmap,
}

enum DecoderScheme {
    /// Single-chunk objects; the one received chunk is the object.
    Trivial { chunk: Option<Vec<u8>> },
    Mds {
        /// Memory mode: chunks in arrival order with their 8-bit ids.
        received: Vec<(u8, Vec<u8>)>,
        /// Data chunks in id order once reconstructed (memory mode).
        decoded: Option<Vec<Vec<u8>>>,
        /// Mmap mode: storage slots rewritten into id order.
        storage_decoded: bool,
    },
    Fountain {
        codec: Option<Box<RqDecoder>>,
        decoded: Option<Vec<u8>>,
    },
}

/// Decoder for one FEC object.
pub struct FecDecoder {
    chunk_count: usize,
    obj_size: usize,
    chunks_recvd: usize,
    decode_complete: bool,
    tracker: ChunkIdTracker,
    mode: StorageMode,
    keep_file: bool,
    filename: Option<PathBuf>,
    storage: Option<ChunkStorage>,
    owns_file: bool,
    scheme: DecoderScheme,
}

impl FecDecoder {
    /// Creates an in-memory decoder for an object of `obj_size` bytes.
    pub fn new(obj_size: usize) -> Result<Self> {
        Self::build(obj_size, StorageMode::Memory, None, false)
    }

    /// Creates a memory-mapped decoder backed by a file under `dir`.
    ///
    /// With an `obj_id` the file is named `<obj_id>_<obj_size>` so that a
    /// later process can find it again; otherwise a random token is used. If
    /// the file already holds chunks from a previous run they are replayed
    /// into the fresh decoder. `keep_file` leaves the file behind on drop.
    pub fn new_mmap(
        obj_size: usize,
        dir: &Path,
        obj_id: Option<&str>,
        keep_file: bool,
    ) -> Result<Self> {
        let name = match obj_id {
            Some(id) => format!("{}_{}", id, obj_size),
            None => format!("{:016x}_{}", rand::thread_rng().gen::<u64>(), obj_size),
        };
        Self::build(obj_size, StorageMode::Mmap, Some(dir.join(name)), keep_file)
    }

    /// Reopens the chunk file at `path` for an object of `obj_size` bytes,
    /// replaying any persisted chunks.
    pub fn recover(obj_size: usize, path: &Path, keep_file: bool) -> Result<Self> {
        Self::build(obj_size, StorageMode::Mmap, Some(path.to_path_buf()), keep_file)
    }

    fn build(
        obj_size: usize,
        mode: StorageMode,
        filename: Option<PathBuf>,
        keep_file: bool,
    ) -> Result<Self> {
        if obj_size == 0 {
            return Err(FecError::InvalidObjectSize(0));
        }
        let chunks = chunk_count(obj_size);

        let scheme = if chunks < 2 {
            DecoderScheme::Trivial { chunk: None }
        } else if uses_mds(chunks) {
            DecoderScheme::Mds {
                received: Vec::new(),
                decoded: None,
                storage_decoded: false,
            }
        } else {
            // Memory mode keeps the fountain codec hot from the start; mmap
            // mode defers it until enough chunks arrived (§ replay below).
            let codec = match mode {
                StorageMode::Memory => Some(Box::new(RqDecoder::new(
                    ObjectTransmissionInformation::with_defaults(
                        obj_size as u64,
                        FEC_CHUNK_SIZE as u16,
                    ),
                ))),
                StorageMode::Mmap => None,
            };
            DecoderScheme::Fountain {
                codec,
                decoded: None,
            }
        };

        let mut decoder = Self {
            chunk_count: chunks,
            obj_size,
            chunks_recvd: 0,
            decode_complete: false,
            tracker: ChunkIdTracker::new(chunks),
            mode,
            keep_file,
            filename: filename.clone(),
            storage: None,
            owns_file: false,
            scheme,
        };

        if mode == StorageMode::Mmap && chunks >= 2 {
            let path = filename.as_deref().expect("mmap decoder requires a path");
            let storage = ChunkStorage::new(path, chunks, true)?;
            let recovered = storage.recovered_count();
            decoder.storage = Some(storage);
            decoder.owns_file = true;
            if recovered > 0 {
                decoder.replay_storage(recovered)?;
            }
        }

        Ok(decoder)
    }

    /// Replays `recovered` persisted slots into the decoder state.
    fn replay_storage(&mut self, recovered: usize) -> Result<()> {
        let storage = self.storage.as_ref().expect("replay without storage");
        for slot in 0..recovered {
            let id = storage.chunk_id(slot)?;
            self.tracker.check_and_mark(id);
        }
        self.chunks_recvd = recovered;

        if matches!(self.scheme, DecoderScheme::Mds { .. }) {
            if recovered >= self.chunk_count {
                self.decode_complete = true;
            }
        } else if matches!(self.scheme, DecoderScheme::Fountain { .. })
            && recovered >= self.chunk_count
        {
            self.run_fountain_replay()?;
        }
        debug!(
            "recovered {} of {} chunks from {:?}",
            recovered,
            self.chunk_count,
            self.filename.as_deref().unwrap_or_else(|| Path::new("?"))
        );
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    pub fn chunks_received(&self) -> usize {
        self.chunks_recvd
    }

    pub fn decode_ready(&self) -> bool {
        self.decode_complete
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    /// Path of the backing file, if this decoder has one.
    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    pub fn set_keep_file(&mut self, keep: bool) {
        self.keep_file = keep;
    }

    /// Whether `chunk_id` was already presented (or the decode finished).
    pub fn has_chunk(&self, chunk_id: u32) -> bool {
        if chunk_id > max_chunk_id(self.chunk_count) {
            return false;
        }
        self.decode_complete || self.tracker.contains(chunk_id)
    }

    /// Feeds one coded chunk to the decoder.
    ///
    /// Returns `Ok(false)` when the chunk was rejected (id out of range or
    /// the codec refused it); duplicates and chunks arriving after
    /// completion return `Ok(true)` without changing state.
    pub fn provide_chunk(&mut self, chunk: &[u8], chunk_id: u32) -> Result<bool> {
        if chunk_id > max_chunk_id(self.chunk_count) {
            return Ok(false);
        }
        if self.decode_complete {
            return Ok(true);
        }
        // The fountain codec breaks on a repeated symbol, so duplicates are
        // swallowed before they reach any scheme.
        if self.tracker.check_and_mark(chunk_id) {
            return Ok(true);
        }

        let chunk = Self::normalize(chunk);

        if let DecoderScheme::Trivial { chunk: slot } = &mut self.scheme {
            *slot = Some(chunk.into_owned());
            self.chunks_recvd += 1;
            self.decode_complete = true;
            return Ok(true);
        }

        match self.mode {
            StorageMode::Mmap => self.provide_chunk_mmap(&chunk, chunk_id),
            StorageMode::Memory => self.provide_chunk_memory(&chunk, chunk_id),
        }
    }

    fn normalize(chunk: &[u8]) -> std::borrow::Cow<'_, [u8]> {
        if chunk.len() == FEC_CHUNK_SIZE {
            std::borrow::Cow::Borrowed(chunk)
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(FEC_CHUNK_SIZE, 0);
            std::borrow::Cow::Owned(padded)
        }
    }

    fn provide_chunk_mmap(&mut self, chunk: &[u8], chunk_id: u32) -> Result<bool> {
        // Both schemes need chunk_count chunks, so fill the backing store
        // first regardless of which codec runs.
        if self.chunks_recvd < self.chunk_count {
            self.storage
                .as_mut()
                .expect("mmap decoder lost its storage")
                .insert(chunk, chunk_id, self.chunks_recvd)?;
        }

        if matches!(self.scheme, DecoderScheme::Mds { .. }) {
            // MDS: chunk_count distinct chunks are always sufficient.
            if self.chunks_recvd + 1 == self.chunk_count {
                self.decode_complete = true;
            }
        } else if self.chunks_recvd + 1 == self.chunk_count {
            // The "last" chunk under the fountain scheme: pull everything
            // back off disk and try to decode.
            self.chunks_recvd += 1;
            self.run_fountain_replay()?;
            return Ok(true);
        } else if self.chunks_recvd >= self.chunk_count {
            // Replay already ran and came up short; keep feeding the live
            // codec directly.
            let complete = &mut self.decode_complete;
            if let DecoderScheme::Fountain { codec, decoded } = &mut self.scheme {
                let codec = codec.as_mut().expect("fountain codec missing after replay");
                let packet = EncodingPacket::new(PayloadId::new(0, chunk_id), chunk.to_vec());
                if let Some(data) = codec.decode(packet) {
                    *decoded = Some(data);
                    *complete = true;
                }
            }
        }

        self.chunks_recvd += 1;
        Ok(true)
    }

    /// Pulls every persisted `(id, chunk)` pair back off the file and feeds
    /// it to a fresh fountain codec.
    fn run_fountain_replay(&mut self) -> Result<()> {
        let storage = self.storage.as_ref().expect("fountain replay without storage");
        let mut rq = RqDecoder::new(ObjectTransmissionInformation::with_defaults(
            self.obj_size as u64,
            FEC_CHUNK_SIZE as u16,
        ));
        let mut result = None;
        let replay = self.chunks_recvd.min(self.chunk_count);
        for slot in 0..replay {
            let id = storage.chunk_id(slot)?;
            let chunk = storage.chunk(slot)?.to_vec();
            if let Some(data) = rq.decode(EncodingPacket::new(PayloadId::new(0, id), chunk)) {
                result = Some(data);
                break;
            }
        }
        if let DecoderScheme::Fountain { codec, decoded } = &mut self.scheme {
            *codec = Some(Box::new(rq));
            if let Some(data) = result {
                *decoded = Some(data);
                self.decode_complete = true;
            }
        }
        Ok(())
    }

    fn provide_chunk_memory(&mut self, chunk: &[u8], chunk_id: u32) -> Result<bool> {
        match &mut self.scheme {
            DecoderScheme::Mds { received, .. } => {
                received.push((chunk_id as u8, chunk.to_vec()));
                if received.len() == self.chunk_count {
                    self.decode_complete = true;
                }
            }
            DecoderScheme::Fountain { codec, decoded } => {
                let codec = codec.as_mut().expect("memory-mode fountain codec missing");
                let packet = EncodingPacket::new(PayloadId::new(0, chunk_id), chunk.to_vec());
                if let Some(data) = codec.decode(packet) {
                    *decoded = Some(data);
                    self.decode_complete = true;
                }
            }
            DecoderScheme::Trivial { .. } => unreachable!("trivial handled in provide_chunk"),
        }
        self.chunks_recvd += 1;
        Ok(true)
    }

    /// Runs the deferred MDS reconstruction, if it has not happened yet.
    fn ensure_mds_decoded(&mut self) -> Result<()> {
        let parity_count = (MDS_MAX_CHUNKS - 1).saturating_sub(self.chunk_count);
        let n = self.chunk_count;

        let pairs: Vec<(u8, Vec<u8>)> = match (&self.scheme, self.mode) {
            (DecoderScheme::Mds { decoded: Some(_), .. }, _) => return Ok(()),
            (DecoderScheme::Mds { storage_decoded: true, .. }, _) => return Ok(()),
            (DecoderScheme::Mds { received, .. }, StorageMode::Memory) => received.clone(),
            (DecoderScheme::Mds { .. }, StorageMode::Mmap) => {
                let storage = self.storage.as_ref().expect("mds decode without storage");
                (0..n)
                    .map(|slot| {
                        Ok((storage.chunk_id(slot)? as u8, storage.chunk(slot)?.to_vec()))
                    })
                    .collect::<Result<_>>()?
            }
            _ => return Ok(()),
        };

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n + parity_count];
        for (id, chunk) in pairs {
            if (id as usize) < shards.len() {
                shards[id as usize] = Some(chunk);
            }
        }

        let have_all_data = shards[..n].iter().all(|s| s.is_some());
        if !have_all_data {
            let rs = ReedSolomon::new(n, parity_count)
                .map_err(|e| FecError::CodecFailure(e.to_string()))?;
            rs.reconstruct_data(&mut shards)
                .map_err(|e| FecError::CodecFailure(e.to_string()))?;
        }

        let data: Vec<Vec<u8>> = shards
            .into_iter()
            .take(n)
            .map(|s| s.ok_or_else(|| FecError::CodecFailure("missing data shard".into())))
            .collect::<Result<_>>()?;

        match self.mode {
            StorageMode::Memory => {
                if let DecoderScheme::Mds { decoded, .. } = &mut self.scheme {
                    *decoded = Some(data);
                }
            }
            StorageMode::Mmap => {
                // Write the reconstructed data chunks back in id order so the
                // file now maps slot i to data chunk i.
                let storage = self.storage.as_mut().expect("mds decode without storage");
                for (i, chunk) in data.iter().enumerate() {
                    storage.write_chunk(i, chunk)?;
                    storage.write_chunk_id(i, i as u32)?;
                }
                if let DecoderScheme::Mds { storage_decoded, .. } = &mut self.scheme {
                    *storage_decoded = true;
                }
            }
        }
        Ok(())
    }

    /// Returns the decoded data chunk at `index` (zero-padded to chunk size).
    pub fn chunk_data(&mut self, index: u32) -> Result<Vec<u8>> {
        if !self.decode_complete {
            return Err(FecError::DecodeNotReady {
                received: self.chunks_recvd,
                needed: self.chunk_count,
            });
        }
        if index as usize >= self.chunk_count {
            return Err(FecError::IndexOutOfRange {
                index: index as usize,
                max: self.chunk_count,
            });
        }
        if matches!(self.scheme, DecoderScheme::Mds { .. }) {
            self.ensure_mds_decoded()?;
        }
        match (&self.scheme, self.mode) {
            (DecoderScheme::Trivial { chunk }, _) => {
                Ok(chunk.clone().expect("complete trivial decoder without chunk"))
            }
            (DecoderScheme::Mds { decoded: Some(data), .. }, StorageMode::Memory) => {
                Ok(data[index as usize].clone())
            }
            (DecoderScheme::Mds { .. }, StorageMode::Mmap) => Ok(self
                .storage
                .as_ref()
                .expect("mds decoder lost its storage")
                .chunk(index as usize)?
                .to_vec()),
            (DecoderScheme::Mds { .. }, StorageMode::Memory) => {
                Err(FecError::CodecFailure("mds data missing".into()))
            }
            (DecoderScheme::Fountain { decoded, .. }, _) => {
                let data = decoded
                    .as_ref()
                    .ok_or_else(|| FecError::CodecFailure("fountain data missing".into()))?;
                let start = index as usize * FEC_CHUNK_SIZE;
                let end = (start + FEC_CHUNK_SIZE).min(data.len());
                let mut chunk = data[start..end].to_vec();
                chunk.resize(FEC_CHUNK_SIZE, 0);
                Ok(chunk)
            }
        }
    }

    /// Returns the fully decoded object.
    pub fn decoded_data(&mut self) -> Result<Vec<u8>> {
        if !self.decode_complete {
            return Err(FecError::DecodeNotReady {
                received: self.chunks_recvd,
                needed: self.chunk_count,
            });
        }
        if matches!(self.scheme, DecoderScheme::Mds { .. }) {
            let mut out = Vec::with_capacity(self.obj_size);
            for i in 0..self.chunk_count {
                let chunk = self.chunk_data(i as u32)?;
                let remaining = self.obj_size - out.len();
                out.extend_from_slice(&chunk[..remaining.min(FEC_CHUNK_SIZE)]);
            }
            return Ok(out);
        }
        match &self.scheme {
            DecoderScheme::Trivial { chunk } => Ok(chunk
                .clone()
                .expect("complete trivial decoder without chunk")[..self.obj_size]
                .to_vec()),
            DecoderScheme::Fountain { decoded, .. } => {
                let mut data = decoded
                    .clone()
                    .ok_or_else(|| FecError::CodecFailure("fountain data missing".into()))?;
                data.truncate(self.obj_size);
                Ok(data)
            }
            DecoderScheme::Mds { .. } => unreachable!("handled above"),
        }
    }

    /// Takes over `source`'s state, keeping this decoder's filename.
    ///
    /// This decoder's own backing file (if any) is removed first. When both
    /// sides have a file, the source's file is renamed onto this decoder's
    /// name; when this decoder had none, it inherits the source's name.
    pub fn adopt(&mut self, mut source: FecDecoder) -> Result<()> {
        if self.owns_file {
            if let Some(storage) = self.storage.take() {
                if self.filename.is_some() {
                    // Keep the name; only the stale contents go away. The
                    // rename below will put the source's file in its place.
                    drop(storage);
                } else {
                    storage.remove();
                }
            }
        }

        self.chunk_count = source.chunk_count;
        self.obj_size = source.obj_size;
        self.chunks_recvd = source.chunks_recvd;
        self.decode_complete = source.decode_complete;
        self.tracker = std::mem::take(&mut source.tracker);
        self.mode = source.mode;
        self.keep_file = source.keep_file;
        self.scheme = std::mem::replace(
            &mut source.scheme,
            DecoderScheme::Trivial { chunk: None },
        );

        let source_owned = source.owns_file;
        source.owns_file = false;
        let source_storage = source.storage.take();
        let source_filename = source.filename.take();

        if source_owned {
            if let Some(dest) = self.filename.clone() {
                if let Some(mut storage) = source_storage {
                    storage.rename_to(&dest)?;
                    self.storage = Some(storage);
                }
            } else {
                self.filename = source_filename;
                self.storage = source_storage;
            }
            self.owns_file = true;
        } else {
            self.owns_file = false;
            self.storage = None;
        }
        Ok(())
    }

    /// Unlinks the backing file immediately (e.g. when the object is done).
    pub fn remove_backing_file(&mut self) {
        self.owns_file = false;
        if let Some(storage) = self.storage.take() {
            storage.remove();
        } else if let Some(path) = self.filename.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for FecDecoder {
    fn drop(&mut self) {
        if self.owns_file && !self.keep_file {
            if let Some(storage) = self.storage.take() {
                storage.remove();
            }
        }
    }
}

impl std::fmt::Debug for FecDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FecDecoder")
            .field("obj_size", &self.obj_size)
            .field("chunk_count", &self.chunk_count)
            .field("chunks_recvd", &self.chunks_recvd)
            .field("decode_complete", &self.decode_complete)
            .field("mode", &self.mode)
            .field("filename", &self.filename)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::FecEncoder;
    use rand::seq::SliceRandom;
    use rand::RngCore;

    fn random_data(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// All coded chunks for an object: data chunks then `overhead` recovery.
    fn encode_all(data: &[u8], overhead: usize) -> Vec<(Vec<u8>, u32)> {
        let mut enc = FecEncoder::new(data.to_vec(), overhead.max(1)).unwrap();
        let mut out: Vec<(Vec<u8>, u32)> = (0..enc.chunk_count())
            .map(|i| enc.data_chunk(i).unwrap())
            .collect();
        for slot in 0..overhead {
            let (chunk, id) = enc.build_chunk(slot, false).unwrap();
            out.push((chunk.to_vec(), id));
        }
        out
    }

    #[test]
    fn test_repetition_single_chunk_decodes() {
        let data = random_data(10);
        let chunks = encode_all(&data, 3);
        // Two of the three copies lost; the third alone must decode.
        let mut dec = FecDecoder::new(data.len()).unwrap();
        assert!(dec.provide_chunk(&chunks[3].0, chunks[3].1).unwrap());
        assert!(dec.decode_ready());
        assert_eq!(dec.decoded_data().unwrap(), data);
        assert_eq!(&dec.chunk_data(0).unwrap()[..10], &data[..]);
    }

    #[test]
    fn test_invalid_chunk_id_rejected() {
        let mut dec = FecDecoder::new(2 * FEC_CHUNK_SIZE).unwrap();
        let chunk = vec![0u8; FEC_CHUNK_SIZE];
        assert!(!dec.provide_chunk(&chunk, 256).unwrap());
        assert!(!dec.decode_ready());

        let mut dec = FecDecoder::new((MDS_MAX_CHUNKS + 1) * FEC_CHUNK_SIZE).unwrap();
        assert!(!dec.provide_chunk(&chunk, crate::chunk::FEC_CHUNK_ID_MAX + 1).unwrap());
        assert!(!dec.decode_ready());
    }

    #[test]
    fn test_provide_is_idempotent() {
        let data = random_data(5 * FEC_CHUNK_SIZE);
        let chunks = encode_all(&data, 2);
        let mut dec = FecDecoder::new(data.len()).unwrap();
        for _ in 0..3 {
            assert!(dec.provide_chunk(&chunks[0].0, chunks[0].1).unwrap());
        }
        assert_eq!(dec.chunks_received(), 1);
        assert!(dec.has_chunk(chunks[0].1));
    }

    fn drop_and_decode(data: &[u8], overhead: usize, n_drop: usize, expect_ok: bool) {
        let mut chunks = encode_all(data, overhead);
        chunks.shuffle(&mut rand::thread_rng());
        chunks.truncate(chunks.len() - n_drop);

        let mut dec = FecDecoder::new(data.len()).unwrap();
        for (chunk, id) in &chunks {
            dec.provide_chunk(chunk, *id).unwrap();
        }
        if expect_ok {
            assert!(dec.decode_ready(), "failed with {} drops", n_drop);
            assert_eq!(dec.decoded_data().unwrap(), data);
        } else {
            assert!(!dec.decode_ready());
        }
    }

    #[test]
    fn test_mds_decode_with_drops() {
        // 18 chunks plus 2 recovery: tolerates up to 2 drops, never 3.
        let data = random_data(20 * 1000);
        assert_eq!(chunk_count(data.len()), 18);
        drop_and_decode(&data, 2, 0, true);
        drop_and_decode(&data, 2, 1, true);
        drop_and_decode(&data, 2, 2, true);
        drop_and_decode(&data, 2, 3, false);
    }

    #[test]
    fn test_mds_boundary_chunk_counts() {
        let data = random_data(2 * FEC_CHUNK_SIZE);
        drop_and_decode(&data, 2, 2, true);
        let data = random_data(100 * FEC_CHUNK_SIZE);
        drop_and_decode(&data, 10, 10, true);
    }

    #[test]
    fn test_fountain_decode_with_drops() {
        // A 500 KB object at 5% overhead still decodes after losing 20
        // chunks.
        let data = random_data(500_000);
        let n = chunk_count(data.len());
        assert!(uses_mds(n) == false);
        let overhead = n * 5 / 100;
        drop_and_decode(&data, overhead, 20, true);
    }

    #[test]
    fn test_fountain_out_of_order() {
        let data = random_data((MDS_MAX_CHUNKS + 20) * FEC_CHUNK_SIZE);
        drop_and_decode(&data, 20, 10, true);
    }

    #[test]
    fn test_mmap_decode_mds() {
        let dir = tempfile::tempdir().unwrap();
        let data = random_data(5 * FEC_CHUNK_SIZE);
        let mut chunks = encode_all(&data, 2);
        chunks.shuffle(&mut rand::thread_rng());

        let mut dec = FecDecoder::new_mmap(data.len(), dir.path(), None, false).unwrap();
        for (chunk, id) in chunks.iter().take(5) {
            dec.provide_chunk(chunk, *id).unwrap();
        }
        assert!(dec.decode_ready());
        assert_eq!(dec.decoded_data().unwrap(), data);
    }

    #[test]
    fn test_mmap_decode_fountain() {
        let dir = tempfile::tempdir().unwrap();
        let n = MDS_MAX_CHUNKS + 10;
        let data = random_data(n * FEC_CHUNK_SIZE - 100);
        let mut chunks = encode_all(&data, 12);
        chunks.shuffle(&mut rand::thread_rng());
        chunks.truncate(chunks.len() - 6);

        let mut dec = FecDecoder::new_mmap(data.len(), dir.path(), None, false).unwrap();
        for (chunk, id) in &chunks {
            dec.provide_chunk(chunk, *id).unwrap();
        }
        assert!(dec.decode_ready());
        assert_eq!(dec.decoded_data().unwrap(), data);
    }

    #[test]
    fn test_mmap_file_created_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let dec = FecDecoder::new_mmap(10_000, dir.path(), None, false).unwrap();
            path = dec.filename().unwrap().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_mmap_file_kept_with_keep_file() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let dec = FecDecoder::new_mmap(10_000, dir.path(), Some("a_body"), true).unwrap();
            path = dec.filename().unwrap().to_path_buf();
            assert_eq!(path.file_name().unwrap().to_str().unwrap(), "a_body_10000");
        }
        assert!(path.exists());
    }

    #[test]
    fn test_recovery_restores_progress() {
        let dir = tempfile::tempdir().unwrap();
        let data = random_data(5 * FEC_CHUNK_SIZE);
        let chunks = encode_all(&data, 2);

        let path;
        {
            let mut dec =
                FecDecoder::new_mmap(data.len(), dir.path(), Some("peer_body"), true).unwrap();
            path = dec.filename().unwrap().to_path_buf();
            for (chunk, id) in chunks.iter().take(3) {
                dec.provide_chunk(chunk, *id).unwrap();
            }
            assert!(!dec.decode_ready());
        }

        let mut dec = FecDecoder::recover(data.len(), &path, true).unwrap();
        assert_eq!(dec.chunks_received(), 3);
        assert!(!dec.decode_ready());

        for (chunk, id) in chunks.iter().skip(3).take(2) {
            dec.provide_chunk(chunk, *id).unwrap();
        }
        assert!(dec.decode_ready());
        assert_eq!(dec.decoded_data().unwrap(), data);
    }

    #[test]
    fn test_recovery_of_complete_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let data = random_data(2 * FEC_CHUNK_SIZE);
        let chunks = encode_all(&data, 1);

        let path;
        {
            let mut dec =
                FecDecoder::new_mmap(data.len(), dir.path(), Some("hdr"), true).unwrap();
            path = dec.filename().unwrap().to_path_buf();
            for (chunk, id) in chunks.iter().take(2) {
                dec.provide_chunk(chunk, *id).unwrap();
            }
            assert!(dec.decode_ready());
        }

        let mut dec = FecDecoder::recover(data.len(), &path, true).unwrap();
        assert_eq!(dec.chunks_received(), 2);
        assert!(dec.decode_ready());
        assert_eq!(dec.decoded_data().unwrap(), data);
    }

    #[test]
    fn test_adopt_keeps_destination_filename() {
        let dir = tempfile::tempdir().unwrap();
        let data = random_data(4 * FEC_CHUNK_SIZE);
        let chunks = encode_all(&data, 1);

        let mut dest = FecDecoder::new_mmap(data.len(), dir.path(), Some("dest"), false).unwrap();
        let dest_path = dest.filename().unwrap().to_path_buf();

        let mut source =
            FecDecoder::new_mmap(data.len(), dir.path(), Some("source"), false).unwrap();
        let source_path = source.filename().unwrap().to_path_buf();
        for (chunk, id) in chunks.iter().take(2) {
            source.provide_chunk(chunk, *id).unwrap();
        }

        dest.adopt(source).unwrap();
        assert!(dest_path.exists());
        assert!(!source_path.exists());
        assert_eq!(dest.chunks_received(), 2);
        assert_eq!(dest.filename().unwrap(), dest_path);

        for (chunk, id) in chunks.iter().skip(2) {
            dest.provide_chunk(chunk, *id).unwrap();
        }
        assert!(dest.decode_ready());
        assert_eq!(dest.decoded_data().unwrap(), data);
    }

    #[test]
    fn test_encoder_from_decoder() {
        let data = random_data(10 * FEC_CHUNK_SIZE);
        let chunks = encode_all(&data, 2);
        let mut dec = FecDecoder::new(data.len()).unwrap();
        for (chunk, id) in chunks.iter().take(10) {
            dec.provide_chunk(chunk, *id).unwrap();
        }
        assert!(dec.decode_ready());

        let mut enc = FecEncoder::from_decoder(dec, 2).unwrap();
        let (chunk, id) = enc.build_chunk(0, false).unwrap();
        assert_eq!(chunk.len(), FEC_CHUNK_SIZE);
        assert!(id >= 10);
    }
}
