//! UDP wire format and the packet authenticator.
//!
//! Every packet is a fixed-size message: a 17-byte header (two 8-byte
//! authenticator words and a type byte) followed by the body. Chunk-bearing
//! messages carry a fixed 1152-byte FEC chunk plus its object identifiers;
//! control messages carry at most an 8-byte value.
//!
//! The authenticator is Poly1305 under a fixed key derived from the group
//! password (the 8-byte magic repeated four times). After tagging, the body
//! is XOR-obfuscated with the first authenticator word. This ties the
//! payload to the tag on the wire but is not an authentication primitive in
//! any cryptographic sense; the key is static and shared. It is preserved
//! bit-exactly for interoperability.

use poly1305::universal_hash::KeyInit;
use poly1305::Poly1305;
use sha2::{Digest, Sha256};

use orbit_fec::FEC_CHUNK_SIZE;

use crate::error::{RelayError, Result};

/// Wire protocol version: current in the low half, minimum-understood in the
/// high half.
pub const UDP_PROTOCOL_VERSION: u64 = (1 << 32) | 1;

pub fn protocol_version_cur(version: u64) -> u32 {
    version as u32
}

pub fn protocol_version_min(version: u64) -> u32 {
    (version >> 32) as u32
}

/// Bytes before the message body: chk1, chk2, msg_type.
pub const HEADER_SIZE: usize = 17;

/// Body of a chunk-bearing message: identifiers plus one chunk.
pub const MAX_UDP_MESSAGE_LENGTH: usize = 8 + 4 + 4 + FEC_CHUNK_SIZE;

/// Every packet buffer is this size; shorter messages only send a prefix.
pub const PACKET_SIZE: usize = HEADER_SIZE + MAX_UDP_MESSAGE_LENGTH;

/// Low bits of the type byte select the message kind.
const MSG_TYPE_MASK: u8 = 0x0f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Syn = 1,
    Keepalive = 2,
    Disconnect = 3,
    BlockHeader = 4,
    BlockContents = 5,
    Ping = 6,
    Pong = 7,
    TxContents = 8,
}

impl MsgType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte & MSG_TYPE_MASK {
            1 => Self::Syn,
            2 => Self::Keepalive,
            3 => Self::Disconnect,
            4 => Self::BlockHeader,
            5 => Self::BlockContents,
            6 => Self::Ping,
            7 => Self::Pong,
            8 => Self::TxContents,
            _ => return None,
        })
    }

    /// Does this message carry an FEC chunk?
    pub fn carries_chunk(self) -> bool {
        matches!(self, Self::BlockHeader | Self::BlockContents | Self::TxContents)
    }
}

/// Derives a group's checksum magic from its password.
pub fn derive_magic(password: &str) -> u64 {
    let first = Sha256::digest(password.as_bytes());
    let second = Sha256::digest(first);
    u64::from_le_bytes(second[..8].try_into().unwrap())
}

/// The fixed magic of the multicast service.
pub fn multicast_magic() -> u64 {
    static MAGIC: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *MAGIC.get_or_init(|| derive_magic("multicast"))
}

/// Identifiers and payload of one FEC chunk on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMessage {
    pub hash_prefix: u64,
    pub obj_length: u32,
    pub chunk_id: u32,
    pub codec_version: u8,
    pub payload: Vec<u8>,
}

impl ChunkMessage {
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != MAX_UDP_MESSAGE_LENGTH {
            return Err(RelayError::MalformedMessage("chunk message size"));
        }
        let hash_prefix = u64::from_le_bytes(body[..8].try_into().unwrap());
        let obj_length = u32::from_le_bytes(body[8..12].try_into().unwrap());
        let id_and_version = u32::from_le_bytes(body[12..16].try_into().unwrap());
        Ok(Self {
            hash_prefix,
            obj_length,
            chunk_id: id_and_version & 0x00ff_ffff,
            codec_version: (id_and_version >> 24) as u8,
            payload: body[16..].to_vec(),
        })
    }
}

/// Builds a full-size chunk-bearing packet with a zeroed authenticator.
pub fn build_chunk_message(
    msg_type: MsgType,
    hash_prefix: u64,
    obj_length: u32,
    chunk_id: u32,
    codec_version: u8,
    chunk: &[u8],
) -> Vec<u8> {
    debug_assert!(msg_type.carries_chunk());
    debug_assert_eq!(chunk.len(), FEC_CHUNK_SIZE);
    debug_assert!(chunk_id <= orbit_fec::FEC_CHUNK_ID_MAX);
    let mut buf = vec![0u8; PACKET_SIZE];
    buf[16] = msg_type as u8;
    buf[17..25].copy_from_slice(&hash_prefix.to_le_bytes());
    buf[25..29].copy_from_slice(&obj_length.to_le_bytes());
    let id_and_version = chunk_id | ((codec_version as u32) << 24);
    buf[29..33].copy_from_slice(&id_and_version.to_le_bytes());
    buf[33..].copy_from_slice(chunk);
    buf
}

/// Builds a control packet (SYN/PING/PONG carry an 8-byte value).
pub fn build_control_message(msg_type: MsgType, value: Option<u64>) -> Vec<u8> {
    let len = HEADER_SIZE + if value.is_some() { 8 } else { 0 };
    let mut buf = vec![0u8; len];
    buf[16] = msg_type as u8;
    if let Some(value) = value {
        buf[17..25].copy_from_slice(&value.to_le_bytes());
    }
    buf
}

fn poly1305_key(magic: u64) -> [u8; 32] {
    let mut key = [0u8; 32];
    for part in key.chunks_exact_mut(8) {
        part.copy_from_slice(&magic.to_le_bytes());
    }
    key
}

fn poly1305_tag(magic: u64, data: &[u8]) -> [u8; 16] {
    let key = poly1305_key(magic);
    let mac = Poly1305::new((&key).into());
    mac.compute_unpadded(data).into()
}

fn xor_obfuscate(buf: &mut [u8]) {
    let chk1: [u8; 8] = buf[..8].try_into().unwrap();
    let body_len = buf.len() - 16;
    for i in (0..body_len).step_by(8) {
        for j in 0..8.min(body_len - i) {
            buf[16 + i + j] ^= chk1[j];
        }
    }
}

/// Computes the authenticator over `buf[16..]`, writes it into the first 16
/// bytes, then XOR-obfuscates the body with the first authenticator word.
pub fn fill_authenticator(buf: &mut [u8], magic: u64) {
    debug_assert!(buf.len() >= HEADER_SIZE && buf.len() <= PACKET_SIZE);
    let tag = poly1305_tag(magic, &buf[16..]);
    buf[..16].copy_from_slice(&tag);
    xor_obfuscate(buf);
}

/// Whether the authenticator words are still zeroed (not yet filled).
pub fn authenticator_is_blank(buf: &[u8]) -> bool {
    buf[..16].iter().all(|&b| b == 0)
}

/// Reverses the obfuscation and verifies the authenticator. On success the
/// buffer holds the plaintext body; on failure the caller must discard it.
pub fn verify_authenticator(buf: &mut [u8], magic: u64) -> bool {
    if buf.len() < HEADER_SIZE {
        return false;
    }
    xor_obfuscate(buf);
    let tag = poly1305_tag(magic, &buf[16..]);
    // Not constant-time; the key is public anyway.
    buf[..16] == tag
}
