//! On-storage heap layout.
//!
//! The pool is a single heap header followed by zones. Each zone is a small
//! zone header, a fixed array of chunk headers, and the chunk payload. All
//! fields are little-endian and every structure is composed of 8-byte words,
//! which is what lets the region stay a plain atomic-word array.

use crate::error::HeapError;
use crate::region::PoolRegion;

/// Size of one chunk in bytes.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Maximum number of chunks in a zone.
pub const MAX_CHUNK: usize = 1024;

/// Serialized size of the heap header.
pub const HEAP_HEADER_SIZE: usize = 1024;

/// Serialized size of a zone header.
pub const ZONE_HEADER_SIZE: usize = 64;

/// Serialized size of one chunk header.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Zone header plus the full chunk-header array.
pub const ZONE_METADATA_SIZE: usize = ZONE_HEADER_SIZE + MAX_CHUNK * CHUNK_HEADER_SIZE;

/// Largest possible zone: metadata plus a full chunk payload.
pub const ZONE_MAX_SIZE: usize = ZONE_METADATA_SIZE + MAX_CHUNK * CHUNK_SIZE;

/// Smallest usable zone: metadata plus a single chunk.
pub const ZONE_MIN_SIZE: usize = ZONE_METADATA_SIZE + CHUNK_SIZE;

/// Smallest region `Heap::init` accepts.
pub const HEAP_MIN_SIZE: usize = HEAP_HEADER_SIZE + ZONE_MIN_SIZE;

/// Heap header signature.
pub const HEAP_SIGNATURE: [u8; 8] = *b"ZONEHEAP";

/// On-storage format major version. Any change to the header layout bumps
/// this.
pub const HEAP_MAJOR: u64 = 1;

/// On-storage format minor version.
pub const HEAP_MINOR: u64 = 0;

/// Magic tag of an initialized zone header.
pub const ZONE_MAGIC: u32 = 0x5A4E_4831;

/// Size of the run header preceding a run's bitmap.
pub const RUN_BASE_METADATA_SIZE: usize = 16;

/// Chunk flag: blocks in this chunk carry a 16-byte size record.
pub const CHUNK_FLAG_COMPACT_HEADER: u16 = 0x1;

/// Chunk flag: blocks in this chunk carry no header at all.
pub const CHUNK_FLAG_HEADER_NONE: u16 = 0x2;

/// All currently defined chunk flags.
pub const CHUNK_FLAGS_ALL: u16 = CHUNK_FLAG_COMPACT_HEADER | CHUNK_FLAG_HEADER_NONE;

/// Persistent type of a top-level chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// Never initialized (or a footer slot).
    Unknown,
    Free,
    Used,
    /// First chunk of a run; holds the run header and bitmap.
    Run,
    /// Continuation chunk of a multi-chunk run.
    RunData,
}

impl ChunkKind {
    fn from_raw(v: u16) -> Self {
        match v {
            1 => ChunkKind::Free,
            2 => ChunkKind::Used,
            3 => ChunkKind::Run,
            4 => ChunkKind::RunData,
            _ => ChunkKind::Unknown,
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            ChunkKind::Unknown => 0,
            ChunkKind::Free => 1,
            ChunkKind::Used => 2,
            ChunkKind::Run => 3,
            ChunkKind::RunData => 4,
        }
    }
}

/// One chunk header, packed into a single word: type, flags and the extent
/// of the chunk in chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub kind: ChunkKind,
    pub flags: u16,
    pub size_idx: u32,
}

impl ChunkHeader {
    pub fn new(kind: ChunkKind, flags: u16, size_idx: u32) -> Self {
        Self {
            kind,
            flags,
            size_idx,
        }
    }

    pub fn encode(self) -> u64 {
        self.kind.to_raw() as u64 | (self.flags as u64) << 16 | (self.size_idx as u64) << 32
    }

    pub fn decode(word: u64) -> Self {
        Self {
            kind: ChunkKind::from_raw(word as u16),
            flags: (word >> 16) as u16,
            size_idx: (word >> 32) as u32,
        }
    }
}

/// The leading word of a zone header: magic tag and the number of chunks in
/// the zone. The remaining 56 bytes of the header are reserved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneHeader {
    pub magic: u32,
    pub size_idx: u32,
}

impl ZoneHeader {
    pub fn encode(self) -> u64 {
        self.magic as u64 | (self.size_idx as u64) << 32
    }

    pub fn decode(word: u64) -> Self {
        Self {
            magic: word as u32,
            size_idx: (word >> 32) as u32,
        }
    }
}

/// The heap header: one copy at offset 0, checksummed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapHeader {
    pub signature: [u8; 8],
    pub major: u64,
    pub minor: u64,
    pub chunk_size: u64,
    pub chunks_per_zone: u64,
    pub checksum: u64,
}

impl HeapHeader {
    /// Header for a freshly initialized pool in the current format.
    pub fn new() -> Self {
        Self {
            signature: HEAP_SIGNATURE,
            major: HEAP_MAJOR,
            minor: HEAP_MINOR,
            chunk_size: CHUNK_SIZE as u64,
            chunks_per_zone: MAX_CHUNK as u64,
            checksum: 0,
        }
    }

    /// Serializes the header with a freshly computed checksum.
    pub fn serialize(&self) -> [u8; HEAP_HEADER_SIZE] {
        let mut out = [0u8; HEAP_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.signature);
        out[8..16].copy_from_slice(&self.major.to_le_bytes());
        out[16..24].copy_from_slice(&self.minor.to_le_bytes());
        out[24..32].copy_from_slice(&self.chunk_size.to_le_bytes());
        out[32..40].copy_from_slice(&self.chunks_per_zone.to_le_bytes());
        let sum = checksum(&out);
        out[HEAP_HEADER_SIZE - 8..].copy_from_slice(&sum.to_le_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8; HEAP_HEADER_SIZE]) -> Self {
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&bytes[0..8]);
        Self {
            signature,
            major: read_u64(bytes, 8),
            minor: read_u64(bytes, 16),
            chunk_size: read_u64(bytes, 24),
            chunks_per_zone: read_u64(bytes, 32),
            checksum: read_u64(bytes, HEAP_HEADER_SIZE - 8),
        }
    }

    /// Verifies checksum and signature of a serialized header.
    pub fn verify(bytes: &[u8; HEAP_HEADER_SIZE]) -> Result<(), HeapError> {
        let stored = read_u64(bytes, HEAP_HEADER_SIZE - 8);
        if stored != checksum(bytes) {
            log::error!("heap: invalid header checksum");
            return Err(HeapError::Corrupt("invalid header checksum".into()));
        }
        if bytes[0..8] != HEAP_SIGNATURE {
            log::error!("heap: invalid signature");
            return Err(HeapError::Corrupt("invalid signature".into()));
        }
        Ok(())
    }
}

impl Default for HeapHeader {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u64(bytes: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Header checksum: blake3 over the serialized header with the checksum
/// field zeroed, truncated to the low 64 bits.
fn checksum(bytes: &[u8; HEAP_HEADER_SIZE]) -> u64 {
    let mut copy = *bytes;
    copy[HEAP_HEADER_SIZE - 8..].fill(0);
    let hash = blake3::hash(&copy);
    read_u64(&hash.as_bytes()[..8], 0)
}

/// Byte offset of zone `zone_id`.
pub fn zone_offset(zone_id: u32) -> usize {
    HEAP_HEADER_SIZE + zone_id as usize * ZONE_MAX_SIZE
}

/// Byte offset of the chunk header array entry for `chunk_id`.
pub fn chunk_header_offset(zone_id: u32, chunk_id: u32) -> usize {
    zone_offset(zone_id) + ZONE_HEADER_SIZE + chunk_id as usize * CHUNK_HEADER_SIZE
}

/// Byte offset of the first payload byte of chunk `chunk_id`.
pub fn chunk_data_offset(zone_id: u32, chunk_id: u32) -> usize {
    zone_offset(zone_id) + ZONE_METADATA_SIZE + chunk_id as usize * CHUNK_SIZE
}

/// Reads the chunk header of (`zone_id`, `chunk_id`).
pub fn read_chunk_header(region: &PoolRegion, zone_id: u32, chunk_id: u32) -> ChunkHeader {
    ChunkHeader::decode(region.load(chunk_header_offset(zone_id, chunk_id)))
}

/// Writes the chunk header of (`zone_id`, `chunk_id`). The caller persists.
pub fn write_chunk_header(region: &PoolRegion, zone_id: u32, chunk_id: u32, hdr: ChunkHeader) {
    region.store(chunk_header_offset(zone_id, chunk_id), hdr.encode());
}

/// Reads the zone header of `zone_id`.
pub fn read_zone_header(region: &PoolRegion, zone_id: u32) -> ZoneHeader {
    ZoneHeader::decode(region.load(zone_offset(zone_id)))
}

/// Writes the zone header of `zone_id`. The caller persists.
pub fn write_zone_header(region: &PoolRegion, zone_id: u32, hdr: ZoneHeader) {
    region.store(zone_offset(zone_id), hdr.encode());
}

/// Number of zones a heap of `size` bytes holds.
pub fn max_zone(size: usize) -> u32 {
    let mut left = size.saturating_sub(HEAP_HEADER_SIZE);
    let mut zones = 0;
    while left >= ZONE_MIN_SIZE {
        zones += 1;
        left -= left.min(ZONE_MAX_SIZE);
    }
    zones
}

/// Number of chunks in zone `zone_id` of a heap of `heap_size` bytes.
///
/// Every zone except the last is full; the last takes whatever chunks fit
/// in the remainder.
pub fn zone_calc_size_idx(zone_id: u32, nzones: u32, heap_size: usize) -> u32 {
    debug_assert!(nzones > 0);
    if zone_id < nzones - 1 {
        return MAX_CHUNK as u32;
    }
    let raw = heap_size - zone_id as usize * ZONE_MAX_SIZE - HEAP_HEADER_SIZE - ZONE_METADATA_SIZE;
    (raw / CHUNK_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_header_roundtrip() {
        let hdr = ChunkHeader::new(ChunkKind::Run, CHUNK_FLAG_COMPACT_HEADER, 7);
        assert_eq!(ChunkHeader::decode(hdr.encode()), hdr);
    }

    #[test]
    fn test_chunk_header_invalid_kind_decodes_unknown() {
        let word = 9u64 | (3u64 << 32);
        assert_eq!(ChunkHeader::decode(word).kind, ChunkKind::Unknown);
    }

    #[test]
    fn test_zone_header_roundtrip() {
        let hdr = ZoneHeader {
            magic: ZONE_MAGIC,
            size_idx: 63,
        };
        assert_eq!(ZoneHeader::decode(hdr.encode()), hdr);
    }

    #[test]
    fn test_heap_header_verify() {
        let bytes = HeapHeader::new().serialize();
        assert!(HeapHeader::verify(&bytes).is_ok());
        let decoded = HeapHeader::deserialize(&bytes);
        assert_eq!(decoded.signature, HEAP_SIGNATURE);
        assert_eq!(decoded.chunk_size, CHUNK_SIZE as u64);
    }

    #[test]
    fn test_heap_header_detects_corruption() {
        let mut bytes = HeapHeader::new().serialize();
        bytes[24] ^= 0xFF;
        assert!(matches!(
            HeapHeader::verify(&bytes),
            Err(HeapError::Corrupt(_))
        ));
    }

    #[test]
    fn test_heap_header_detects_bad_signature() {
        let mut hdr = HeapHeader::new();
        hdr.signature = *b"NOTAHEAP";
        let bytes = hdr.serialize();
        // Checksum is valid, signature is not.
        assert!(matches!(
            HeapHeader::verify(&bytes),
            Err(HeapError::Corrupt(_))
        ));
    }

    #[test]
    fn test_max_zone_boundaries() {
        assert_eq!(max_zone(0), 0);
        assert_eq!(max_zone(HEAP_MIN_SIZE - 1), 0);
        assert_eq!(max_zone(HEAP_MIN_SIZE), 1);
        assert_eq!(max_zone(HEAP_HEADER_SIZE + ZONE_MAX_SIZE), 1);
        assert_eq!(max_zone(HEAP_HEADER_SIZE + ZONE_MAX_SIZE + ZONE_MIN_SIZE), 2);
    }

    #[test]
    fn test_zone_calc_size_idx() {
        let size = HEAP_HEADER_SIZE + ZONE_MAX_SIZE + ZONE_METADATA_SIZE + 5 * CHUNK_SIZE;
        let nzones = max_zone(size);
        assert_eq!(nzones, 2);
        assert_eq!(zone_calc_size_idx(0, nzones, size), MAX_CHUNK as u32);
        assert_eq!(zone_calc_size_idx(1, nzones, size), 5);
    }

    #[test]
    fn test_offsets_are_word_aligned() {
        assert_eq!(zone_offset(1) % 8, 0);
        assert_eq!(chunk_header_offset(0, 3) % 8, 0);
        assert_eq!(chunk_data_offset(0, 1) % 8, 0);
    }
}
