//! Chunkserver protocol shapes. Framing is the transport's business.

use bytes::Bytes;

use crate::common::chunk_part::ChunkPartType;
use crate::protocol::{NetworkAddress, Status};

#[derive(Clone, Debug)]
pub enum CsRequest {
    /// Read `size` bytes starting at byte `offset` of the part. Both must
    /// be block aligned except for the final block of the part.
    Read {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    },
    /// Like `Read` but only warms the chunkserver's cache; no data comes
    /// back.
    Prefetch {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    },
    /// Open a write pipeline through `chain` (we talk to the head, the
    /// head forwards to the rest).
    WriteInit {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        chain: Vec<NetworkAddress>,
    },
    WriteData {
        chunk_id: u64,
        write_id: u32,
        block: u16,
        offset_in_block: u32,
        size: u32,
        crc: u32,
        payload: Bytes,
    },
    WriteEnd {
        chunk_id: u64,
    },
    TestChunk {
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
    },
}

#[derive(Clone, Debug)]
pub enum CsReply {
    ReadData {
        chunk_id: u64,
        offset: u32,
        size: u32,
        crc: u32,
        payload: Bytes,
    },
    ReadStatus {
        chunk_id: u64,
        status: Status,
    },
    WriteStatus {
        chunk_id: u64,
        write_id: u32,
        status: Status,
    },
}
