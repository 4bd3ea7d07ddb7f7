//! Typed wire client for a single chunkserver channel.
//!
//! `READ` replies stream back one block per message, each with its own CRC,
//! terminated by a `READ_STATUS`. Write pipelines are opened with
//! `WRITE_INIT` against the chain head and acknowledged per `write_id`.

use bytes::Bytes;

use crate::common::chunk_part::ChunkPartType;
use crate::error::{FsError, Result};
use crate::protocol::{NetworkAddress, Status, BLOCK_SIZE};

use super::connector::CsChannel;
use super::messages::{CsReply, CsRequest};

pub struct ChunkserverClient<'a> {
    channel: &'a mut dyn CsChannel,
    address: NetworkAddress,
}

/// One delivered and CRC-checked block.
#[derive(Clone, Debug)]
pub struct DeliveredBlock {
    /// Block index relative to the start of the read request.
    pub index: u32,
    pub payload: Bytes,
}

impl<'a> ChunkserverClient<'a> {
    pub fn new(channel: &'a mut dyn CsChannel, address: NetworkAddress) -> Self {
        Self { channel, address }
    }

    /// Read `size` bytes at part offset `offset`, collecting CRC-validated
    /// blocks. A CRC mismatch aborts the read with `ChunkCrc`; the partial
    /// reply is discarded by the caller.
    pub async fn read_blocks(
        &mut self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    ) -> Result<Vec<DeliveredBlock>> {
        self.channel
            .send(CsRequest::Read { chunk_id, version, part_type, offset, size })
            .await?;

        let mut blocks = Vec::new();
        let mut received: u32 = 0;
        loop {
            match self.channel.receive().await? {
                CsReply::ReadData { chunk_id: reply_chunk, offset: block_offset, size: block_size, crc, payload } => {
                    if reply_chunk != chunk_id {
                        return Err(FsError::Protocol(format!(
                            "read data for chunk {:#x}, expected {:#x}",
                            reply_chunk, chunk_id
                        )));
                    }
                    if block_size as usize != payload.len() || block_size > BLOCK_SIZE {
                        return Err(FsError::Protocol("bad read data size".into()));
                    }
                    if block_offset < offset || (block_offset - offset) % BLOCK_SIZE != 0 {
                        return Err(FsError::Protocol("misaligned read data".into()));
                    }
                    if crc32fast::hash(&payload) != crc {
                        return Err(FsError::ChunkCrc {
                            address: self.address,
                            part: part_type,
                            chunk_id,
                        });
                    }
                    received += block_size;
                    blocks.push(DeliveredBlock {
                        index: (block_offset - offset) / BLOCK_SIZE,
                        payload,
                    });
                }
                CsReply::ReadStatus { chunk_id: reply_chunk, status } => {
                    if reply_chunk != chunk_id {
                        return Err(FsError::Protocol("read status for wrong chunk".into()));
                    }
                    if status != Status::Ok {
                        return Err(crate::error::status_to_error(status));
                    }
                    if received < size {
                        return Err(FsError::Protocol(format!(
                            "short read: {} of {} bytes",
                            received, size
                        )));
                    }
                    return Ok(blocks);
                }
                CsReply::WriteStatus { .. } => {
                    return Err(FsError::Protocol("write status during read".into()))
                }
            }
        }
    }

    /// Ask the chunkserver to warm its cache. Fire and forget.
    pub async fn prefetch(
        &mut self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        offset: u32,
        size: u32,
    ) -> Result<()> {
        self.channel
            .send(CsRequest::Prefetch { chunk_id, version, part_type, offset, size })
            .await
    }

    pub async fn write_init(
        &mut self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
        chain: Vec<NetworkAddress>,
    ) -> Result<()> {
        self.channel.send(CsRequest::WriteInit { chunk_id, version, part_type, chain }).await?;
        // the head acks pipeline setup with write_id 0
        match self.channel.receive().await? {
            CsReply::WriteStatus { chunk_id: reply_chunk, write_id: 0, status } => {
                if reply_chunk != chunk_id {
                    return Err(FsError::Protocol("write init ack for wrong chunk".into()));
                }
                if status != Status::Ok {
                    return Err(crate::error::status_to_error(status));
                }
                Ok(())
            }
            _ => Err(FsError::Protocol("expected write init ack".into())),
        }
    }

    /// Stream one block of data. Acknowledgements are collected separately
    /// with [`next_write_status`] so several writes can be in flight.
    pub async fn write_block(
        &mut self,
        chunk_id: u64,
        write_id: u32,
        block: u16,
        offset_in_block: u32,
        payload: Bytes,
    ) -> Result<()> {
        let size = payload.len() as u32;
        if offset_in_block + size > BLOCK_SIZE {
            return Err(FsError::Einval);
        }
        let crc = crc32fast::hash(&payload);
        self.channel
            .send(CsRequest::WriteData {
                chunk_id,
                write_id,
                block,
                offset_in_block,
                size,
                crc,
                payload,
            })
            .await
    }

    /// Wait for the next write acknowledgement. They may arrive out of
    /// order; the caller resequences by `write_id`.
    pub async fn next_write_status(&mut self, chunk_id: u64) -> Result<(u32, Status)> {
        match self.channel.receive().await? {
            CsReply::WriteStatus { chunk_id: reply_chunk, write_id, status } => {
                if reply_chunk != chunk_id {
                    return Err(FsError::Protocol("write status for wrong chunk".into()));
                }
                Ok((write_id, status))
            }
            _ => Err(FsError::Protocol("expected write status".into())),
        }
    }

    pub async fn write_end(&mut self, chunk_id: u64) -> Result<()> {
        self.channel.send(CsRequest::WriteEnd { chunk_id }).await
    }

    pub async fn test_chunk(
        &mut self,
        chunk_id: u64,
        version: u32,
        part_type: ChunkPartType,
    ) -> Result<()> {
        self.channel.send(CsRequest::TestChunk { chunk_id, version, part_type }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;

    /// Channel fed with canned replies.
    struct ScriptedChannel {
        sent: Vec<CsRequest>,
        replies: VecDeque<CsReply>,
    }

    impl ScriptedChannel {
        fn new(replies: Vec<CsReply>) -> Self {
            Self { sent: Vec::new(), replies: replies.into() }
        }
    }

    impl CsChannel for ScriptedChannel {
        fn send<'a>(
            &'a mut self,
            request: CsRequest,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            self.sent.push(request);
            Box::pin(async { Ok(()) })
        }

        fn receive<'a>(
            &'a mut self,
        ) -> Pin<Box<dyn Future<Output = Result<CsReply>> + Send + 'a>> {
            let reply = self.replies.pop_front();
            Box::pin(async move { reply.ok_or(FsError::Timeout) })
        }
    }

    fn data_reply(chunk_id: u64, offset: u32, payload: Vec<u8>) -> CsReply {
        let crc = crc32fast::hash(&payload);
        CsReply::ReadData {
            chunk_id,
            offset,
            size: payload.len() as u32,
            crc,
            payload: payload.into(),
        }
    }

    #[tokio::test]
    async fn read_collects_validated_blocks() {
        let mut channel = ScriptedChannel::new(vec![
            data_reply(9, 0, vec![1u8; BLOCK_SIZE as usize]),
            data_reply(9, BLOCK_SIZE, vec![2u8; BLOCK_SIZE as usize]),
            CsReply::ReadStatus { chunk_id: 9, status: Status::Ok },
        ]);
        let mut client = ChunkserverClient::new(&mut channel, NetworkAddress::new(1, 1));
        let blocks = client
            .read_blocks(9, 1, ChunkPartType::Standard, 0, 2 * BLOCK_SIZE)
            .await
            .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].index, 0);
        assert_eq!(blocks[1].index, 1);
        assert_eq!(blocks[1].payload[0], 2);
    }

    #[tokio::test]
    async fn crc_mismatch_is_flagged_with_location() {
        let mut channel = ScriptedChannel::new(vec![CsReply::ReadData {
            chunk_id: 9,
            offset: 0,
            size: 4,
            crc: 0xdeadbeef,
            payload: vec![0u8; 4].into(),
        }]);
        let address = NetworkAddress::new(7, 7);
        let mut client = ChunkserverClient::new(&mut channel, address);
        let err = client
            .read_blocks(9, 1, ChunkPartType::Standard, 0, 4)
            .await
            .unwrap_err();
        match err {
            FsError::ChunkCrc { address: a, chunk_id, .. } => {
                assert_eq!(a, address);
                assert_eq!(chunk_id, 9);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn short_read_is_a_protocol_error() {
        let mut channel = ScriptedChannel::new(vec![
            data_reply(9, 0, vec![1u8; BLOCK_SIZE as usize]),
            CsReply::ReadStatus { chunk_id: 9, status: Status::Ok },
        ]);
        let mut client = ChunkserverClient::new(&mut channel, NetworkAddress::new(1, 1));
        let err = client
            .read_blocks(9, 1, ChunkPartType::Standard, 0, 2 * BLOCK_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Protocol(_)));
    }

    #[tokio::test]
    async fn prefetch_and_test_send_without_waiting() {
        let mut channel = ScriptedChannel::new(vec![]);
        let mut client = ChunkserverClient::new(&mut channel, NetworkAddress::new(1, 1));
        client.prefetch(9, 1, ChunkPartType::Standard, 0, BLOCK_SIZE).await.unwrap();
        client.test_chunk(9, 1, ChunkPartType::Standard).await.unwrap();
        assert!(matches!(channel.sent[0], CsRequest::Prefetch { .. }));
        assert!(matches!(channel.sent[1], CsRequest::TestChunk { .. }));
    }

    #[tokio::test]
    async fn write_pipeline_handshake() {
        let mut channel = ScriptedChannel::new(vec![
            CsReply::WriteStatus { chunk_id: 4, write_id: 0, status: Status::Ok },
            CsReply::WriteStatus { chunk_id: 4, write_id: 1, status: Status::Ok },
        ]);
        let mut client = ChunkserverClient::new(&mut channel, NetworkAddress::new(1, 1));
        client.write_init(4, 1, ChunkPartType::Standard, vec![]).await.unwrap();
        client.write_block(4, 1, 0, 0, vec![5u8; 16].into()).await.unwrap();
        let (write_id, status) = client.next_write_status(4).await.unwrap();
        assert_eq!((write_id, status), (1, Status::Ok));
        client.write_end(4).await.unwrap();
    }
}
