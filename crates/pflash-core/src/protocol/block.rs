//! Blocks of up to four chunks, the unit of acknowledgment.
//!
//! The device takes the block base from packet 0 (offset) and packet 1
//! (segment) and writes the block contiguously from there, so packet 1
//! carries the segment in its offset field.

use super::command::{Command, CommandError};
use super::constants::{PACKET_PAYLOAD_SIZE, PACKETS_PER_BLOCK};
use crate::diff::DiffChunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    /// Index of the first chunk in the whole transfer.
    pub first_chunk: usize,
    pub chunks: Vec<DiffChunk>,
}

impl FlashBlock {
    /// Block starting at chunk `first_chunk`, taking up to four chunks.
    pub fn from_chunks(first_chunk: usize, chunks: &[DiffChunk]) -> Self {
        let end = chunks.len().min(first_chunk + PACKETS_PER_BLOCK);
        Self {
            first_chunk,
            chunks: chunks[first_chunk.min(end)..end].to_vec(),
        }
    }

    /// Split a chunk sequence into consecutive blocks.
    pub fn partition(chunks: &[DiffChunk]) -> Vec<FlashBlock> {
        (0..chunks.len())
            .step_by(PACKETS_PER_BLOCK)
            .map(|start| Self::from_chunks(start, chunks))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Fewer than four chunks: only legal as the last block, and the device
    /// does not acknowledge it.
    pub fn is_short(&self) -> bool {
        self.chunks.len() < PACKETS_PER_BLOCK
    }

    /// Packet number of the first packet (chunk index, wrapping at 256).
    pub fn sequence(&self) -> u8 {
        self.first_chunk as u8
    }

    pub fn segment(&self) -> u16 {
        self.chunks.first().map(|c| c.segment).unwrap_or(0)
    }

    /// Whether every chunk sits right after the previous one.
    pub fn is_contiguous(&self) -> bool {
        let Some(first) = self.chunks.first() else {
            return true;
        };
        self.chunks.iter().enumerate().all(|(i, c)| {
            c.address() == first.address() + (i * PACKET_PAYLOAD_SIZE) as u32
        })
    }

    /// WRITE commands for this block, in send order.
    pub fn packets(&self) -> Result<Vec<Command>, CommandError> {
        let segment = self.segment();
        self.chunks
            .iter()
            .enumerate()
            .map(|(slot, chunk)| {
                let offset = if slot == 1 { segment } else { chunk.offset };
                let packet = self.first_chunk.wrapping_add(slot) as u8;
                Command::write(offset, packet, &chunk.data)
            })
            .collect()
    }
}
