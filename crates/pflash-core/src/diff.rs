//! Diff extraction.
//!
//! The build toolchain embeds a marker record followed by a hash record
//! in images that support partial flashing. Everything from the marker up
//! to the end marker is the user program; those records, minus erased
//! (all-0xFF) chunks, are what gets streamed to the device.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::hex::{HexRecord, RecordType};

/// Payload of the start marker record.
pub const MAGIC_START: [u8; 16] = [
    0x70, 0x8E, 0x3B, 0x92, 0xC6, 0x15, 0xA8, 0x41, 0xC4, 0x98, 0x66, 0xC9, 0x75, 0xEE, 0x51, 0x97,
];

/// Leading bytes of the end marker record; the next byte has high nibble 0xB.
pub const MAGIC_END_PREFIX: [u8; 7] = [0x41, 0x14, 0x0E, 0x2F, 0xB8, 0x2F, 0xA2];

/// Absolute addresses the start marker may appear at.
pub const MAGIC_ADDRESSES: [u32; 3] = [0x1F000, 0x47000, 0x77000];

/// Largest number of program chunks (after the marker and hash records)
/// still worth a partial transfer.
pub const MAX_DIFF_CHUNKS: usize = 700;

/// Marker and hash record, always sent ahead of the program chunks.
const HEADER_CHUNKS: usize = 2;

/// Maximum payload of one chunk.
pub const CHUNK_SIZE: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("No partial flashing information in image")]
    NoDiffAvailable,

    #[error("Too many changes for a partial update: {count} chunks (max {max})")]
    TooManyChanges { count: usize, max: usize },
}

/// Reference (baseline runtime) hash and program hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashPair {
    pub reference: [u8; 8],
    pub program: [u8; 8],
}

impl HashPair {
    fn from_record(record: &HexRecord) -> Option<Self> {
        if !record.is_data() || record.payload.len() != 16 {
            return None;
        }
        let mut reference = [0u8; 8];
        let mut program = [0u8; 8];
        reference.copy_from_slice(&record.payload[..8]);
        program.copy_from_slice(&record.payload[8..16]);
        Some(Self { reference, program })
    }
}

/// One changed memory unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffChunk {
    pub segment: u16,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl DiffChunk {
    pub fn address(&self) -> u32 {
        ((self.segment as u32) << 16) | self.offset as u32
    }

    /// Erased flash reads as 0xFF, so writing such a chunk is a no-op.
    pub fn is_erased(&self) -> bool {
        self.data.iter().all(|b| *b == 0xFF)
    }
}

pub fn is_magic_start(record: &HexRecord) -> bool {
    record.is_data() && record.payload.len() >= MAGIC_START.len() && record.payload[..16] == MAGIC_START
}

pub fn is_magic_end(record: &HexRecord) -> bool {
    record.is_data()
        && record.payload.len() > MAGIC_END_PREFIX.len()
        && record.payload[..7] == MAGIC_END_PREFIX
        && record.payload[7] >> 4 == 0xB
}

/// Locates the marker and produces the chunk sequence.
#[derive(Debug, Clone)]
pub struct DiffExtractor {
    marker_addresses: Vec<u32>,
    max_chunks: usize,
}

impl Default for DiffExtractor {
    fn default() -> Self {
        Self {
            marker_addresses: MAGIC_ADDRESSES.to_vec(),
            max_chunks: MAX_DIFF_CHUNKS,
        }
    }
}

impl DiffExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the accepted marker addresses (one hardware family).
    pub fn with_marker_addresses(mut self, addresses: &[u32]) -> Self {
        self.marker_addresses = addresses.to_vec();
        self
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    fn find_marker(&self, records: &[HexRecord]) -> Option<usize> {
        records
            .iter()
            .take_while(|r| r.record_type != RecordType::EndOfFile)
            .position(|r| is_magic_start(r) && self.marker_addresses.contains(&r.address))
    }

    fn read_hashes(&self, records: &[HexRecord]) -> Option<(usize, HashPair)> {
        let marker = self.find_marker(records)?;
        // The hash record must follow the marker directly
        let hash_record = records.get(marker + 1)?;
        HashPair::from_record(hash_record).map(|pair| (marker, pair))
    }

    /// Extract from one record set.
    pub fn extract(&self, records: Arc<Vec<HexRecord>>) -> Result<PartialFlashInfo, DiffError> {
        self.extract_with_filtered(records, None)
    }

    /// Hashes come from `unfiltered`; chunks come from `filtered` when it
    /// still contains the marker, otherwise from `unfiltered`.
    pub fn extract_with_filtered(
        &self,
        unfiltered: Arc<Vec<HexRecord>>,
        filtered: Option<Arc<Vec<HexRecord>>>,
    ) -> Result<PartialFlashInfo, DiffError> {
        let (unfiltered_marker, hashes) = self
            .read_hashes(&unfiltered)
            .ok_or(DiffError::NoDiffAvailable)?;

        let (records, marker) = match filtered {
            Some(f) => match self.find_marker(&f) {
                Some(m) => (f, m),
                None => {
                    debug!("Filtered image lost the marker, using unfiltered records");
                    (unfiltered, unfiltered_marker)
                }
            },
            None => (unfiltered, unfiltered_marker),
        };

        let info = PartialFlashInfo {
            hashes,
            records,
            marker,
            chunk_count: 0,
        };
        let count = info.chunks().count();
        let program_chunks = count.saturating_sub(HEADER_CHUNKS);
        if program_chunks > self.max_chunks {
            info!(
                count = program_chunks,
                max = self.max_chunks,
                "Diff too large for partial flashing"
            );
            return Err(DiffError::TooManyChanges {
                count: program_chunks,
                max: self.max_chunks,
            });
        }

        info!(
            marker = %format!("0x{:X}", info.records[marker].address),
            chunks = count,
            "Partial flashing information found"
        );
        Ok(PartialFlashInfo {
            chunk_count: count,
            ..info
        })
    }
}

/// Hash pair plus a restartable chunk sequence.
#[derive(Debug, Clone)]
pub struct PartialFlashInfo {
    hashes: HashPair,
    records: Arc<Vec<HexRecord>>,
    marker: usize,
    chunk_count: usize,
}

impl PartialFlashInfo {
    pub fn hashes(&self) -> HashPair {
        self.hashes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Fresh iterator starting at the marker record.
    pub fn chunks(&self) -> DiffChunks<'_> {
        DiffChunks {
            records: &self.records[self.marker..],
            pending: Vec::new(),
            done: false,
        }
    }

    pub fn collect_chunks(&self) -> Vec<DiffChunk> {
        self.chunks().collect()
    }
}

/// Lazy walk over the program records.
pub struct DiffChunks<'a> {
    records: &'a [HexRecord],
    /// Split pieces of the current record, reversed.
    pending: Vec<DiffChunk>,
    done: bool,
}

impl Iterator for DiffChunks<'_> {
    type Item = DiffChunk;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.pending.pop() {
                return Some(chunk);
            }
            if self.done {
                return None;
            }
            let Some((record, rest)) = self.records.split_first() else {
                self.done = true;
                continue;
            };
            self.records = rest;

            if record.record_type == RecordType::EndOfFile || is_magic_end(record) {
                self.done = true;
                continue;
            }
            if !record.is_data() {
                continue;
            }

            let mut pieces: Vec<DiffChunk> = record
                .payload
                .chunks(CHUNK_SIZE)
                .enumerate()
                .map(|(i, data)| {
                    let address = record.address.wrapping_add((i * CHUNK_SIZE) as u32);
                    DiffChunk {
                        segment: (address >> 16) as u16,
                        offset: address as u16,
                        data: data.to_vec(),
                    }
                })
                .filter(|c| !c.is_erased())
                .collect();
            pieces.reverse();
            self.pending = pieces;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(address: u32, payload: Vec<u8>) -> HexRecord {
        HexRecord {
            address,
            record_type: RecordType::Data,
            declared_len: payload.len(),
            payload,
            flavor: None,
        }
    }

    fn hashes() -> Vec<u8> {
        let mut v = vec![0xA1; 8];
        v.extend_from_slice(&[0xB2; 8]);
        v
    }

    fn end_marker(address: u32) -> HexRecord {
        let mut payload = MAGIC_END_PREFIX.to_vec();
        payload.push(0xB5);
        payload.extend_from_slice(&[0; 8]);
        data(address, payload)
    }

    fn image() -> Vec<HexRecord> {
        vec![
            data(0x1E000, vec![0x01; 16]),
            data(0x1F000, MAGIC_START.to_vec()),
            data(0x1F010, hashes()),
            data(0x1F020, vec![0x22; 16]),
            data(0x1F030, vec![0xFF; 16]),
            data(0x1F040, vec![0x33; 32]),
            end_marker(0x1F060),
            data(0x1F070, vec![0x44; 16]),
        ]
    }

    #[test]
    fn test_extracts_hashes_and_chunks() {
        let info = DiffExtractor::new().extract(Arc::new(image())).unwrap();
        assert_eq!(info.hashes().reference, [0xA1; 8]);
        assert_eq!(info.hashes().program, [0xB2; 8]);

        let chunks = info.collect_chunks();
        let addrs: Vec<u32> = chunks.iter().map(DiffChunk::address).collect();
        // marker, hashes, data, erased dropped, 32-byte record split, stop at end marker
        assert_eq!(addrs, vec![0x1F000, 0x1F010, 0x1F020, 0x1F040, 0x1F050]);
        assert_eq!(info.chunk_count(), 5);
        assert!(chunks.iter().all(|c| c.data.len() <= CHUNK_SIZE && !c.is_erased()));
        assert_eq!(chunks[0].segment, 0x0001);
        assert_eq!(chunks[0].offset, 0xF000);
    }

    #[test]
    fn test_chunks_are_restartable() {
        let info = DiffExtractor::new().extract(Arc::new(image())).unwrap();
        let first: Vec<_> = info.chunks().collect();
        let second: Vec<_> = info.chunks().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_marker() {
        let records = vec![data(0x1F000, vec![0x00; 16])];
        let err = DiffExtractor::new().extract(Arc::new(records)).unwrap_err();
        assert_eq!(err, DiffError::NoDiffAvailable);
    }

    #[test]
    fn test_marker_at_unknown_address_ignored() {
        let records = vec![data(0x2F000, MAGIC_START.to_vec()), data(0x2F010, hashes())];
        let err = DiffExtractor::new().extract(Arc::new(records)).unwrap_err();
        assert_eq!(err, DiffError::NoDiffAvailable);
    }

    #[test]
    fn test_short_hash_record() {
        let records = vec![data(0x1F000, MAGIC_START.to_vec()), data(0x1F010, vec![0; 8])];
        let err = DiffExtractor::new().extract(Arc::new(records)).unwrap_err();
        assert_eq!(err, DiffError::NoDiffAvailable);
    }

    #[test]
    fn test_too_many_changes() {
        let mut records = vec![data(0x1F000, MAGIC_START.to_vec()), data(0x1F010, hashes())];
        for i in 0..10u32 {
            records.push(data(0x1F020 + i * 16, vec![i as u8; 16]));
        }
        let err = DiffExtractor::new()
            .with_max_chunks(8)
            .extract(Arc::new(records))
            .unwrap_err();
        assert_eq!(err, DiffError::TooManyChanges { count: 10, max: 8 });
    }

    fn program_of(chunks: u32) -> Vec<HexRecord> {
        let mut records = vec![data(0x47000, MAGIC_START.to_vec()), data(0x47010, hashes())];
        for i in 0..chunks {
            records.push(data(0x47020 + i * 16, vec![(i % 200) as u8; 16]));
        }
        records
    }

    #[test]
    fn test_ceiling_counts_program_chunks_only() {
        let info = DiffExtractor::new()
            .extract(Arc::new(program_of(MAX_DIFF_CHUNKS as u32)))
            .unwrap();
        assert_eq!(info.chunk_count(), MAX_DIFF_CHUNKS + 2);

        let err = DiffExtractor::new()
            .extract(Arc::new(program_of(MAX_DIFF_CHUNKS as u32 + 1)))
            .unwrap_err();
        assert_eq!(
            err,
            DiffError::TooManyChanges {
                count: 701,
                max: 700
            }
        );
    }

    #[test]
    fn test_hash_record_must_follow_marker() {
        let records = vec![
            data(0x1F000, MAGIC_START.to_vec()),
            HexRecord {
                address: 0x10000,
                record_type: RecordType::ExtendedLinearAddress,
                payload: vec![0x00, 0x01],
                declared_len: 2,
                flavor: None,
            },
            data(0x1F010, hashes()),
        ];
        let err = DiffExtractor::new().extract(Arc::new(records)).unwrap_err();
        assert_eq!(err, DiffError::NoDiffAvailable);
    }

    #[test]
    fn test_filtered_source_preferred() {
        let unfiltered = Arc::new(image());
        let filtered = Arc::new(image()[1..4].to_vec());
        let info = DiffExtractor::new()
            .extract_with_filtered(unfiltered, Some(filtered))
            .unwrap();
        assert_eq!(info.chunk_count(), 3);
    }

    #[test]
    fn test_filtered_without_marker_falls_back() {
        let unfiltered = Arc::new(image());
        let filtered = Arc::new(vec![data(0x1E000, vec![0x01; 16])]);
        let info = DiffExtractor::new()
            .extract_with_filtered(unfiltered, Some(filtered))
            .unwrap();
        assert_eq!(info.chunk_count(), 5);
    }

    #[test]
    fn test_marker_restricted_to_family() {
        let err = DiffExtractor::new()
            .with_marker_addresses(&[0x47000, 0x77000])
            .extract(Arc::new(image()))
            .unwrap_err();
        assert_eq!(err, DiffError::NoDiffAvailable);
    }
}
