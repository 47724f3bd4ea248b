//! Universal hex region filter.
//!
//! Narrows a multi-target image to the address window (and optionally the
//! universal block flavor) of one target, so the diff and the transfer
//! only ever see that target's records.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crc::{CRC_32_ISO_HDLC, Crc};
use tracing::{debug, trace};

use super::image::AddressWindow;
use super::record::{Flavor, HexRecord, RecordType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniversalHexRegionFilter {
    pub window: AddressWindow,
    /// Keep only records from this universal block (records outside any
    /// block always pass).
    pub flavor: Option<Flavor>,
}

impl UniversalHexRegionFilter {
    pub fn new(window: AddressWindow) -> Self {
        Self {
            window,
            flavor: None,
        }
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = Some(flavor);
        self
    }

    fn accepts(&self, record: &HexRecord) -> bool {
        if !record.is_data() || !self.window.overlaps(record.address, record.end()) {
            return false;
        }
        match (self.flavor, record.flavor) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }

    /// Emit overlapping data records, an extended linear address record on
    /// each segment change, and a closing end-of-file record.
    pub fn apply(&self, records: &[HexRecord]) -> Vec<HexRecord> {
        let mut out = Vec::new();
        let mut segment: Option<u16> = None;
        let mut kept = 0usize;

        for record in records {
            if record.record_type == RecordType::EndOfFile {
                break;
            }
            if !self.accepts(record) {
                continue;
            }
            if segment != Some(record.segment()) {
                segment = Some(record.segment());
                trace!(segment = %format!("0x{:04X}", record.segment()), "Segment change");
                out.push(HexRecord {
                    address: (record.segment() as u32) << 16,
                    record_type: RecordType::ExtendedLinearAddress,
                    payload: record.segment().to_be_bytes().to_vec(),
                    declared_len: 2,
                    flavor: None,
                });
            }
            out.push(HexRecord {
                record_type: RecordType::Data,
                flavor: None,
                ..record.clone()
            });
            kept += 1;
        }

        out.push(HexRecord {
            address: 0,
            record_type: RecordType::EndOfFile,
            payload: Vec::new(),
            declared_len: 0,
            flavor: None,
        });

        debug!(
            min = %format!("0x{:X}", self.window.min),
            max = %format!("0x{:X}", self.window.max),
            input = records.len(),
            kept,
            "Filtered universal hex"
        );
        out
    }
}

/// Identity of a source image, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Content fingerprint: length plus CRC-32 of the bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        Self(format!("{}:{:08x}", bytes.len(), CRC.checksum(bytes)))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type CacheKey = (SourceId, u32, u32, Option<Flavor>);

/// Filter results shared across attempts.
#[derive(Debug, Default)]
pub struct FilterCache {
    entries: Mutex<HashMap<CacheKey, Arc<Vec<HexRecord>>>>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_filter(
        &self,
        source: &SourceId,
        filter: &UniversalHexRegionFilter,
        records: &[HexRecord],
    ) -> Arc<Vec<HexRecord>> {
        let key = (
            source.clone(),
            filter.window.min,
            filter.window.max,
            filter.flavor,
        );
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = entries.get(&key) {
            debug!(source = %source, "Filter cache hit");
            return Arc::clone(hit);
        }
        let filtered = Arc::new(filter.apply(records));
        entries.insert(key, Arc::clone(&filtered));
        filtered
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
