//! Assembled memory image for one target.

use std::collections::BTreeMap;

use super::record::HexRecord;

/// Half-open address window `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    pub min: u32,
    pub max: u32,
}

impl AddressWindow {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.min && address < self.max
    }

    /// Whether `[start, end)` shares at least one byte with the window.
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        end > self.min && start < self.max
    }
}

/// Disjoint, address-ordered byte ranges.
///
/// Later writes overwrite earlier ones; touching ranges are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryImage {
    ranges: BTreeMap<u32, Vec<u8>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble data records accepted by `select`.
    pub fn from_records<'a, I, F>(records: I, mut select: F) -> Self
    where
        I: IntoIterator<Item = &'a HexRecord>,
        F: FnMut(&HexRecord) -> bool,
    {
        let mut image = Self::new();
        for record in records {
            if record.is_data() && select(record) {
                image.write(record.address, &record.payload);
            }
        }
        image
    }

    pub fn write(&mut self, address: u32, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let end = address as u64 + bytes.len() as u64;

        // Ranges that overlap or touch [address, end)
        let touching: Vec<u32> = self
            .ranges
            .range(..=end.min(u32::MAX as u64) as u32)
            .filter(|(start, data)| **start as u64 + data.len() as u64 >= address as u64)
            .map(|(start, _)| *start)
            .collect();

        let mut merged_start = address;
        let mut merged_end = end;
        for start in &touching {
            let len = self.ranges[start].len() as u64;
            merged_start = merged_start.min(*start);
            merged_end = merged_end.max(*start as u64 + len);
        }

        let mut buf = vec![0u8; (merged_end - merged_start as u64) as usize];
        for start in touching {
            if let Some(data) = self.ranges.remove(&start) {
                let at = (start - merged_start) as usize;
                buf[at..at + data.len()].copy_from_slice(&data);
            }
        }
        let at = (address - merged_start) as usize;
        buf[at..at + bytes.len()].copy_from_slice(bytes);
        self.ranges.insert(merged_start, buf);
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.ranges.iter().map(|(a, d)| (*a, d.as_slice()))
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of bytes actually present.
    pub fn byte_len(&self) -> usize {
        self.ranges.values().map(Vec::len).sum()
    }

    pub fn start(&self) -> Option<u32> {
        self.ranges.keys().next().copied()
    }

    /// Exclusive end of the last range; may be 2^32.
    pub fn end(&self) -> Option<u64> {
        self.ranges
            .iter()
            .next_back()
            .map(|(a, d)| *a as u64 + d.len() as u64)
    }

    pub fn byte_at(&self, address: u32) -> Option<u8> {
        let (start, data) = self.ranges.range(..=address).next_back()?;
        data.get((address - start) as usize).copied()
    }

    /// Copy of the image clipped to `window`.
    pub fn clip(&self, window: AddressWindow) -> Self {
        let mut clipped = Self::new();
        for (start, data) in self.ranges() {
            let end = start as u64 + data.len() as u64;
            if end <= window.min as u64 || start >= window.max {
                continue;
            }
            let from = start.max(window.min);
            let to = end.min(window.max as u64);
            clipped.write(from, &data[(from - start) as usize..(to - start as u64) as usize]);
        }
        clipped
    }

    /// Ranges concatenated in address order, gaps dropped.
    pub fn to_concatenated_bin(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for data in self.ranges.values() {
            out.extend_from_slice(data);
        }
        out
    }

    /// One contiguous binary from the first to the last byte, gaps filled.
    pub fn to_padded_bin(&self, fill: u8) -> Vec<u8> {
        let (Some(first), Some(last)) = (self.start(), self.end()) else {
            return Vec::new();
        };
        let mut out = vec![fill; (last - first as u64) as usize];
        for (start, data) in self.ranges() {
            let at = (start - first) as usize;
            out[at..at + data.len()].copy_from_slice(data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_writes_merge() {
        let mut image = MemoryImage::new();
        image.write(0x100, &[1, 2, 3, 4]);
        image.write(0x104, &[5, 6]);
        assert_eq!(image.range_count(), 1);
        assert_eq!(image.to_concatenated_bin(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_overlapping_write_overwrites() {
        let mut image = MemoryImage::new();
        image.write(0x100, &[1, 2, 3, 4]);
        image.write(0x110, &[9, 9]);
        image.write(0x102, &[7, 7]);
        assert_eq!(image.range_count(), 2);
        assert_eq!(image.byte_at(0x102), Some(7));
        assert_eq!(image.byte_at(0x101), Some(2));
        assert_eq!(image.byte_at(0x108), None);
    }

    #[test]
    fn test_write_bridges_two_ranges() {
        let mut image = MemoryImage::new();
        image.write(0x00, &[1, 1]);
        image.write(0x04, &[3, 3]);
        image.write(0x01, &[2, 2, 2]);
        assert_eq!(image.range_count(), 1);
        assert_eq!(image.to_concatenated_bin(), vec![1, 2, 2, 2, 3, 3]);
    }

    #[test]
    fn test_padded_bin_fills_gaps() {
        let mut image = MemoryImage::new();
        image.write(0x10, &[0xAA]);
        image.write(0x13, &[0xBB]);
        assert_eq!(image.to_padded_bin(0xFF), vec![0xAA, 0xFF, 0xFF, 0xBB]);
        assert_eq!(image.to_concatenated_bin(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_clip_to_window() {
        let mut image = MemoryImage::new();
        image.write(0x0FFE, &[1, 2, 3, 4]);
        image.write(0x2000, &[5]);
        let clipped = image.clip(AddressWindow::new(0x1000, 0x2000));
        assert_eq!(clipped.start(), Some(0x1000));
        assert_eq!(clipped.to_concatenated_bin(), vec![3, 4]);
    }

    #[test]
    fn test_range_ending_at_top_of_address_space() {
        let mut image = MemoryImage::new();
        image.write(0xFFFF_FFF0, &[0xAB; 16]);
        assert_eq!(image.end(), Some(1 << 32));
        assert_eq!(image.byte_at(0xFFFF_FFFF), Some(0xAB));
        assert_eq!(image.to_padded_bin(0xFF).len(), 16);

        let clipped = image.clip(AddressWindow::new(0xFFFF_FFF8, u32::MAX));
        assert_eq!(clipped.start(), Some(0xFFFF_FFF8));
        assert_eq!(clipped.byte_len(), 7);

        let untouched = image.clip(AddressWindow::new(0x1000, 0x2000));
        assert!(untouched.is_empty());
    }
}
