//! Streaming Intel HEX parser.
//!
//! Resolves each record's absolute address from the extended address
//! register and tags records with the flavor of the enclosing universal
//! block. Parsing stops at the first malformed line; records produced
//! before it stay valid.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{BufRead, BufReader, Cursor, Read};

use tracing::{debug, warn};

use super::record::{Flavor, HexError, HexRecord, RawRecord, RecordType};

/// Signature line of a V3-only image.
pub const SIGNATURE_V3: &str = ":1000000000040020810A000015070000610A0000BA";
/// Signature line of a V1/V2 image.
pub const SIGNATURE_V2: &str = ":020000040000FA";
/// Signature line of a universal (multi-target) image.
pub const SIGNATURE_UNIVERSAL: &str = ":0400000A9900C0DEBB";

/// Hardware families an image claims to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HexVersion {
    V2,
    V3,
    Universal,
    Invalid,
}

impl HexVersion {
    fn signature(&self) -> Option<&'static str> {
        match self {
            HexVersion::V2 => Some(SIGNATURE_V2),
            HexVersion::V3 => Some(SIGNATURE_V3),
            HexVersion::Universal => Some(SIGNATURE_UNIVERSAL),
            HexVersion::Invalid => None,
        }
    }
}

impl fmt::Display for HexVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexVersion::V2 => write!(f, "V2"),
            HexVersion::V3 => write!(f, "V3"),
            HexVersion::Universal => write!(f, "Universal"),
            HexVersion::Invalid => write!(f, "Invalid"),
        }
    }
}

/// Detect target versions from the first two non-empty lines.
///
/// Returns `{Invalid}` when no signature matches.
pub fn detect_versions<R: BufRead>(reader: R) -> BTreeSet<HexVersion> {
    let head: Vec<String> = reader
        .lines()
        .map_while(Result::ok)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .take(2)
        .collect();

    let mut versions: BTreeSet<HexVersion> = [HexVersion::V2, HexVersion::V3, HexVersion::Universal]
        .into_iter()
        .filter(|v| {
            v.signature()
                .is_some_and(|sig| head.iter().any(|line| line.eq_ignore_ascii_case(sig)))
        })
        .collect();

    if versions.is_empty() {
        versions.insert(HexVersion::Invalid);
    }
    versions
}

/// Iterator over resolved records.
pub struct HexParser<R> {
    reader: R,
    line_no: usize,
    base: u32,
    flavor: Option<Flavor>,
    finished: bool,
}

impl<R: BufRead> HexParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            base: 0,
            flavor: None,
            finished: false,
        }
    }

    fn resolve(&mut self, raw: RawRecord) -> HexRecord {
        match raw.record_type {
            RecordType::ExtendedSegmentAddress => {
                self.base = (u16::from_be_bytes([raw.data[0], raw.data[1]]) as u32) << 4;
            }
            RecordType::ExtendedLinearAddress => {
                self.base = (u16::from_be_bytes([raw.data[0], raw.data[1]]) as u32) << 16;
            }
            RecordType::BlockStart if raw.data.len() >= 2 => {
                let flavor = Flavor::from_board_id(u16::from_be_bytes([raw.data[0], raw.data[1]]));
                debug!(line = self.line_no, flavor = %flavor, "Universal block start");
                self.flavor = Some(flavor);
            }
            _ => {}
        }

        let address = if raw.record_type.is_data() {
            self.base.wrapping_add(raw.offset as u32)
        } else {
            self.base
        };

        HexRecord {
            address,
            record_type: raw.record_type,
            declared_len: raw.data.len(),
            payload: raw.data,
            flavor: self.flavor,
        }
    }
}

impl<R: BufRead> Iterator for HexParser<R> {
    type Item = Result<HexRecord, HexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.finished = true;
                    return None;
                }
                Ok(_) => {
                    self.line_no += 1;
                    if !line.trim().is_empty() {
                        break;
                    }
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(HexError::Io(e)));
                }
            }
        }

        match RawRecord::parse(line.trim()) {
            Ok(raw) => {
                let record = self.resolve(raw);
                if record.record_type == RecordType::EndOfFile {
                    self.finished = true;
                }
                Some(Ok(record))
            }
            Err(source) => {
                self.finished = true;
                warn!(line = self.line_no, error = %source, "Stopping at malformed HEX line");
                Some(Err(HexError::Malformed {
                    line: self.line_no,
                    source,
                }))
            }
        }
    }
}

/// Records read up to the first malformed line.
#[derive(Debug, Default)]
pub struct ParsedHex {
    pub records: Vec<HexRecord>,
    /// The error that stopped parsing, if any.
    pub error: Option<HexError>,
}

impl ParsedHex {
    pub fn from_reader<R: Read>(reader: R) -> Self {
        let mut parsed = ParsedHex::default();
        for item in HexParser::new(BufReader::new(reader)) {
            match item {
                Ok(record) => parsed.records.push(record),
                Err(e) => parsed.error = Some(e),
            }
        }
        debug!(
            records = parsed.records.len(),
            complete = parsed.error.is_none(),
            "Parsed HEX image"
        );
        parsed
    }

    pub fn parse_text(text: &str) -> Self {
        Self::from_reader(Cursor::new(text.as_bytes()))
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    pub fn has_data(&self) -> bool {
        self.records.iter().any(HexRecord::is_data)
    }

    /// Usable records, or the reason there are none.
    pub fn into_usable(self) -> Result<Vec<HexRecord>, HexError> {
        if self.has_data() {
            return Ok(self.records);
        }
        Err(self.error.unwrap_or(HexError::Empty))
    }
}

/// Encode records back to text, one line each.
///
/// Address records are regenerated: an extended linear address record is
/// written whenever the segment of the next data record changes.
pub fn encode_records(records: &[HexRecord]) -> String {
    let mut out = String::new();
    let mut segment: Option<u16> = None;
    for record in records {
        match record.record_type {
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress => continue,
            _ if record.is_data() && segment != Some(record.segment()) => {
                segment = Some(record.segment());
                out.push_str(&RawRecord::extended_linear_address(record.segment()).encode());
                out.push('\n');
            }
            _ => {}
        }
        out.push_str(&record.to_raw().encode());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
:020000040001F9
:10000000000102030405060708090A0B0C0D0E0F78
:020000021000EC
:0400100010111213A6
:00000001FF
";

    #[test]
    fn test_extended_address_resolution() {
        let parsed = ParsedHex::parse_text(SAMPLE);
        assert!(parsed.is_complete());
        let data: Vec<_> = parsed.records.iter().filter(|r| r.is_data()).collect();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].address, 0x0001_0000);
        // ESA 0x1000 << 4 = 0x10000, plus field address 0x0010
        assert_eq!(data[1].address, 0x0001_0010);
        assert_eq!(data[1].payload, vec![0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn test_stops_at_malformed_line() {
        let text = "\
:020000040001F9
:0400000001020304F2
:04000400ZZ020304F2
:0400080001020304EA
:00000001FF
";
        let parsed = ParsedHex::parse_text(text);
        assert_eq!(parsed.records.len(), 2);
        match parsed.error {
            Some(HexError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(parsed.has_data());
    }

    #[test]
    fn test_stops_at_eof_record() {
        let text = ":00000001FF\n:0400000001020304F2\n";
        let parsed = ParsedHex::parse_text(text);
        assert_eq!(parsed.records.len(), 1);
        assert!(parsed.is_complete());
        assert!(matches!(parsed.into_usable(), Err(HexError::Empty)));
    }

    #[test]
    fn test_blank_lines_skipped() {
        let text = "\n:0400000001020304F2\r\n\n:00000001FF\n";
        let parsed = ParsedHex::parse_text(text);
        assert_eq!(parsed.records.len(), 2);
        assert!(parsed.is_complete());
    }

    #[test]
    fn test_block_start_tags_flavor() {
        let text = "\
:020000040000FA
:0400000A9900C0DEBB
:0400000001020304F2
:0400000A9903C0DEB8
:0400000D01020304E5
:00000001FF
";
        let parsed = ParsedHex::parse_text(text);
        assert!(parsed.is_complete());
        let data: Vec<_> = parsed.records.iter().filter(|r| r.is_data()).collect();
        assert_eq!(data[0].flavor, Some(Flavor::Nrf51));
        assert_eq!(data[1].flavor, Some(Flavor::Nrf52));
        assert_eq!(data[1].record_type, RecordType::CustomData);
    }

    #[test]
    fn test_detect_versions() {
        let universal = format!("{}\n{}\n", SIGNATURE_V2, SIGNATURE_UNIVERSAL);
        let versions = detect_versions(Cursor::new(universal));
        assert!(versions.contains(&HexVersion::V2));
        assert!(versions.contains(&HexVersion::Universal));
        assert!(!versions.contains(&HexVersion::Invalid));

        let v3 = format!("{}\n:00000001FF\n", SIGNATURE_V3);
        let versions = detect_versions(Cursor::new(v3));
        assert_eq!(versions.into_iter().collect::<Vec<_>>(), vec![HexVersion::V3]);

        let junk = detect_versions(Cursor::new("hello\nworld\n"));
        assert_eq!(junk.into_iter().collect::<Vec<_>>(), vec![HexVersion::Invalid]);
    }

    #[test]
    fn test_encode_records_roundtrip() {
        let parsed = ParsedHex::parse_text(SAMPLE);
        let text = encode_records(&parsed.records);
        let reparsed = ParsedHex::parse_text(&text);
        let a: Vec<_> = parsed.records.iter().filter(|r| r.is_data()).collect();
        let b: Vec<_> = reparsed.records.iter().filter(|r| r.is_data()).collect();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].payload, b[0].payload);
        assert_eq!(a[0].address, b[0].address);
    }
}
