//! Intel HEX record types and single-line codec.
//!
//! A line has the shape `:LLAAAATT[DD..]CC`: byte count, 16-bit field
//! address, record type, payload and a checksum that makes the byte sum
//! of the whole record zero modulo 256.

use std::fmt;
use thiserror::Error;

/// Errors for a single record line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Missing ':' start code")]
    MissingStartCode,

    #[error("Record too short: {len} characters")]
    TooShort { len: usize },

    #[error("Non-hex character in record")]
    InvalidDigit,

    #[error("Declared {declared} data bytes, found {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Unknown record type 0x{0:02X}")]
    UnknownType(u8),

    #[error("Address record must carry 2 bytes, found {0}")]
    BadAddressRecord(usize),
}

/// Errors produced while reading a whole HEX file.
#[derive(Error, Debug)]
pub enum HexError {
    #[error("Line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: RecordError,
    },

    #[error("No usable records in image")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Intel HEX record types, including the universal-hex extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Data = 0x00,
    EndOfFile = 0x01,
    ExtendedSegmentAddress = 0x02,
    StartSegmentAddress = 0x03,
    ExtendedLinearAddress = 0x04,
    StartLinearAddress = 0x05,
    BlockStart = 0x0A,
    BlockEnd = 0x0B,
    PaddedData = 0x0C,
    CustomData = 0x0D,
    Other = 0x0E,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::Data,
            0x01 => Self::EndOfFile,
            0x02 => Self::ExtendedSegmentAddress,
            0x03 => Self::StartSegmentAddress,
            0x04 => Self::ExtendedLinearAddress,
            0x05 => Self::StartLinearAddress,
            0x0A => Self::BlockStart,
            0x0B => Self::BlockEnd,
            0x0C => Self::PaddedData,
            0x0D => Self::CustomData,
            0x0E => Self::Other,
            _ => return None,
        })
    }

    /// Whether records of this type carry program bytes.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data | Self::CustomData)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Data => write!(f, "DATA"),
            RecordType::EndOfFile => write!(f, "EOF"),
            RecordType::ExtendedSegmentAddress => write!(f, "ESA"),
            RecordType::StartSegmentAddress => write!(f, "SSA"),
            RecordType::ExtendedLinearAddress => write!(f, "ELA"),
            RecordType::StartLinearAddress => write!(f, "SLA"),
            RecordType::BlockStart => write!(f, "BLOCK_START"),
            RecordType::BlockEnd => write!(f, "BLOCK_END"),
            RecordType::PaddedData => write!(f, "PADDED"),
            RecordType::CustomData => write!(f, "CUSTOM_DATA"),
            RecordType::Other => write!(f, "OTHER"),
        }
    }
}

/// Target flavor announced by a universal-hex block-start record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// nRF51 image (V1/V2 boards).
    Nrf51,
    /// nRF52 image (V3 boards).
    Nrf52,
    /// Board id this crate has no mapping for.
    Unknown(u16),
}

impl Flavor {
    pub fn from_board_id(id: u16) -> Self {
        match id {
            0x9900 | 0x9901 => Self::Nrf51,
            0x9903..=0x9905 => Self::Nrf52,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flavor::Nrf51 => write!(f, "nRF51"),
            Flavor::Nrf52 => write!(f, "nRF52"),
            Flavor::Unknown(id) => write!(f, "board 0x{:04X}", id),
        }
    }
}

/// One line as it appears in the file, before address resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub offset: u16,
    pub record_type: RecordType,
    pub data: Vec<u8>,
}

impl RawRecord {
    pub fn new(offset: u16, record_type: RecordType, data: Vec<u8>) -> Self {
        Self {
            offset,
            record_type,
            data,
        }
    }

    /// Parse a single trimmed line.
    pub fn parse(line: &str) -> Result<Self, RecordError> {
        let body = line.strip_prefix(':').ok_or(RecordError::MissingStartCode)?;
        if body.len() < 10 {
            return Err(RecordError::TooShort { len: line.len() });
        }
        if body.len() % 2 != 0 {
            return Err(RecordError::InvalidDigit);
        }
        let bytes = decode_hex(body)?;

        let declared = bytes[0] as usize;
        let actual = bytes.len() - 5;
        if declared != actual {
            return Err(RecordError::LengthMismatch { declared, actual });
        }

        let (content, tail) = bytes.split_at(bytes.len() - 1);
        let expected = checksum(content);
        if expected != tail[0] {
            return Err(RecordError::ChecksumMismatch {
                expected,
                actual: tail[0],
            });
        }

        let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
        let record_type = RecordType::from_u8(bytes[3]).ok_or(RecordError::UnknownType(bytes[3]))?;
        let data = bytes[4..4 + declared].to_vec();

        if matches!(
            record_type,
            RecordType::ExtendedSegmentAddress | RecordType::ExtendedLinearAddress
        ) && data.len() != 2
        {
            return Err(RecordError::BadAddressRecord(data.len()));
        }

        Ok(Self {
            offset,
            record_type,
            data,
        })
    }

    /// Encode to an upper-case line with a freshly computed checksum.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(self.data.len() + 5);
        bytes.push(self.data.len() as u8);
        bytes.extend_from_slice(&self.offset.to_be_bytes());
        bytes.push(self.record_type as u8);
        bytes.extend_from_slice(&self.data);
        bytes.push(checksum(&bytes));

        let mut line = String::with_capacity(1 + bytes.len() * 2);
        line.push(':');
        for b in bytes {
            line.push_str(&format!("{:02X}", b));
        }
        line
    }

    pub fn end_of_file() -> Self {
        Self::new(0, RecordType::EndOfFile, Vec::new())
    }

    pub fn extended_linear_address(segment: u16) -> Self {
        Self::new(
            0,
            RecordType::ExtendedLinearAddress,
            segment.to_be_bytes().to_vec(),
        )
    }
}

/// A record with its absolute address resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Absolute 32-bit address (extended address register + field address).
    pub address: u32,
    pub record_type: RecordType,
    pub payload: Vec<u8>,
    /// Byte count from the length field.
    pub declared_len: usize,
    /// Flavor of the enclosing universal-hex block, if any.
    pub flavor: Option<Flavor>,
}

impl HexRecord {
    pub fn is_data(&self) -> bool {
        self.record_type.is_data()
    }

    /// Upper 16 bits of the absolute address.
    pub fn segment(&self) -> u16 {
        (self.address >> 16) as u16
    }

    /// Lower 16 bits of the absolute address.
    pub fn offset(&self) -> u16 {
        self.address as u16
    }

    /// Exclusive end address of the payload.
    pub fn end(&self) -> u32 {
        self.address.saturating_add(self.payload.len() as u32)
    }

    /// Line form of this record. Custom data is re-encoded as plain data.
    pub fn to_raw(&self) -> RawRecord {
        let record_type = if self.record_type == RecordType::CustomData {
            RecordType::Data
        } else {
            self.record_type
        };
        let offset = if self.is_data() { self.offset() } else { 0 };
        RawRecord::new(offset, record_type, self.payload.clone())
    }
}

/// Two's complement of the byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

fn decode_hex(text: &str) -> Result<Vec<u8>, RecordError> {
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_digit(c: u8) -> Result<u8, RecordError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(RecordError::InvalidDigit),
    }
}
