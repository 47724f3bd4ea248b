//! Device-to-host notifications.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    #[error("Empty notification")]
    Empty,
    #[error("Truncated reply to 0x{command:02X}: expected {expected} bytes, got {actual}")]
    Truncated {
        command: u8,
        expected: usize,
        actual: usize,
    },
}

/// Region facts as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub region: u8,
    pub start: u32,
    pub end: u32,
    pub hash: [u8; REGION_HASH_SIZE],
}

impl RegionInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REGION_REPLY_SIZE);
        buf.push(CMD_REGION_INFO);
        buf.push(self.region);
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.end.to_le_bytes());
        buf.extend_from_slice(&self.hash);
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    Retransmit,
    Other(u8),
}

impl WriteStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            WRITE_SUCCESS => Self::Success,
            WRITE_RETRANSMIT => Self::Retransmit,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Success => WRITE_SUCCESS,
            Self::Retransmit => WRITE_RETRANSMIT,
            Self::Other(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Region(RegionInfo),
    Status { version: Option<u8>, mode: u8 },
    Write(WriteStatus),
    /// Anything the host does not act on.
    Unknown(Vec<u8>),
}

impl Reply {
    pub fn parse(bytes: &[u8]) -> Result<Self, ReplyError> {
        let (&command, rest) = bytes.split_first().ok_or(ReplyError::Empty)?;
        match command {
            CMD_REGION_INFO => {
                if bytes.len() < REGION_REPLY_SIZE {
                    return Err(ReplyError::Truncated {
                        command,
                        expected: REGION_REPLY_SIZE,
                        actual: bytes.len(),
                    });
                }
                let mut cursor = Cursor::new(rest);
                let region = cursor.read_u8().map_err(|_| truncated(command, bytes))?;
                let start = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated(command, bytes))?;
                let end = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated(command, bytes))?;
                let mut hash = [0u8; REGION_HASH_SIZE];
                hash.copy_from_slice(&bytes[10..10 + REGION_HASH_SIZE]);
                Ok(Reply::Region(RegionInfo {
                    region,
                    start,
                    end,
                    hash,
                }))
            }
            CMD_STATUS => match rest {
                [version, mode, ..] => Ok(Reply::Status {
                    version: Some(*version),
                    mode: *mode,
                }),
                [mode] => Ok(Reply::Status {
                    version: None,
                    mode: *mode,
                }),
                [] => Err(truncated(command, bytes)),
            },
            CMD_FLASH_DATA => rest
                .first()
                .map(|s| Reply::Write(WriteStatus::from_u8(*s)))
                .ok_or_else(|| truncated(command, bytes)),
            _ => Ok(Reply::Unknown(bytes.to_vec())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Reply::Region(info) => info.to_bytes(),
            Reply::Status { version, mode } => match version {
                Some(v) => vec![CMD_STATUS, *v, *mode],
                None => vec![CMD_STATUS, *mode],
            },
            Reply::Write(status) => vec![CMD_FLASH_DATA, status.as_u8()],
            Reply::Unknown(raw) => raw.clone(),
        }
    }
}

fn truncated(command: u8, bytes: &[u8]) -> ReplyError {
    let expected = match command {
        CMD_REGION_INFO => REGION_REPLY_SIZE,
        _ => 2,
    };
    ReplyError::Truncated {
        command,
        expected,
        actual: bytes.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_region_reply() {
        let mut bytes = vec![0x00, 0x01];
        bytes.extend_from_slice(&0x0001_8000u32.to_le_bytes());
        bytes.extend_from_slice(&0x0003_C000u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let reply = Reply::parse(&bytes).unwrap();
        assert_eq!(
            reply,
            Reply::Region(RegionInfo {
                region: REGION_DAL,
                start: 0x18000,
                end: 0x3C000,
                hash: [1, 2, 3, 4, 5, 6, 7, 8],
            })
        );
        assert_eq!(reply.to_bytes(), bytes);
    }

    #[test]
    fn test_truncated_region_reply() {
        let err = Reply::parse(&[0x00, 0x01, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            ReplyError::Truncated {
                command: 0x00,
                expected: REGION_REPLY_SIZE,
                actual: 4
            }
        );
    }

    #[test]
    fn test_parse_status_forms() {
        assert_eq!(
            Reply::parse(&[0xEE, 0x03, 0x01]).unwrap(),
            Reply::Status {
                version: Some(3),
                mode: MODE_APPLICATION
            }
        );
        assert_eq!(
            Reply::parse(&[0xEE, 0x00]).unwrap(),
            Reply::Status {
                version: None,
                mode: MODE_PAIRING
            }
        );
        assert!(Reply::parse(&[0xEE]).is_err());
    }

    #[test]
    fn test_parse_write_status() {
        assert_eq!(
            Reply::parse(&[0x01, 0xFF]).unwrap(),
            Reply::Write(WriteStatus::Success)
        );
        assert_eq!(
            Reply::parse(&[0x01, 0xAA]).unwrap(),
            Reply::Write(WriteStatus::Retransmit)
        );
        assert_eq!(
            Reply::parse(&[0x01, 0x10]).unwrap(),
            Reply::Write(WriteStatus::Other(0x10))
        );
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(Reply::parse(&[0x02]).unwrap(), Reply::Unknown(vec![0x02]));
        assert_eq!(Reply::parse(&[]), Err(ReplyError::Empty));
    }
}
