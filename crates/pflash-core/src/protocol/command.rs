//! Host-to-device commands.

use std::fmt;

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command 0x{0:02X}")]
    Unknown(u8),
    #[error("Command 0x{command:02X} truncated: {len} bytes")]
    Truncated { command: u8, len: usize },
    #[error("Payload of {0} bytes exceeds packet size")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RegionInfo { region: u8 },
    Status,
    Reboot { mode: u8 },
    Write {
        offset: u16,
        packet: u8,
        data: Vec<u8>,
    },
    TransmissionEnd,
}

impl Command {
    pub fn write(offset: u16, packet: u8, data: &[u8]) -> Result<Self, CommandError> {
        if data.len() > PACKET_PAYLOAD_SIZE {
            return Err(CommandError::PayloadTooLarge(data.len()));
        }
        Ok(Command::Write {
            offset,
            packet,
            data: data.to_vec(),
        })
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::RegionInfo { .. } => CMD_REGION_INFO,
            Command::Status => CMD_STATUS,
            Command::Reboot { .. } => CMD_REBOOT,
            Command::Write { .. } => CMD_FLASH_DATA,
            Command::TransmissionEnd => CMD_TRANSMISSION_END,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Command::RegionInfo { region } => vec![CMD_REGION_INFO, *region],
            Command::Status => vec![CMD_STATUS],
            Command::Reboot { mode } => vec![CMD_REBOOT, *mode],
            Command::Write {
                offset,
                packet,
                data,
            } => {
                let mut buf = Vec::with_capacity(WRITE_HEADER_SIZE + data.len());
                buf.push(CMD_FLASH_DATA);
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.push(*packet);
                buf.extend_from_slice(data);
                buf
            }
            Command::TransmissionEnd => vec![CMD_TRANSMISSION_END],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommandError> {
        let (&opcode, rest) = bytes.split_first().ok_or(CommandError::Empty)?;
        let truncated = || CommandError::Truncated {
            command: opcode,
            len: bytes.len(),
        };
        match opcode {
            CMD_REGION_INFO => rest
                .first()
                .map(|r| Command::RegionInfo { region: *r })
                .ok_or_else(truncated),
            CMD_STATUS => Ok(Command::Status),
            CMD_REBOOT => rest
                .first()
                .map(|m| Command::Reboot { mode: *m })
                .ok_or_else(truncated),
            CMD_FLASH_DATA => {
                let mut cursor = Cursor::new(rest);
                let offset = cursor.read_u16::<BigEndian>().map_err(|_| truncated())?;
                let packet = cursor.read_u8().map_err(|_| truncated())?;
                let data = rest[3..].to_vec();
                if data.len() > PACKET_PAYLOAD_SIZE {
                    return Err(CommandError::PayloadTooLarge(data.len()));
                }
                Ok(Command::Write {
                    offset,
                    packet,
                    data,
                })
            }
            CMD_TRANSMISSION_END => Ok(Command::TransmissionEnd),
            other => Err(CommandError::Unknown(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::RegionInfo { region } => write!(f, "REGION({})", region),
            Command::Status => write!(f, "STATUS"),
            Command::Reboot { mode } => write!(f, "REBOOT({})", mode),
            Command::Write {
                offset, packet, ..
            } => write!(f, "WRITE(#{} @0x{:04X})", packet, offset),
            Command::TransmissionEnd => write!(f, "TRANSMISSION_END"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding() {
        assert_eq!(Command::RegionInfo { region: REGION_DAL }.to_bytes(), vec![0x00, 0x01]);
        assert_eq!(Command::Status.to_bytes(), vec![0xEE]);
        assert_eq!(Command::Reboot { mode: MODE_PAIRING }.to_bytes(), vec![0xFF, 0x00]);
        assert_eq!(Command::TransmissionEnd.to_bytes(), vec![0x02]);

        let write = Command::write(0x1234, 7, &[0xAA, 0xBB]).unwrap();
        assert_eq!(write.to_bytes(), vec![0x01, 0x12, 0x34, 0x07, 0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_write() {
        let cmd = Command::from_bytes(&[0x01, 0xF0, 0x00, 0x02, 1, 2, 3]).unwrap();
        assert_eq!(
            cmd,
            Command::Write {
                offset: 0xF000,
                packet: 2,
                data: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(Command::from_bytes(&[]), Err(CommandError::Empty));
        assert_eq!(Command::from_bytes(&[0x42]), Err(CommandError::Unknown(0x42)));
        assert!(matches!(
            Command::from_bytes(&[0x01, 0x00]),
            Err(CommandError::Truncated { .. })
        ));
        assert_eq!(
            Command::write(0, 0, &[0; 17]),
            Err(CommandError::PayloadTooLarge(17))
        );
    }
}
