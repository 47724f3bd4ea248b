//! Init packets for the full-image update.

use crc::{CRC_16_IBM_3740, Crc};

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
    CRC.checksum(data)
}

/// Legacy DFU init packet (V1/V2 boards).
///
/// Little-endian: device type, device revision, application version,
/// soft device count, soft device id, CRC-16 of the binary.
pub fn legacy_init_packet(bin: &[u8]) -> Vec<u8> {
    const DEVICE_TYPE: u16 = 0xFFFF;
    const DEVICE_REVISION: u16 = 0xFFFF;
    const APPLICATION_VERSION: u32 = 0xFFFF_FFFF;
    const SOFTDEVICE_COUNT: u16 = 0x0001;
    const SOFTDEVICE: u16 = 0x0064;

    let mut packet = Vec::with_capacity(14);
    packet.extend_from_slice(&DEVICE_TYPE.to_le_bytes());
    packet.extend_from_slice(&DEVICE_REVISION.to_le_bytes());
    packet.extend_from_slice(&APPLICATION_VERSION.to_le_bytes());
    packet.extend_from_slice(&SOFTDEVICE_COUNT.to_le_bytes());
    packet.extend_from_slice(&SOFTDEVICE.to_le_bytes());
    packet.extend_from_slice(&crc16(bin).to_le_bytes());
    packet
}

/// Secure DFU init packet (V3 boards), unsigned and without hash.
pub fn secure_init_packet(bin: &[u8]) -> Vec<u8> {
    const FIRMWARE_VERSION: &[u8] = b"microbit_app";
    const HARDWARE_VERSION: u32 = 1;
    const HASH_SIZE: u32 = 0;

    let mut packet = Vec::with_capacity(FIRMWARE_VERSION.len() + 12 + 32);
    packet.extend_from_slice(FIRMWARE_VERSION);
    packet.extend_from_slice(&HARDWARE_VERSION.to_le_bytes());
    packet.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    packet.extend_from_slice(&HASH_SIZE.to_be_bytes());
    packet.extend_from_slice(&[0u8; 32]);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, ReadBytesExt};
    use std::io::Cursor;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_legacy_layout() {
        let bin = b"123456789";
        let packet = legacy_init_packet(bin);
        assert_eq!(packet.len(), 14);

        let mut cursor = Cursor::new(&packet);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 0xFFFF);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 0xFFFF);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 0xFFFF_FFFF);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 0x0064);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 0x29B1);
    }

    #[test]
    fn test_secure_layout() {
        let packet = secure_init_packet(&[0u8; 0x1234]);
        assert_eq!(&packet[..12], b"microbit_app");
        assert_eq!(&packet[12..16], &1u32.to_le_bytes());
        assert_eq!(&packet[16..20], &0x1234u32.to_le_bytes());
        assert_eq!(&packet[20..24], &[0, 0, 0, 0]);
        assert_eq!(packet.len(), 24 + 32);
    }
}
