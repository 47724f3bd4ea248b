//! Partial flashing wire protocol constants.
//!
//! One characteristic carries commands (write) and replies (notify). Every
//! reply starts with the byte of the command it answers.

// ============================================================================
// Commands
// ============================================================================

/// Query a region's bounds and hash.
pub const CMD_REGION_INFO: u8 = 0x00;
/// Write one chunk.
pub const CMD_FLASH_DATA: u8 = 0x01;
/// End of transmission.
pub const CMD_TRANSMISSION_END: u8 = 0x02;
/// Query the device mode.
pub const CMD_STATUS: u8 = 0xEE;
/// Reboot into a mode.
pub const CMD_REBOOT: u8 = 0xFF;

// ============================================================================
// Regions
// ============================================================================

/// Soft device / bootloader region.
pub const REGION_EMBEDDED: u8 = 0x00;
/// Baseline runtime (DAL) region.
pub const REGION_DAL: u8 = 0x01;
/// User program region.
pub const REGION_PROGRAM: u8 = 0x02;

// ============================================================================
// Modes and write status
// ============================================================================

/// Reboot into the partial-flashing (transfer capable) mode.
pub const MODE_PAIRING: u8 = 0x00;
/// Device is running the user application.
pub const MODE_APPLICATION: u8 = 0x01;

pub const WRITE_SUCCESS: u8 = 0xFF;
pub const WRITE_RETRANSMIT: u8 = 0xAA;

// ============================================================================
// Sizes
// ============================================================================

/// Chunks per block; one acknowledgment per block.
pub const PACKETS_PER_BLOCK: usize = 4;
/// Maximum payload bytes per WRITE packet.
pub const PACKET_PAYLOAD_SIZE: usize = 16;
/// WRITE header: command, 16-bit offset, packet number.
pub const WRITE_HEADER_SIZE: usize = 4;
/// Length of a region hash.
pub const REGION_HASH_SIZE: usize = 8;
/// Full REGION reply: command, region, start, end, hash.
pub const REGION_REPLY_SIZE: usize = 2 + 4 + 4 + REGION_HASH_SIZE;
