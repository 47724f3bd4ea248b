//! Simulated device for the partial flashing service.
//!
//! Models the device side of the protocol over an erased-flash memory
//! model: region queries, mode switching with a reboot, packet-number
//! checking and block commits. Replies are delivered through a
//! [`NotificationRouter`] like real notifications.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, trace};

use super::router::{NotificationRouter, PacketSink};
use super::traits::TransportError;
use crate::diff::{MAGIC_ADDRESSES, MAGIC_START};
use crate::hex::{AddressWindow, MemoryImage};
use crate::protocol::constants::*;
use crate::protocol::{Command, RegionInfo, Reply, WriteStatus};

/// Misbehavior switches.
#[derive(Debug, Clone, Default)]
pub struct SimBehavior {
    /// Start in application mode (reboot needed before transfer).
    pub start_in_application: bool,
    /// Never reply to anything.
    pub silent: bool,
    /// Never acknowledge blocks.
    pub mute_writes: bool,
    /// Answer every complete block with "retransmit".
    pub always_retransmit: bool,
    /// Drop the link right after TRANSMISSION_END.
    pub disconnect_after_end: bool,
}

/// Initial device contents.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub dal_hash: [u8; 8],
    pub embedded_hash: [u8; 8],
    pub program_hash: [u8; 8],
    pub program_region: AddressWindow,
    /// Pre-existing flash contents; absent bytes read as 0xFF.
    pub flash: MemoryImage,
    pub behavior: SimBehavior,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dal_hash: [0; 8],
            embedded_hash: [0; 8],
            program_hash: [0; 8],
            program_region: AddressWindow::new(0x1C000, 0x77000),
            flash: MemoryImage::new(),
            behavior: SimBehavior::default(),
        }
    }
}

#[derive(Debug, Default)]
struct BlockBuffer {
    offset: u16,
    segment: u16,
    data: Vec<Vec<u8>>,
    last_packet: Option<u8>,
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    in_application: bool,
    connected: bool,
    rebooting: bool,
    erased: bool,
    block: BlockBuffer,
    blocks_committed: usize,
    retransmits_sent: usize,
    end_received: bool,
    received: Vec<Command>,
}

pub struct SimulatedDevice {
    device_id: String,
    router: Arc<NotificationRouter>,
    state: Mutex<SimState>,
}

impl SimulatedDevice {
    pub fn new(router: Arc<NotificationRouter>, device_id: impl Into<String>, config: SimConfig) -> Arc<Self> {
        let in_application = config.behavior.start_in_application;
        Arc::new(Self {
            device_id: device_id.into(),
            router,
            state: Mutex::new(SimState {
                config,
                in_application,
                connected: true,
                rebooting: false,
                erased: false,
                block: BlockBuffer::default(),
                blocks_committed: 0,
                retransmits_sent: 0,
                end_received: false,
                received: Vec::new(),
            }),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flash(&self) -> MemoryImage {
        self.state().config.flash.clone()
    }

    pub fn program_hash(&self) -> [u8; 8] {
        self.state().config.program_hash
    }

    pub fn blocks_committed(&self) -> usize {
        self.state().blocks_committed
    }

    pub fn retransmits_sent(&self) -> usize {
        self.state().retransmits_sent
    }

    pub fn end_received(&self) -> bool {
        self.state().end_received
    }

    pub fn in_application(&self) -> bool {
        self.state().in_application
    }

    /// Every command received so far, decoded.
    pub fn received(&self) -> Vec<Command> {
        self.state().received.clone()
    }

    fn reply(&self, state: &SimState, reply: Reply) {
        if state.config.behavior.silent {
            return;
        }
        trace!(reply = ?reply, "Simulated device reply");
        self.router.deliver(&self.device_id, &reply.to_bytes());
    }

    fn region(&self, state: &SimState, region: u8) -> RegionInfo {
        let cfg = &state.config;
        let (start, end, hash) = match region {
            REGION_EMBEDDED => (0x0000_0000, 0x0001_8000, cfg.embedded_hash),
            REGION_DAL => (0x0001_8000, cfg.program_region.min, cfg.dal_hash),
            _ => (cfg.program_region.min, cfg.program_region.max, cfg.program_hash),
        };
        RegionInfo {
            region,
            start,
            end,
            hash,
        }
    }

    fn handle_write(&self, state: &mut SimState, offset: u16, packet: u8, data: Vec<u8>) {
        if !state.erased {
            let region = state.config.program_region;
            state.config.flash = state.config.flash.clip(AddressWindow::new(0, region.min));
            state.erased = true;
            debug!("Simulated device erased program region");
        }

        let slot = packet as usize % PACKETS_PER_BLOCK;
        if slot == 0 {
            state.block = BlockBuffer {
                offset,
                ..BlockBuffer::default()
            };
        } else if state.block.last_packet != Some(packet.wrapping_sub(1)) {
            debug!(packet, expected = ?state.block.last_packet.map(|p| p.wrapping_add(1)), "Out of order packet");
            state.block = BlockBuffer::default();
            state.retransmits_sent += 1;
            self.reply(state, Reply::Write(WriteStatus::Retransmit));
            return;
        }
        if slot == 1 {
            state.block.segment = offset;
        }
        state.block.last_packet = Some(packet);
        state.block.data.push(data);

        if slot == PACKETS_PER_BLOCK - 1 {
            if state.config.behavior.mute_writes {
                return;
            }
            if state.config.behavior.always_retransmit {
                state.block = BlockBuffer::default();
                state.retransmits_sent += 1;
                self.reply(state, Reply::Write(WriteStatus::Retransmit));
                return;
            }
            Self::commit(state);
            self.reply(state, Reply::Write(WriteStatus::Success));
        }
    }

    fn commit(state: &mut SimState) {
        let block = std::mem::take(&mut state.block);
        if block.data.is_empty() {
            return;
        }
        let mut address = ((block.segment as u32) << 16) | block.offset as u32;
        for data in &block.data {
            state.config.flash.write(address, data);
            address += data.len() as u32;
        }
        state.blocks_committed += 1;
    }

    /// Hash record following the marker, if the program carries one.
    fn program_hash_from_flash(flash: &MemoryImage) -> Option<[u8; 8]> {
        MAGIC_ADDRESSES.iter().find_map(|&marker| {
            let matches = (0..16).all(|i| flash.byte_at(marker + i as u32) == Some(MAGIC_START[i]));
            if !matches {
                return None;
            }
            let mut hash = [0u8; 8];
            for (i, b) in hash.iter_mut().enumerate() {
                *b = flash.byte_at(marker + 24 + i as u32)?;
            }
            Some(hash)
        })
    }

    fn handle(&self, state: &mut SimState, command: Command) {
        match command {
            Command::RegionInfo { region } => {
                let info = self.region(state, region);
                self.reply(state, Reply::Region(info));
            }
            Command::Status => {
                let mode = if state.in_application {
                    MODE_APPLICATION
                } else {
                    MODE_PAIRING
                };
                self.reply(state, Reply::Status {
                    version: Some(0x01),
                    mode,
                });
            }
            Command::Reboot { mode } => {
                info!(mode, "Simulated device rebooting");
                state.in_application = mode == MODE_APPLICATION;
                state.connected = false;
                state.rebooting = true;
            }
            Command::Write {
                offset,
                packet,
                data,
            } => self.handle_write(state, offset, packet, data),
            Command::TransmissionEnd => {
                Self::commit(state);
                state.end_received = true;
                if let Some(hash) = Self::program_hash_from_flash(&state.config.flash) {
                    state.config.program_hash = hash;
                }
                state.in_application = true;
                if state.config.behavior.disconnect_after_end {
                    state.connected = false;
                }
                info!(blocks = state.blocks_committed, "Simulated device finished transfer");
            }
        }
    }
}

impl PacketSink for SimulatedDevice {
    fn send(&self, device_id: &str, data: &[u8]) -> Result<(), TransportError> {
        if device_id != self.device_id {
            return Err(TransportError::DeviceNotFound(device_id.to_string()));
        }
        let mut state = self.state();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let command = Command::from_bytes(data).map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        state.received.push(command.clone());
        self.handle(&mut state, command);
        Ok(())
    }

    fn is_connected(&self, _device_id: &str) -> bool {
        self.state().connected
    }

    fn wait_for_reconnect(&self, _device_id: &str, timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.rebooting || state.connected {
            state.rebooting = false;
            state.connected = true;
            return Ok(());
        }
        Err(TransportError::ReconnectTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FlashChannel, RoutedChannel};

    fn setup(behavior: SimBehavior) -> (Arc<SimulatedDevice>, RoutedChannel) {
        let router = NotificationRouter::new();
        let config = SimConfig {
            dal_hash: [0xD1; 8],
            behavior,
            ..SimConfig::default()
        };
        let device = SimulatedDevice::new(router.clone(), "sim", config);
        let channel = RoutedChannel::open(router, device.clone(), "sim");
        (device, channel)
    }

    fn wait() -> Duration {
        Duration::from_millis(20)
    }

    #[test]
    fn test_region_query() {
        let (_device, channel) = setup(SimBehavior::default());
        channel.write(&Command::RegionInfo { region: REGION_DAL }.to_bytes()).unwrap();
        match Reply::parse(&channel.recv(wait()).unwrap()).unwrap() {
            Reply::Region(info) => {
                assert_eq!(info.region, REGION_DAL);
                assert_eq!(info.hash, [0xD1; 8]);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_reboot_disconnects_until_reconnect() {
        let (device, channel) = setup(SimBehavior {
            start_in_application: true,
            ..SimBehavior::default()
        });
        channel.write(&Command::Reboot { mode: MODE_PAIRING }.to_bytes()).unwrap();
        assert!(!channel.is_connected());
        assert!(channel.write(&[CMD_STATUS]).is_err());
        channel.reconnect(wait()).unwrap();
        assert!(channel.is_connected());
        assert!(!device.in_application());
    }

    #[test]
    fn test_block_commit_and_ack() {
        let (device, channel) = setup(SimBehavior::default());
        let offsets = [0xC000u16, 0x0001, 0xC020, 0xC030];
        for (i, offset) in offsets.iter().enumerate() {
            let cmd = Command::write(*offset, i as u8, &[i as u8; 16]).unwrap();
            channel.write(&cmd.to_bytes()).unwrap();
        }
        assert_eq!(
            Reply::parse(&channel.recv(wait()).unwrap()).unwrap(),
            Reply::Write(WriteStatus::Success)
        );
        let flash = device.flash();
        assert_eq!(flash.byte_at(0x1C000), Some(0));
        assert_eq!(flash.byte_at(0x1C010), Some(1));
        assert_eq!(flash.byte_at(0x1C030), Some(3));
        assert_eq!(device.blocks_committed(), 1);
    }

    #[test]
    fn test_out_of_order_packet_requests_retransmit() {
        let (device, channel) = setup(SimBehavior::default());
        channel.write(&Command::write(0xC000, 0, &[0; 16]).unwrap().to_bytes()).unwrap();
        channel.write(&Command::write(0x0001, 2, &[0; 16]).unwrap().to_bytes()).unwrap();
        assert_eq!(
            Reply::parse(&channel.recv(wait()).unwrap()).unwrap(),
            Reply::Write(WriteStatus::Retransmit)
        );
        assert_eq!(device.retransmits_sent(), 1);
    }

    #[test]
    fn test_silent_device() {
        let (_device, channel) = setup(SimBehavior {
            silent: true,
            ..SimBehavior::default()
        });
        channel.write(&[CMD_STATUS]).unwrap();
        assert!(matches!(
            channel.recv(wait()),
            Err(TransportError::Timeout { .. })
        ));
    }
}
