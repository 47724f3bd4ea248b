//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to follow a flashing attempt without
//! tight coupling to the core logic.

use std::fmt;

use crate::fallback::DfuState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Coarse phases of one flashing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Reading and filtering the image.
    Preparing,
    /// Region and mode queries.
    Handshake,
    /// Waiting for the device to come back in transfer mode.
    ModeSwitch,
    /// Block transfer in progress.
    Transfer,
    /// Full-image update through the collaborator.
    FullUpdate,
    Complete,
    Cancelled,
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Preparing => write!(f, "Preparing"),
            FlashPhase::Handshake => write!(f, "Handshake"),
            FlashPhase::ModeSwitch => write!(f, "Mode Switch"),
            FlashPhase::Transfer => write!(f, "Transfer"),
            FlashPhase::FullUpdate => write!(f, "Full Update"),
            FlashPhase::Complete => write!(f, "Complete"),
            FlashPhase::Cancelled => write!(f, "Cancelled"),
            FlashPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted while flashing.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// Protocol state machine transition.
    StateChanged { from: String, to: String },
    /// Progress update for current operation.
    Progress {
        phase: FlashPhase,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Reply received from the device.
    ReplyReceived { reply: String },
    /// Partial flashing gave up; the full update takes over.
    FallbackEngaged { reason: String },
    /// Lifecycle of the full-image update.
    FullUpdate(DfuState),
    /// Packet sent/received.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Attempt finished successfully.
    Complete,
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Percentage (0-100) of `current` out of `total`.
pub fn percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((current.min(total) * 100) / total) as u8
}

/// Observer trait for receiving flashing events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            FlashEvent::Progress {
                phase,
                current,
                total,
            } => {
                tracing::debug!(
                    phase = %phase,
                    progress = %format!("{}%", percent(*current, *total)),
                    "Progress"
                );
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::ReplyReceived { reply } => {
                tracing::debug!(reply = %reply, "Reply received");
            }
            FlashEvent::FallbackEngaged { reason } => {
                tracing::warn!(reason = %reason, "Falling back to full update");
            }
            FlashEvent::FullUpdate(state) => {
                tracing::info!(state = %state, "Full update");
            }
            FlashEvent::Packet {
                direction,
                packet_type,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %packet_type,
                    len = length,
                    "Packet"
                );
            }
            FlashEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}
