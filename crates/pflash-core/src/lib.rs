//! pflash-core: partial flashing for Calliope mini / micro:bit over BLE.
//!
//! Only the part of a program that changed is sent to the device; when
//! that is not possible the complete image is handed to a full update.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Hex**: Intel HEX records, parsing, memory images, region filtering
//! - **Diff**: marker/hash lookup and the chunk sequence to send
//! - **Variant**: per-hardware-generation profiles
//! - **Protocol**: command/reply encoding and blocks
//! - **Transport**: channel abstraction (routed notifications, mock, simulator)
//! - **State**: handshake handlers and the synchronous block engine
//! - **Pipeline**: windowed block engine
//! - **Fallback**: hand-off to the full-image update
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use pflash_core::fallback::DryRunUpdater;
//! use pflash_core::session::{FirmwareSource, PartialFlasher, SessionConfig};
//! use pflash_core::state::CancelToken;
//! use pflash_core::transport::MockChannel;
//! use pflash_core::variant::{HardwareVariant, Service};
//!
//! let source = FirmwareSource::load("program.hex").expect("unreadable file");
//! let flasher = PartialFlasher::new(SessionConfig::default());
//! let channel = MockChannel::new();
//! let mut updater = DryRunUpdater::new();
//!
//! let outcome = flasher.flash(
//!     &source,
//!     HardwareVariant::V3,
//!     &[Service::SecureDfu, Service::PartialFlashing],
//!     &channel,
//!     &mut updater,
//!     CancelToken::new(),
//! );
//! println!("{}", outcome.message());
//! ```

pub mod diff;
pub mod error;
pub mod events;
pub mod fallback;
pub mod hex;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod variant;

// Re-exports for convenience
pub use diff::{DiffChunk, DiffExtractor, HashPair, PartialFlashInfo};
pub use error::{Disposition, PartialFlashError};
pub use events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, NullObserver, TracingObserver};
pub use fallback::{DfuState, DryRunUpdater, FallbackCoordinator, FullImageUpdater};
pub use hex::{HexRecord, HexVersion, MemoryImage, ParsedHex, UniversalHexRegionFilter};
pub use pipeline::PipelinedFlashTransport;
pub use session::{FirmwareSource, FlashOutcome, PartialFlasher, SessionConfig, Strategy};
pub use state::{CancelToken, FlashProtocolStateMachine, FlashReport, TransferSession};
pub use transport::{FlashChannel, MockChannel, NotificationRouter, RoutedChannel, TransportError};
pub use variant::{FlashTarget, HardwareVariant, Service};
