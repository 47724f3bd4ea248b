//! Hand-off to the full-image update.
//!
//! The full update itself (legacy or secure DFU) lives outside this crate
//! behind [`FullImageUpdater`]. [`FallbackCoordinator`] builds the image
//! for the variant, drives the updater and relays its lifecycle upward as
//! [`FlashEvent::FullUpdate`] events.

pub mod init_packet;

use std::fmt;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::{info, warn};

use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::hex::HexRecord;
use crate::variant::{FirmwarePackage, FlashTarget, VariantError};

/// Lifecycle of a full-image update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuState {
    Starting,
    /// Percentage, 0-100.
    Progress(u8),
    Completed,
    Aborted,
    Error(String),
}

impl DfuState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DfuState::Completed | DfuState::Aborted | DfuState::Error(_))
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::Starting => write!(f, "starting"),
            DfuState::Progress(p) => write!(f, "{}%", p),
            DfuState::Completed => write!(f, "completed"),
            DfuState::Aborted => write!(f, "aborted"),
            DfuState::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("No firmware image for fallback: {0}")]
    NoImage(#[from] VariantError),

    #[error("Full update could not start: {0}")]
    StartFailed(String),
}

/// Callback contract of the full-update component.
pub trait DfuStatusListener: Send + Sync {
    fn on_state(&self, state: &DfuState);
}

/// External full-image update component.
pub trait FullImageUpdater {
    /// Start the update; lifecycle states go to `listener`.
    fn start(
        &mut self,
        package: &FirmwarePackage,
        listener: &dyn DfuStatusListener,
    ) -> Result<(), UpdateError>;
}

/// Relays full-update states to the observer and remembers the last one.
pub struct FallbackCoordinator<'a, O: FlashObserver> {
    observer: &'a O,
    last: Mutex<Option<DfuState>>,
}

impl<'a, O: FlashObserver> FallbackCoordinator<'a, O> {
    pub fn new(observer: &'a O) -> Self {
        Self {
            observer,
            last: Mutex::new(None),
        }
    }

    pub fn last_state(&self) -> Option<DfuState> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Abandon partial flashing and run the full update for `target`.
    pub fn engage<T: FlashTarget + fmt::Display>(
        &self,
        reason: &str,
        target: &T,
        records: &[HexRecord],
        updater: &mut dyn FullImageUpdater,
    ) -> Result<DfuState, UpdateError> {
        info!(reason, target = %target, "Engaging full update");
        self.observer.on_event(&FlashEvent::FallbackEngaged {
            reason: reason.to_string(),
        });
        self.observer.on_event(&FlashEvent::PhaseChanged {
            from: FlashPhase::Handshake,
            to: FlashPhase::FullUpdate,
        });

        let package = target.full_image(records)?;
        info!(
            bin_len = package.bin.len(),
            init_packet_len = package.init_packet.len(),
            "Full image prepared"
        );
        updater.start(&package, self)?;

        Ok(self.last_state().unwrap_or(DfuState::Starting))
    }
}

impl<O: FlashObserver> DfuStatusListener for FallbackCoordinator<'_, O> {
    fn on_state(&self, state: &DfuState) {
        if let DfuState::Error(msg) = state {
            warn!(error = %msg, "Full update failed");
        }
        if let DfuState::Progress(p) = state {
            self.observer.on_event(&FlashEvent::Progress {
                phase: FlashPhase::FullUpdate,
                current: *p as u64,
                total: 100,
            });
        }
        self.observer.on_event(&FlashEvent::FullUpdate(state.clone()));
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
    }
}

/// Updater that accepts the package and reports an instant success.
///
/// Used by the simulator front-end and by tests; it keeps what it was
/// given.
#[derive(Debug, Default)]
pub struct DryRunUpdater {
    pub packages: Vec<FirmwarePackage>,
}

impl DryRunUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_package(&self) -> Option<&FirmwarePackage> {
        self.packages.last()
    }
}

impl FullImageUpdater for DryRunUpdater {
    fn start(
        &mut self,
        package: &FirmwarePackage,
        listener: &dyn DfuStatusListener,
    ) -> Result<(), UpdateError> {
        listener.on_state(&DfuState::Starting);
        for p in [25, 50, 75, 100] {
            listener.on_state(&DfuState::Progress(p));
        }
        self.packages.push(package.clone());
        listener.on_state(&DfuState::Completed);
        Ok(())
    }
}
