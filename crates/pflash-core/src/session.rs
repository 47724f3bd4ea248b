//! High-level orchestrator for one flashing attempt.
//!
//! Reads the image, decides between partial flashing and the full update,
//! runs the protocol engine and maps every failure to one terminal
//! [`FlashOutcome`].

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::diff::PartialFlashInfo;
use crate::error::{Disposition, PartialFlashError};
use crate::events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, PacketDirection, TracingObserver};
use crate::fallback::{DfuState, FallbackCoordinator, FullImageUpdater};
use crate::hex::{FilterCache, HexRecord, HexVersion, ParsedHex, SourceId, detect_versions};
use crate::pipeline::PipelinedFlashTransport;
use crate::state::{
    CancelToken, FlashProtocolStateMachine, FlashReport, FlashState, HandlerContext,
    TransferParams, TransferSession, run_attempt,
};
use crate::transport::{FlashChannel, TransportError};
use crate::variant::{FlashTarget, HardwareVariant, Service};

/// Which block engine runs the transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One block at a time.
    Synchronous,
    /// Sliding window of `window_size` blocks.
    #[default]
    Pipelined,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Synchronous => write!(f, "synchronous"),
            Strategy::Pipelined => write!(f, "pipelined"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(Strategy::Synchronous),
            "pipelined" | "pipeline" => Ok(Strategy::Pipelined),
            other => Err(anyhow!("Unknown strategy: {}", other)),
        }
    }
}

/// Configuration for flashing sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// User setting; off means always run the full update.
    pub partial_flashing_enabled: bool,
    pub strategy: Strategy,
    /// Blocks in flight (pipelined only).
    pub window_size: usize,
    /// Retransmissions of one block before falling back.
    pub max_retries: usize,
    pub ack_timeout_ms: u64,
    pub session_timeout_secs: u64,
    /// Wait for the device after the mode-switch reboot.
    pub reconnect_timeout_ms: u64,
    /// Grace delay after TRANSMISSION_END.
    pub end_grace_ms: u64,
    /// Chunk ceiling before the diff counts as too large.
    pub max_chunks: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            partial_flashing_enabled: true,
            strategy: Strategy::Pipelined,
            window_size: 1,
            max_retries: 3,
            ack_timeout_ms: 5000,
            session_timeout_secs: 120,
            reconnect_timeout_ms: 10_000,
            end_grace_ms: 50,
            max_chunks: crate::diff::MAX_DIFF_CHUNKS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn params(&self) -> TransferParams {
        TransferParams {
            window_size: match self.strategy {
                Strategy::Synchronous => 1,
                Strategy::Pipelined => self.window_size.max(1),
            },
            max_retries: self.max_retries,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            reconnect_timeout: Duration::from_millis(self.reconnect_timeout_ms),
            end_grace: Duration::from_millis(self.end_grace_ms),
        }
    }
}

/// A parsed image and what is known about it.
#[derive(Debug, Clone)]
pub struct FirmwareSource {
    pub id: SourceId,
    pub records: Arc<Vec<HexRecord>>,
    pub versions: BTreeSet<HexVersion>,
    /// Why parsing stopped early, if it did.
    pub parse_error: Option<String>,
}

impl FirmwareSource {
    /// Read a HEX file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading HEX file");
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::from_text(SourceId::from_bytes(text.as_bytes()), &text))
    }

    pub fn from_text(id: SourceId, text: &str) -> Self {
        let versions = detect_versions(text.as_bytes());
        let parsed = ParsedHex::parse_text(text);
        let parse_error = parsed.error.as_ref().map(|e| e.to_string());
        if let Some(err) = &parse_error {
            warn!(source = %id, error = %err, "HEX parsing stopped early");
        }
        Self {
            id,
            records: Arc::new(parsed.records),
            versions,
            parse_error,
        }
    }

    pub fn has_data(&self) -> bool {
        self.records.iter().any(HexRecord::is_data)
    }
}

/// Terminal outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    Completed {
        blocks: usize,
        chunks: usize,
        already_current: bool,
    },
    FallbackEngaged {
        reason: String,
        full_update: DfuState,
    },
    Cancelled,
    Failed {
        reason: String,
    },
}

impl FlashOutcome {
    /// Message for display.
    pub fn message(&self) -> String {
        match self {
            FlashOutcome::Completed {
                already_current: true,
                ..
            } => "Device already runs this program".to_string(),
            FlashOutcome::Completed { blocks, chunks, .. } => {
                format!("Partial flashing complete: {} chunks in {} blocks", chunks, blocks)
            }
            FlashOutcome::FallbackEngaged {
                reason,
                full_update,
            } => format!("Full update ({}) after: {}", full_update, reason),
            FlashOutcome::Cancelled => "Cancelled".to_string(),
            FlashOutcome::Failed { reason } => format!("Failed: {}", reason),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            FlashOutcome::Completed { .. } => true,
            FlashOutcome::FallbackEngaged { full_update, .. } => {
                *full_update == DfuState::Completed
            }
            _ => false,
        }
    }
}

/// Runs flashing attempts against connected devices.
pub struct PartialFlasher<O: FlashObserver> {
    config: SessionConfig,
    observer: Arc<O>,
    cache: Arc<FilterCache>,
}

impl PartialFlasher<TracingObserver> {
    /// Create a flasher with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: FlashObserver> PartialFlasher<O> {
    /// Create a flasher with a custom observer.
    pub fn with_observer(config: SessionConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            cache: Arc::new(FilterCache::new()),
        }
    }

    /// Share a filter cache with other flashers.
    pub fn with_cache(mut self, cache: Arc<FilterCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FilterCache> {
        &self.cache
    }

    fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    /// Diff information for `variant`, or why there is none.
    pub fn prepare(
        &self,
        source: &FirmwareSource,
        variant: HardwareVariant,
    ) -> Result<PartialFlashInfo, PartialFlashError> {
        let filtered = self
            .cache
            .get_or_filter(&source.id, &variant.region_filter(), &source.records);
        let info = variant
            .diff_extractor()
            .with_max_chunks(self.config.max_chunks)
            .extract_with_filtered(Arc::clone(&source.records), Some(filtered))?;
        Ok(info)
    }

    /// Flash `source` to the device behind `channel`.
    #[instrument(skip_all, fields(device = %channel.device_id(), variant = %variant))]
    pub fn flash<C: FlashChannel>(
        &self,
        source: &FirmwareSource,
        variant: HardwareVariant,
        services: &[Service],
        channel: &C,
        updater: &mut dyn FullImageUpdater,
        cancel: CancelToken,
    ) -> FlashOutcome {
        let started = Instant::now();

        if !variant.accepts(&source.versions) {
            let reason = format!("{} cannot run this file", variant);
            warn!(versions = ?source.versions, "{}", reason);
            return self.fail(reason);
        }
        if !source.has_data() {
            let reason = PartialFlashError::MalformedImage(
                source
                    .parse_error
                    .clone()
                    .unwrap_or_else(|| "no data records".to_string()),
            )
            .to_string();
            return self.fail(reason);
        }

        if !self.config.partial_flashing_enabled {
            return self.fall_back("partial flashing disabled", variant, source, updater);
        }
        if !variant.supports_partial_flashing(services) {
            return self.fall_back(
                "device has no partial flashing service",
                variant,
                source,
                updater,
            );
        }

        let info = match self.prepare(source, variant) {
            Ok(info) => info,
            Err(err) => return self.handle_failure(err, variant, source, updater),
        };

        let mut session = TransferSession::new(self.config.params(), cancel);
        let chunks = info.collect_chunks();
        let observed = ObservableChannel {
            inner: channel,
            observer: self.observer.as_ref(),
        };
        self.emit(FlashEvent::PhaseChanged {
            from: FlashPhase::Preparing,
            to: FlashPhase::Handshake,
        });

        let result = {
            let mut ctx = HandlerContext::new(
                &observed,
                self.observer.as_ref(),
                &mut session,
                info.hashes(),
            );
            match self.config.strategy {
                Strategy::Synchronous => run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks),
                Strategy::Pipelined => run_attempt(&PipelinedFlashTransport, &mut ctx, &chunks),
            }
        };
        session.flags.transfer_active = false;

        match result {
            Ok(report) => {
                self.log_report(&report, started);
                self.emit(FlashEvent::PhaseChanged {
                    from: FlashPhase::Transfer,
                    to: FlashPhase::Complete,
                });
                FlashOutcome::Completed {
                    blocks: report.blocks,
                    chunks: report.chunks,
                    already_current: report.already_current,
                }
            }
            Err(err) => {
                if err.disposition() == Disposition::Cancel {
                    session.goto_state(FlashState::Aborted);
                } else {
                    session.goto_state(FlashState::FallingBack);
                }
                self.handle_failure(err, variant, source, updater)
            }
        }
    }

    fn log_report(&self, report: &FlashReport, started: Instant) {
        info!(
            blocks = report.blocks,
            chunks = report.chunks,
            sent = report.blocks_sent,
            retries = report.total_retries,
            peak_in_flight = report.peak_in_flight,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Partial flashing finished"
        );
    }

    fn handle_failure(
        &self,
        err: PartialFlashError,
        variant: HardwareVariant,
        source: &FirmwareSource,
        updater: &mut dyn FullImageUpdater,
    ) -> FlashOutcome {
        match err.disposition() {
            Disposition::Cancel => {
                info!("Flashing cancelled");
                self.emit(FlashEvent::PhaseChanged {
                    from: FlashPhase::Transfer,
                    to: FlashPhase::Cancelled,
                });
                FlashOutcome::Cancelled
            }
            Disposition::Retry | Disposition::Fallback => {
                if err.is_expected() {
                    info!(reason = %err, "Partial flashing not possible");
                } else {
                    warn!(error = %err, "Partial flashing failed");
                }
                self.fall_back(&err.to_string(), variant, source, updater)
            }
        }
    }

    fn fall_back(
        &self,
        reason: &str,
        variant: HardwareVariant,
        source: &FirmwareSource,
        updater: &mut dyn FullImageUpdater,
    ) -> FlashOutcome {
        let coordinator = FallbackCoordinator::new(self.observer.as_ref());
        match coordinator.engage(reason, &variant, &source.records, updater) {
            Ok(full_update) => FlashOutcome::FallbackEngaged {
                reason: reason.to_string(),
                full_update,
            },
            Err(e) => self.fail(format!("{} (full update: {})", reason, e)),
        }
    }

    fn fail(&self, reason: String) -> FlashOutcome {
        self.emit(FlashEvent::Log {
            level: LogLevel::Error,
            message: reason.clone(),
        });
        self.emit(FlashEvent::PhaseChanged {
            from: FlashPhase::Preparing,
            to: FlashPhase::Error,
        });
        FlashOutcome::Failed { reason }
    }
}

/// Channel wrapper that emits packet events.
struct ObservableChannel<'a, C: FlashChannel, O: FlashObserver> {
    inner: &'a C,
    observer: &'a O,
}

impl<C: FlashChannel, O: FlashObserver> ObservableChannel<'_, C, O> {
    fn packet(&self, direction: PacketDirection, data: &[u8]) {
        let packet_type = match data.first() {
            Some(0x00) => "Region",
            Some(0x01) => "Write",
            Some(0x02) => "End",
            Some(0xEE) => "Status",
            Some(0xFF) => "Reboot",
            _ => "Unknown",
        };
        self.observer.on_event(&FlashEvent::Packet {
            direction,
            packet_type: packet_type.to_string(),
            length: data.len(),
            data: Some(data.iter().take(32).cloned().collect()),
        });
    }
}

impl<C: FlashChannel, O: FlashObserver> FlashChannel for ObservableChannel<'_, C, O> {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(data);
        if res.is_ok() {
            self.packet(PacketDirection::Tx, data);
        }
        res
    }

    fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.recv(timeout);
        match &res {
            Ok(data) if !data.is_empty() => self.packet(PacketDirection::Rx, data),
            _ => {}
        }
        res
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn reconnect(&self, timeout: Duration) -> Result<(), TransportError> {
        self.inner.reconnect(timeout)
    }

    fn device_id(&self) -> &str {
        self.inner.device_id()
    }

    fn drain(&self) -> usize {
        self.inner.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.partial_flashing_enabled);
        assert_eq!(config.strategy, Strategy::Pipelined);
        assert_eq!(config.window_size, 1);
        assert_eq!(config.max_chunks, 700);

        let params = config.params();
        assert_eq!(params.ack_timeout, Duration::from_millis(5000));
        assert_eq!(params.session_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = SessionConfig {
            strategy: Strategy::Synchronous,
            window_size: 4,
            ..SessionConfig::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("strategy = \"synchronous\""));
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
        // The synchronous engine ignores the window
        assert_eq!(parsed.params().window_size, 1);
    }

    #[test]
    fn test_partial_config_file() {
        let parsed: SessionConfig = toml::from_str("window_size = 3\n").unwrap();
        assert_eq!(parsed.window_size, 3);
        assert_eq!(parsed.max_retries, 3);
        assert!(parsed.partial_flashing_enabled);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("sync".parse::<Strategy>().unwrap(), Strategy::Synchronous);
        assert_eq!("Pipelined".parse::<Strategy>().unwrap(), Strategy::Pipelined);
        assert!("turbo".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_outcome_messages() {
        let done = FlashOutcome::Completed {
            blocks: 3,
            chunks: 10,
            already_current: false,
        };
        assert_eq!(done.message(), "Partial flashing complete: 10 chunks in 3 blocks");
        assert!(done.is_success());
        assert!(!FlashOutcome::Cancelled.is_success());
    }
}
