//! Protocol states and per-attempt session state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// State of the partial flashing handshake and transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlashState {
    #[default]
    Idle,
    AwaitingBaselineHash,
    AwaitingMode,
    /// Reboot requested; waiting for the device to reconnect.
    Rebooting,
    AwaitingEmbeddedHash,
    AwaitingProgramHash,
    Transferring,
    Completed,
    /// Cancelled by the user.
    Aborted,
    FallingBack,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashState::Idle => write!(f, "IDLE"),
            FlashState::AwaitingBaselineHash => write!(f, "AWAITING_BASELINE_HASH"),
            FlashState::AwaitingMode => write!(f, "AWAITING_MODE"),
            FlashState::Rebooting => write!(f, "REBOOTING"),
            FlashState::AwaitingEmbeddedHash => write!(f, "AWAITING_EMBEDDED_HASH"),
            FlashState::AwaitingProgramHash => write!(f, "AWAITING_PROGRAM_HASH"),
            FlashState::Transferring => write!(f, "TRANSFERRING"),
            FlashState::Completed => write!(f, "COMPLETED"),
            FlashState::Aborted => write!(f, "ABORTED"),
            FlashState::FallingBack => write!(f, "FALLING_BACK"),
        }
    }
}

impl FlashState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashState::Completed | FlashState::Aborted | FlashState::FallingBack
        )
    }
}

/// Shared cancel flag, set from the UI side.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Link facts that must survive the mode-switch reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkFlags {
    /// A reboot into transfer mode was requested.
    pub mode_switch_in_progress: bool,
    /// Notifications are being consumed by this session.
    pub transfer_active: bool,
    /// A disconnect now is part of the protocol, not a failure.
    pub expecting_disconnect: bool,
}

/// Timing and window parameters of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub window_size: usize,
    pub max_retries: usize,
    pub ack_timeout: Duration,
    pub session_timeout: Duration,
    pub reconnect_timeout: Duration,
    pub end_grace: Duration,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            window_size: 1,
            max_retries: 3,
            ack_timeout: Duration::from_millis(5000),
            session_timeout: Duration::from_secs(120),
            reconnect_timeout: Duration::from_millis(10_000),
            end_grace: Duration::from_millis(50),
        }
    }
}

/// One upload attempt. Created when the attempt starts and dropped on
/// completion, cancellation or fallback.
#[derive(Debug)]
pub struct TransferSession {
    pub state: FlashState,
    pub params: TransferParams,
    pub flags: LinkFlags,
    pub cancel: CancelToken,
    /// Next block to send.
    pub current_index: usize,
    /// Chunks acknowledged so far.
    pub acknowledged: usize,
    /// Blocks sent and not yet acknowledged.
    pub in_flight: usize,
    /// Retries of the current block.
    pub retry_count: usize,
    pub total_chunks: usize,
    /// Block transmissions, including resends.
    pub blocks_sent: usize,
    pub total_retries: usize,
    pub peak_in_flight: usize,
    pub started: Instant,
}

impl TransferSession {
    pub fn new(params: TransferParams, cancel: CancelToken) -> Self {
        Self {
            state: FlashState::Idle,
            params: TransferParams {
                window_size: params.window_size.max(1),
                ..params
            },
            flags: LinkFlags::default(),
            cancel,
            current_index: 0,
            acknowledged: 0,
            in_flight: 0,
            retry_count: 0,
            total_chunks: 0,
            blocks_sent: 0,
            total_retries: 0,
            peak_in_flight: 0,
            started: Instant::now(),
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: FlashState) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.params.session_timeout
    }

    pub fn session_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }

    /// Count one more block on the wire.
    pub fn block_sent(&mut self) {
        self.in_flight += 1;
        self.blocks_sent += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
        debug_assert!(self.in_flight <= self.params.window_size);
    }

    /// Record an acknowledged block of `chunks` chunks.
    pub fn block_acked(&mut self, chunks: usize) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.acknowledged += chunks;
        self.retry_count = 0;
    }

    /// Record a retransmit request. Returns false once the budget is spent.
    pub fn register_retry(&mut self) -> bool {
        self.retry_count += 1;
        self.total_retries += 1;
        self.retry_count <= self.params.max_retries
    }

    pub fn window_open(&self) -> bool {
        self.in_flight < self.params.window_size
    }
}
