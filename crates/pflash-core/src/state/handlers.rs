//! Handshake reply handlers and the shared send/await helpers.
//!
//! Each handler consumes one device reply in one state, sends the next
//! query and moves the session on:
//!
//! REGION(DAL) -> STATUS -> [REBOOT + reconnect] -> REGION(EMBEDDED)
//! -> REGION(PROGRAM) -> transfer or done.

use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::diff::HashPair;
use crate::error::{PartialFlashError, hex_string};
use crate::events::{FlashEvent, FlashObserver, FlashPhase, LogLevel};
use crate::protocol::constants::*;
use crate::protocol::{Command, RegionInfo, Reply};
use crate::state::machine::{FlashState, TransferSession};
use crate::transport::{FlashChannel, TransportError};

/// Result of handling one handshake reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Query sent, wait for the next reply.
    Continue,
    /// Device program differs; start the block loop.
    StartTransfer,
    /// Device already runs this program.
    AlreadyCurrent,
}

/// Everything a handler needs for one attempt.
pub struct HandlerContext<'a, C: FlashChannel, O: FlashObserver> {
    pub channel: &'a C,
    pub observer: &'a O,
    pub session: &'a mut TransferSession,
    pub hashes: HashPair,
}

impl<'a, C: FlashChannel, O: FlashObserver> HandlerContext<'a, C, O> {
    pub fn new(
        channel: &'a C,
        observer: &'a O,
        session: &'a mut TransferSession,
        hashes: HashPair,
    ) -> Self {
        Self {
            channel,
            observer,
            session,
            hashes,
        }
    }

    pub(crate) fn emit(&self, event: FlashEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(FlashEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn goto(&mut self, state: FlashState) {
        let from = self.session.state;
        self.session.goto_state(state);
        self.emit(FlashEvent::StateChanged {
            from: from.to_string(),
            to: state.to_string(),
        });
    }

    pub(crate) fn progress(&self) {
        self.emit(FlashEvent::Progress {
            phase: FlashPhase::Transfer,
            current: self.session.acknowledged as u64,
            total: self.session.total_chunks as u64,
        });
    }

    pub(crate) fn check_cancel(&self) -> Result<(), PartialFlashError> {
        if self.session.is_cancelled() {
            return Err(PartialFlashError::UserCancelled);
        }
        Ok(())
    }

    /// Write one command.
    pub(crate) fn send(&self, command: &Command) -> Result<(), PartialFlashError> {
        debug!(command = %command, "Sending");
        match self.channel.write(&command.to_bytes()) {
            Ok(()) => Ok(()),
            Err(TransportError::Disconnected) if self.session.flags.expecting_disconnect => {
                debug!(command = %command, "Write raced expected disconnect");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for a reply that `accept` wants, ignoring anything else.
    ///
    /// The wait is bounded by the acknowledgment timeout and by the
    /// session deadline, whichever comes first.
    pub(crate) fn await_reply<F>(&self, accept: F) -> Result<Reply, PartialFlashError>
    where
        F: Fn(&Reply) -> bool,
    {
        let ack_deadline = Instant::now() + self.session.params.ack_timeout;
        let session_deadline = self.session.deadline();
        let deadline = ack_deadline.min(session_deadline);

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error(session_deadline <= ack_deadline));
            }
            match self.channel.recv(deadline - now) {
                Ok(bytes) => match Reply::parse(&bytes) {
                    Ok(reply) => {
                        self.emit(FlashEvent::ReplyReceived {
                            reply: format!("{:?}", reply),
                        });
                        if accept(&reply) {
                            return Ok(reply);
                        }
                        debug!(state = %self.session.state, reply = ?reply, "Ignoring reply");
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed notification"),
                },
                Err(TransportError::Timeout { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn timeout_error(&self, session_bound: bool) -> PartialFlashError {
        if session_bound {
            PartialFlashError::SessionTimeout {
                timeout_secs: self.session.params.session_timeout.as_secs(),
            }
        } else {
            PartialFlashError::AcknowledgmentTimeout {
                timeout_ms: self.session.params.ack_timeout.as_millis() as u64,
            }
        }
    }

    pub(crate) fn check_session_deadline(&self) -> Result<(), PartialFlashError> {
        if self.session.session_expired() {
            return Err(self.timeout_error(true));
        }
        Ok(())
    }
}

/// Outcome of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Transfer,
    AlreadyCurrent,
}

/// Run the handshake up to the point where blocks can be sent.
pub fn run_handshake<C: FlashChannel, O: FlashObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandshakeOutcome, PartialFlashError> {
    ctx.check_cancel()?;
    ctx.session.flags.transfer_active = true;
    ctx.goto(FlashState::AwaitingBaselineHash);
    ctx.send(&Command::RegionInfo { region: REGION_DAL })?;

    loop {
        let reply = ctx.await_reply(|_| true)?;
        match handle_reply(&reply, ctx)? {
            HandleResult::Continue => {}
            HandleResult::StartTransfer => return Ok(HandshakeOutcome::Transfer),
            HandleResult::AlreadyCurrent => return Ok(HandshakeOutcome::AlreadyCurrent),
        }
    }
}

/// Dispatch one reply on the current state.
pub fn handle_reply<C: FlashChannel, O: FlashObserver>(
    reply: &Reply,
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, PartialFlashError> {
    match (ctx.session.state, reply) {
        (FlashState::AwaitingBaselineHash, Reply::Region(info)) if info.region == REGION_DAL => {
            handle_baseline_hash(info, ctx)
        }
        (FlashState::AwaitingMode, Reply::Status { mode, .. }) => handle_status(*mode, ctx),
        (FlashState::AwaitingEmbeddedHash, Reply::Region(info)) => handle_embedded_hash(info, ctx),
        (FlashState::AwaitingProgramHash, Reply::Region(info)) if info.region == REGION_PROGRAM => {
            handle_program_hash(info, ctx)
        }
        (state, other) => {
            debug!(state = %state, reply = ?other, "Reply not expected in this state");
            Ok(HandleResult::Continue)
        }
    }
}

/// REGION(DAL) - the diff is only valid against the runtime it was built for.
fn handle_baseline_hash<C: FlashChannel, O: FlashObserver>(
    info: &RegionInfo,
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, PartialFlashError> {
    debug!(
        start = %format!("0x{:08X}", info.start),
        end = %format!("0x{:08X}", info.end),
        "Baseline region"
    );
    if info.hash != ctx.hashes.reference {
        info!(
            expected = %hex_string(&ctx.hashes.reference),
            actual = %hex_string(&info.hash),
            "Baseline hash mismatch"
        );
        return Err(PartialFlashError::BaselineMismatch {
            expected: hex_string(&ctx.hashes.reference),
            actual: hex_string(&info.hash),
        });
    }
    ctx.log(LogLevel::Info, "Baseline runtime matches");
    ctx.goto(FlashState::AwaitingMode);
    ctx.send(&Command::Status)?;
    Ok(HandleResult::Continue)
}

/// STATUS - reboot into transfer mode if the application is running.
fn handle_status<C: FlashChannel, O: FlashObserver>(
    mode: u8,
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, PartialFlashError> {
    if mode == MODE_APPLICATION {
        info!("Device in application mode, rebooting into transfer mode");
        ctx.session.flags.mode_switch_in_progress = true;
        ctx.session.flags.expecting_disconnect = true;
        ctx.goto(FlashState::Rebooting);
        ctx.emit(FlashEvent::PhaseChanged {
            from: FlashPhase::Handshake,
            to: FlashPhase::ModeSwitch,
        });
        ctx.send(&Command::Reboot { mode: MODE_PAIRING })?;

        ctx.channel
            .reconnect(ctx.session.params.reconnect_timeout)
            .map_err(|e| PartialFlashError::ReconnectFailed(e.to_string()))?;

        ctx.session.flags.mode_switch_in_progress = false;
        ctx.session.flags.expecting_disconnect = false;
        let stale = ctx.channel.drain();
        if stale > 0 {
            debug!(stale, "Dropped notifications from before the reboot");
        }
        ctx.emit(FlashEvent::PhaseChanged {
            from: FlashPhase::ModeSwitch,
            to: FlashPhase::Handshake,
        });
        ctx.log(LogLevel::Info, "Device back in transfer mode");
    }
    ctx.check_cancel()?;
    ctx.goto(FlashState::AwaitingEmbeddedHash);
    ctx.send(&Command::RegionInfo {
        region: REGION_EMBEDDED,
    })?;
    Ok(HandleResult::Continue)
}

/// REGION(EMBEDDED) - informational only.
fn handle_embedded_hash<C: FlashChannel, O: FlashObserver>(
    info: &RegionInfo,
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, PartialFlashError> {
    debug!(region = info.region, hash = %hex_string(&info.hash), "Embedded region");
    ctx.goto(FlashState::AwaitingProgramHash);
    ctx.send(&Command::RegionInfo {
        region: REGION_PROGRAM,
    })?;
    Ok(HandleResult::Continue)
}

/// REGION(PROGRAM) - nothing to do if the device already runs this program.
fn handle_program_hash<C: FlashChannel, O: FlashObserver>(
    info: &RegionInfo,
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<HandleResult, PartialFlashError> {
    if info.hash == ctx.hashes.program {
        ctx.log(LogLevel::Info, "Program hash matches, nothing to transfer");
        return Ok(HandleResult::AlreadyCurrent);
    }
    debug!(
        device = %hex_string(&info.hash),
        image = %hex_string(&ctx.hashes.program),
        "Program differs"
    );
    ctx.goto(FlashState::Transferring);
    Ok(HandleResult::StartTransfer)
}

/// Send TRANSMISSION_END and let the device go.
///
/// The device may reboot (and disconnect) as soon as it sees the command,
/// so a disconnect from here on is not a failure.
pub fn end_transmission<C: FlashChannel, O: FlashObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
) -> Result<(), PartialFlashError> {
    ctx.session.flags.expecting_disconnect = true;
    ctx.session.flags.transfer_active = false;
    ctx.send(&Command::TransmissionEnd)?;
    thread::sleep(ctx.session.params.end_grace);
    ctx.goto(FlashState::Completed);
    ctx.emit(FlashEvent::Complete);
    Ok(())
}
