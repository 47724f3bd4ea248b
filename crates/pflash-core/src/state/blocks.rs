//! Block transfer: the acknowledged, one-block-at-a-time engine and the
//! pieces shared with the pipelined one.

use tracing::{debug, info, warn};

use crate::diff::DiffChunk;
use crate::error::{Disposition, PartialFlashError};
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::protocol::constants::PACKETS_PER_BLOCK;
use crate::protocol::{FlashBlock, Reply, WriteStatus};
use crate::state::handlers::{
    HandlerContext, HandshakeOutcome, end_transmission, run_handshake,
};
use crate::transport::FlashChannel;

/// Summary of a finished attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashReport {
    pub blocks: usize,
    pub chunks: usize,
    /// Block transmissions, resends included.
    pub blocks_sent: usize,
    pub total_retries: usize,
    pub peak_in_flight: usize,
    /// The device already ran this program; no blocks were sent.
    pub already_current: bool,
}

/// Moves the blocks of one attempt to the device.
pub trait BlockTransfer {
    fn transfer<C: FlashChannel, O: FlashObserver>(
        &self,
        ctx: &mut HandlerContext<'_, C, O>,
        blocks: &[FlashBlock],
    ) -> Result<(), PartialFlashError>;
}

/// Handshake, transfer and end-of-transmission for one attempt.
pub fn run_attempt<E, C, O>(
    engine: &E,
    ctx: &mut HandlerContext<'_, C, O>,
    chunks: &[DiffChunk],
) -> Result<FlashReport, PartialFlashError>
where
    E: BlockTransfer,
    C: FlashChannel,
    O: FlashObserver,
{
    let blocks = FlashBlock::partition(chunks);
    if let Some(block) = blocks.iter().find(|b| !b.is_contiguous()) {
        warn!(
            first_chunk = block.first_chunk,
            "Block spans an address gap; device writes it contiguously"
        );
    }
    ctx.session.total_chunks = chunks.len();

    let outcome = run_handshake(ctx)?;
    let already_current = outcome == HandshakeOutcome::AlreadyCurrent;
    if !already_current {
        ctx.emit(FlashEvent::PhaseChanged {
            from: FlashPhase::Handshake,
            to: FlashPhase::Transfer,
        });
        ctx.progress();
        engine.transfer(ctx, &blocks)?;
        info!(
            blocks = blocks.len(),
            retries = ctx.session.total_retries,
            "All blocks transferred"
        );
    }
    end_transmission(ctx)?;

    Ok(FlashReport {
        blocks: if already_current { 0 } else { blocks.len() },
        chunks: if already_current { 0 } else { chunks.len() },
        blocks_sent: ctx.session.blocks_sent,
        total_retries: ctx.session.total_retries,
        peak_in_flight: ctx.session.peak_in_flight,
        already_current,
    })
}

/// Write every packet of `block`.
pub(crate) fn send_block<C: FlashChannel, O: FlashObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
    block: &FlashBlock,
) -> Result<(), PartialFlashError> {
    let packets = block
        .packets()
        .map_err(|e| PartialFlashError::MalformedImage(e.to_string()))?;
    for packet in &packets {
        ctx.send(packet)?;
    }
    ctx.session.block_sent();
    debug!(
        block = block.first_chunk / PACKETS_PER_BLOCK,
        packets = packets.len(),
        in_flight = ctx.session.in_flight,
        "Block sent"
    );
    Ok(())
}

/// Spend one retry on a failed write, or give up.
pub(crate) fn retry_after_write_failure<C: FlashChannel, O: FlashObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
    block: usize,
    err: PartialFlashError,
) -> Result<(), PartialFlashError> {
    if err.disposition() != Disposition::Retry {
        return Err(err);
    }
    if ctx.session.register_retry() {
        warn!(block, attempt = ctx.session.retry_count, error = %err, "Write failed, resending block");
        Ok(())
    } else {
        Err(PartialFlashError::RetriesExhausted {
            block,
            attempts: ctx.session.retry_count,
        })
    }
}

/// Spend one retry on a retransmit request, or give up.
pub(crate) fn retry_after_retransmit<C: FlashChannel, O: FlashObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
    block: usize,
) -> Result<(), PartialFlashError> {
    if ctx.session.register_retry() {
        debug!(block, attempt = ctx.session.retry_count, "Device requested retransmit");
        Ok(())
    } else {
        Err(PartialFlashError::RetriesExhausted {
            block,
            attempts: ctx.session.retry_count,
        })
    }
}

/// Wait for the next write acknowledgment.
pub(crate) fn await_write_status<C: FlashChannel, O: FlashObserver>(
    ctx: &HandlerContext<'_, C, O>,
) -> Result<WriteStatus, PartialFlashError> {
    match ctx.await_reply(|r| matches!(r, Reply::Write(_)))? {
        Reply::Write(status) => Ok(status),
        other => Err(PartialFlashError::MalformedImage(format!(
            "unexpected reply {:?}",
            other
        ))),
    }
}

/// Account for the final short block, which the device never acknowledges.
pub(crate) fn settle_unacknowledged<C: FlashChannel, O: FlashObserver>(
    ctx: &mut HandlerContext<'_, C, O>,
    block: &FlashBlock,
) {
    ctx.session.block_acked(block.len());
    ctx.progress();
}

/// One block on the wire at a time; every full block waits for its
/// acknowledgment before the next one is sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashProtocolStateMachine;

impl BlockTransfer for FlashProtocolStateMachine {
    fn transfer<C: FlashChannel, O: FlashObserver>(
        &self,
        ctx: &mut HandlerContext<'_, C, O>,
        blocks: &[FlashBlock],
    ) -> Result<(), PartialFlashError> {
        let mut index = 0;
        while index < blocks.len() {
            ctx.check_cancel()?;
            ctx.check_session_deadline()?;
            ctx.session.current_index = index;
            let block = &blocks[index];

            if let Err(err) = send_block(ctx, block) {
                retry_after_write_failure(ctx, index, err)?;
                continue;
            }

            if block.is_short() {
                settle_unacknowledged(ctx, block);
                index += 1;
                continue;
            }

            match await_write_status(ctx)? {
                WriteStatus::Success => {
                    ctx.session.block_acked(block.len());
                    ctx.progress();
                    index += 1;
                }
                WriteStatus::Retransmit => {
                    ctx.session.in_flight = 0;
                    retry_after_retransmit(ctx, index)?;
                }
                WriteStatus::Other(status) => {
                    return Err(PartialFlashError::DeviceRejected { status });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::HashPair;
    use crate::events::NullObserver;
    use crate::protocol::constants::*;
    use crate::protocol::RegionInfo;
    use crate::state::machine::{CancelToken, FlashState, TransferParams, TransferSession};
    use crate::transport::MockChannel;
    use std::time::Duration;

    fn chunks(n: usize) -> Vec<DiffChunk> {
        (0..n)
            .map(|i| {
                let address = 0x1F000 + (i * 16) as u32;
                DiffChunk {
                    segment: (address >> 16) as u16,
                    offset: address as u16,
                    data: vec![i as u8; 16],
                }
            })
            .collect()
    }

    fn params() -> TransferParams {
        TransferParams {
            ack_timeout: Duration::from_millis(50),
            end_grace: Duration::ZERO,
            ..TransferParams::default()
        }
    }

    fn handshake_replies(mock: &MockChannel) {
        let region = |region, hash| {
            Reply::Region(RegionInfo {
                region,
                start: 0,
                end: 0,
                hash,
            })
            .to_bytes()
        };
        mock.queue_reply(&region(REGION_DAL, [0xAA; 8]));
        mock.queue_reply(&[CMD_STATUS, 0x01, MODE_PAIRING]);
        mock.queue_reply(&region(REGION_EMBEDDED, [0; 8]));
        mock.queue_reply(&region(REGION_PROGRAM, [0; 8]));
    }

    fn hashes() -> HashPair {
        HashPair {
            reference: [0xAA; 8],
            program: [0xBB; 8],
        }
    }

    const ACK: [u8; 2] = [CMD_FLASH_DATA, WRITE_SUCCESS];
    const RETRANSMIT: [u8; 2] = [CMD_FLASH_DATA, WRITE_RETRANSMIT];

    #[test]
    fn test_ten_chunks_three_blocks() {
        let mock = MockChannel::new();
        handshake_replies(&mock);
        mock.queue_replies(&ACK, 2);

        let mut session = TransferSession::new(params(), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let report = run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(10)).unwrap();

        assert_eq!(report.blocks, 3);
        assert_eq!(report.chunks, 10);
        assert_eq!(report.peak_in_flight, 1);
        let writes: Vec<u8> = mock.opcodes().into_iter().skip(4).collect();
        let mut expected = vec![CMD_FLASH_DATA; 10];
        expected.push(CMD_TRANSMISSION_END);
        assert_eq!(writes, expected);
        assert_eq!(session.state, FlashState::Completed);
        assert_eq!(session.acknowledged, 10);
    }

    #[test]
    fn test_retransmit_resends_same_block() {
        let mock = MockChannel::new();
        handshake_replies(&mock);
        mock.queue_reply(&RETRANSMIT);
        mock.queue_reply(&ACK);

        let mut session = TransferSession::new(params(), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let report = run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(4)).unwrap();

        assert_eq!(report.blocks_sent, 2);
        assert_eq!(report.total_retries, 1);
        let writes = mock.get_writes();
        assert_eq!(writes[4], writes[8]);
    }

    #[test]
    fn test_retry_budget_spent() {
        let mock = MockChannel::new();
        handshake_replies(&mock);
        mock.queue_replies(&RETRANSMIT, 10);

        let mut session = TransferSession::new(params(), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let err = run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(8)).unwrap_err();

        assert!(matches!(
            err,
            PartialFlashError::RetriesExhausted {
                block: 0,
                attempts: 4
            }
        ));
        assert_eq!(session.blocks_sent, 4);
        assert!(!mock.opcodes().contains(&CMD_TRANSMISSION_END));
    }

    #[test]
    fn test_device_rejects_block() {
        let mock = MockChannel::new();
        handshake_replies(&mock);
        mock.queue_reply(&[CMD_FLASH_DATA, 0x01]);

        let mut session = TransferSession::new(params(), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        assert!(matches!(
            run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(4)),
            Err(PartialFlashError::DeviceRejected { status: 0x01 })
        ));
    }

    #[test]
    fn test_write_failures_exhaust_budget() {
        let mock = MockChannel::new();
        handshake_replies(&mock);
        // Four handshake writes go through, every block write fails
        mock.fail_writes_after(4);

        let mut session = TransferSession::new(params(), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let err = run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(4)).unwrap_err();
        assert!(matches!(
            err,
            PartialFlashError::RetriesExhausted { attempts: 4, .. }
        ));
    }

    #[test]
    fn test_already_current_still_ends() {
        let mock = MockChannel::new();
        let region = |region, hash| {
            Reply::Region(RegionInfo {
                region,
                start: 0,
                end: 0,
                hash,
            })
            .to_bytes()
        };
        mock.queue_reply(&region(REGION_DAL, [0xAA; 8]));
        mock.queue_reply(&[CMD_STATUS, MODE_PAIRING]);
        mock.queue_reply(&region(REGION_EMBEDDED, [0; 8]));
        mock.queue_reply(&region(REGION_PROGRAM, [0xBB; 8]));

        let mut session = TransferSession::new(params(), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let report = run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(4)).unwrap();

        assert!(report.already_current);
        assert_eq!(report.blocks_sent, 0);
        assert_eq!(mock.opcodes(), vec![0x00, 0xEE, 0x00, 0x00, CMD_TRANSMISSION_END]);
    }

    #[test]
    fn test_cancel_between_blocks() {
        let mock = MockChannel::new();
        handshake_replies(&mock);
        let token = CancelToken::new();
        let mut session = TransferSession::new(params(), token.clone());
        token.cancel();
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        assert!(matches!(
            run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(4)),
            Err(PartialFlashError::UserCancelled)
        ));
        assert!(mock.get_writes().is_empty());
    }
}
