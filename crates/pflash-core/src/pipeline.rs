//! Windowed block transfer.
//!
//! Keeps up to `window_size` full blocks on the wire and matches each
//! acknowledgment to the oldest unacknowledged block. A retransmit
//! request rewinds the window to that block. With a window of one the
//! command sequence is the same as the synchronous engine's.

use tracing::debug;

use crate::error::PartialFlashError;
use crate::events::FlashObserver;
use crate::protocol::{FlashBlock, WriteStatus};
use crate::state::HandlerContext;
use crate::state::blocks::{
    BlockTransfer, await_write_status, retry_after_retransmit, retry_after_write_failure,
    send_block, settle_unacknowledged,
};
use crate::transport::FlashChannel;

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelinedFlashTransport;

impl PipelinedFlashTransport {
    /// Restart from `oldest` once the replies still owed for `outstanding`
    /// blocks have been read. Each read waits up to the acknowledgment
    /// timeout; replies can still be on their way.
    fn rewind<C: FlashChannel, O: FlashObserver>(
        ctx: &mut HandlerContext<'_, C, O>,
        next: &mut usize,
        oldest: usize,
        outstanding: usize,
    ) -> Result<(), PartialFlashError> {
        for _ in 0..outstanding {
            let status = await_write_status(ctx)?;
            debug!(status = ?status, "Discarded reply for a rewound block");
        }
        *next = oldest;
        ctx.session.in_flight = 0;
        Ok(())
    }
}

impl BlockTransfer for PipelinedFlashTransport {
    fn transfer<C: FlashChannel, O: FlashObserver>(
        &self,
        ctx: &mut HandlerContext<'_, C, O>,
        blocks: &[FlashBlock],
    ) -> Result<(), PartialFlashError> {
        // next block to send, oldest block not yet acknowledged
        let mut next = 0;
        let mut oldest = 0;

        while oldest < blocks.len() {
            ctx.check_cancel()?;
            ctx.check_session_deadline()?;

            while next < blocks.len() && ctx.session.window_open() {
                let block = &blocks[next];
                // The unacknowledged tail goes out on an empty window only
                if block.is_short() && ctx.session.in_flight > 0 {
                    break;
                }
                ctx.session.current_index = next;
                if let Err(err) = send_block(ctx, block) {
                    retry_after_write_failure(ctx, oldest, err)?;
                    // Every block already in flight still gets its reply
                    let outstanding = ctx.session.in_flight;
                    Self::rewind(ctx, &mut next, oldest, outstanding)?;
                    break;
                }
                next += 1;
                if block.is_short() {
                    settle_unacknowledged(ctx, block);
                    oldest = next;
                }
            }

            if oldest >= blocks.len() {
                break;
            }
            if ctx.session.in_flight == 0 {
                // Rewound after a write failure; refill first
                continue;
            }

            match await_write_status(ctx)? {
                WriteStatus::Success => {
                    ctx.session.block_acked(blocks[oldest].len());
                    ctx.progress();
                    oldest += 1;
                }
                WriteStatus::Retransmit => {
                    retry_after_retransmit(ctx, oldest)?;
                    // The oldest block's reply was this one
                    let outstanding = ctx.session.in_flight - 1;
                    Self::rewind(ctx, &mut next, oldest, outstanding)?;
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
    use crate::diff::{DiffChunk, HashPair};
    use crate::events::NullObserver;
    use crate::protocol::constants::*;
    use crate::protocol::{RegionInfo, Reply};
    use crate::state::{CancelToken, FlashProtocolStateMachine, TransferParams, TransferSession, run_attempt};
    use crate::transport::{MockChannel, TransportError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
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

    fn params(window_size: usize) -> TransferParams {
        TransferParams {
            window_size,
            ack_timeout: Duration::from_millis(50),
            end_grace: Duration::ZERO,
            ..TransferParams::default()
        }
    }

    fn scripted(acks: &[[u8; 2]]) -> MockChannel {
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
        mock.queue_reply(&[CMD_STATUS, 0x01, MODE_PAIRING]);
        mock.queue_reply(&region(REGION_EMBEDDED, [0; 8]));
        mock.queue_reply(&region(REGION_PROGRAM, [0; 8]));
        for ack in acks {
            mock.queue_reply(ack);
        }
        mock
    }

    fn hashes() -> HashPair {
        HashPair {
            reference: [0xAA; 8],
            program: [0xBB; 8],
        }
    }

    const ACK: [u8; 2] = [CMD_FLASH_DATA, WRITE_SUCCESS];

    #[test]
    fn test_window_one_matches_synchronous() {
        let sync_mock = scripted(&[ACK, ACK]);
        let mut session = TransferSession::new(params(1), CancelToken::new());
        let mut ctx = HandlerContext::new(&sync_mock, &NullObserver, &mut session, hashes());
        run_attempt(&FlashProtocolStateMachine, &mut ctx, &chunks(10)).unwrap();

        let piped_mock = scripted(&[ACK, ACK]);
        let mut session = TransferSession::new(params(1), CancelToken::new());
        let mut ctx = HandlerContext::new(&piped_mock, &NullObserver, &mut session, hashes());
        let report = run_attempt(&PipelinedFlashTransport, &mut ctx, &chunks(10)).unwrap();

        assert_eq!(sync_mock.get_writes(), piped_mock.get_writes());
        assert_eq!(report.peak_in_flight, 1);
    }

    #[test]
    fn test_window_bounds_in_flight() {
        let mock = scripted(&[ACK; 5]);
        let mut session = TransferSession::new(params(3), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let report = run_attempt(&PipelinedFlashTransport, &mut ctx, &chunks(20)).unwrap();

        assert_eq!(report.blocks, 5);
        assert_eq!(report.peak_in_flight, 3);
        assert_eq!(session.acknowledged, 20);
        assert_eq!(mock.opcodes().last(), Some(&CMD_TRANSMISSION_END));
    }

    #[test]
    fn test_retransmit_rewinds_window() {
        let retransmit = [CMD_FLASH_DATA, WRITE_RETRANSMIT];
        // block 0 retransmit, block 1 ack (discarded), then both resent
        let mock = scripted(&[retransmit, ACK, ACK, ACK]);
        let mut session = TransferSession::new(params(2), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let report = run_attempt(&PipelinedFlashTransport, &mut ctx, &chunks(8)).unwrap();

        assert_eq!(report.total_retries, 1);
        assert_eq!(report.blocks_sent, 4);
        assert_eq!(session.acknowledged, 8);
        let writes = mock.get_writes();
        // 4 handshake writes, 2 blocks, block 0 and 1 again, END
        assert_eq!(writes.len(), 4 + 8 + 8 + 1);
        assert_eq!(writes[4], writes[12]);
        assert_eq!(writes[8], writes[16]);
        assert_eq!(mock.opcodes().last(), Some(&CMD_TRANSMISSION_END));
    }

    /// Replies are only visible to a waiting reader, never to a
    /// zero-timeout poll, like notifications still on the air.
    struct LaggingChannel {
        replies: Mutex<VecDeque<Vec<u8>>>,
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl LaggingChannel {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                writes: Mutex::new(Vec::new()),
            }
        }

        fn unread(&self) -> Vec<Vec<u8>> {
            self.replies.lock().unwrap().iter().cloned().collect()
        }
    }

    impl FlashChannel for LaggingChannel {
        fn write(&self, data: &[u8]) -> Result<(), TransportError> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
            if timeout.is_zero() {
                return Err(TransportError::timeout(timeout));
            }
            if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                return Ok(reply);
            }
            std::thread::sleep(timeout);
            Err(TransportError::timeout(timeout))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn reconnect(&self, _timeout: Duration) -> Result<(), TransportError> {
            Ok(())
        }

        fn device_id(&self) -> &str {
            "lagging"
        }
    }

    #[test]
    fn test_late_replies_matched_to_their_blocks() {
        let region = |region, hash| {
            Reply::Region(RegionInfo {
                region,
                start: 0,
                end: 0,
                hash,
            })
            .to_bytes()
        };
        let retransmit = vec![CMD_FLASH_DATA, WRITE_RETRANSMIT];
        let channel = LaggingChannel::new(vec![
            region(REGION_DAL, [0xAA; 8]),
            vec![CMD_STATUS, 0x01, MODE_PAIRING],
            region(REGION_EMBEDDED, [0; 8]),
            region(REGION_PROGRAM, [0; 8]),
            // first pass: block 0 retransmit, block 1 ack
            retransmit.clone(),
            ACK.to_vec(),
            // second pass: block 0 ack, block 1 retransmit
            ACK.to_vec(),
            retransmit,
            // block 1 alone
            ACK.to_vec(),
        ]);
        let mut session = TransferSession::new(params(2), CancelToken::new());
        let mut ctx = HandlerContext::new(&channel, &NullObserver, &mut session, hashes());
        let report = run_attempt(&PipelinedFlashTransport, &mut ctx, &chunks(8)).unwrap();

        assert!(channel.unread().is_empty());
        assert_eq!(report.total_retries, 2);
        assert_eq!(report.blocks_sent, 5);

        let writes = channel.writes.lock().unwrap();
        // handshake, 2 blocks, 2 blocks again, block 1 again, END
        assert_eq!(writes.len(), 4 + 8 + 8 + 4 + 1);
        assert_eq!(writes[20], writes[8]);
        assert_eq!(writes.last(), Some(&vec![CMD_TRANSMISSION_END]));
    }

    #[test]
    fn test_rewind_gives_up_when_owed_reply_never_comes() {
        let retransmit = [CMD_FLASH_DATA, WRITE_RETRANSMIT];
        // block 1 never answers
        let mock = scripted(&[retransmit]);
        let mut session = TransferSession::new(params(2), CancelToken::new());
        let mut ctx = HandlerContext::new(&mock, &NullObserver, &mut session, hashes());
        let err = run_attempt(&PipelinedFlashTransport, &mut ctx, &chunks(8)).unwrap_err();

        assert!(matches!(err, PartialFlashError::AcknowledgmentTimeout { .. }));
        // nothing resent before the owed reply
        assert_eq!(mock.get_writes().len(), 4 + 8);
    }
}
