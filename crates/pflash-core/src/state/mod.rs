//! Protocol state machine: session state, handshake handlers and the
//! synchronous block engine.

pub mod blocks;
pub mod handlers;
pub mod machine;

pub use blocks::{BlockTransfer, FlashProtocolStateMachine, FlashReport, run_attempt};
pub use handlers::{HandleResult, HandlerContext, HandshakeOutcome, handle_reply, run_handshake};
pub use machine::{CancelToken, FlashState, LinkFlags, TransferParams, TransferSession};
