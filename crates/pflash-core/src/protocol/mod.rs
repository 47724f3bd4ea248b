//! Partial flashing wire protocol.

pub mod block;
pub mod command;
pub mod constants;
pub mod reply;

pub use block::FlashBlock;
pub use command::{Command, CommandError};
pub use reply::{RegionInfo, Reply, ReplyError, WriteStatus};
