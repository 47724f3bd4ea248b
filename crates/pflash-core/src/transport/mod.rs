//! Transport layer module.

pub mod mock;
pub mod router;
pub mod sim;
pub mod traits;

pub use mock::MockChannel;
pub use router::{NotificationRouter, PacketSink, RoutedChannel, SessionKey};
pub use sim::{SimBehavior, SimConfig, SimulatedDevice};
pub use traits::{FlashChannel, TransportError};
