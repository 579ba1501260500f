pub mod mock;
pub mod traits;

pub use mock::{OutboundMessage, RecordingPeer};
pub use traits::Peer;
