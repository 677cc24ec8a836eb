pub mod addressing;
pub mod client;
pub mod error;
pub mod limiter;
pub mod transport;

pub use client::{ChannelClient, ChannelClientConfig};
pub use error::ChannelError;
pub use limiter::SendGate;
pub use transport::{ChannelTransport, LoopbackTransport, SendReceipt, TransportError};
