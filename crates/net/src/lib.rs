pub mod config;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod manager;
pub mod message;
pub mod network;
pub mod protocol;
pub mod ring;
pub mod route;

mod channel;
mod events;
mod peer;

pub use config::NetworkConfig;
pub use endpoint::{EndpointStats, LossConditioner};
pub use error::NetError;
pub use handle::{IdError, NetworkId, NetworkIdAllocator, SyncTimestamps};
pub use manager::ConnectionManager;
pub use message::{ChannelKind, Message, MessageKind, MessagePool, PoolStats};
pub use network::NetworkManager;
pub use peer::ConnectionState;
pub use protocol::{
    sequence_greater_than, Frame, Packet, PacketError, PacketHeader, SequencedMessage,
    WireMessage, DEFAULT_PORT, MAX_MESSAGE_SIZE, MAX_PACKET_SIZE, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};
pub use ring::RingBuffer;
pub use route::{MessageRouter, Outbox};
