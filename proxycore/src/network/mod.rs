//! Connections to cluster nodes and the handshake performed on them.

mod connection;
mod endpoint;
mod frames;
mod handshake;
pub mod tls;

pub use connection::{
    ClosedSignal, Connection, ConnectionConfig, ConnectionState, Receiver, Sender,
};
pub use endpoint::{Endpoint, EndpointFactory, EndpointParseError};
pub use frames::{FrameReceiver, InboundFrames};
pub use handshake::{
    perform_handshake, AuthOutcome, HandshakeResult, StartupOptions, DEFAULT_HANDSHAKE_TIMEOUT,
};
