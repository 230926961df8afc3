//! CQL native protocol primitives used by the cql-proxy connection core.
//!
//! Only the part of the protocol needed to open and negotiate a connection is
//! modelled with types: the frame header, the handshake requests (`STARTUP`,
//! `OPTIONS`, `AUTH_RESPONSE`) and the responses a server may send back while
//! the connection is being established. Every other frame travels as a raw
//! [`Frame`](frame::Frame) and is left to the higher-level proxy.

pub mod errors;
pub mod frame;

pub use crate::frame::{Frame, FrameParams, ProtocolVersion};
