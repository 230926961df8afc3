//! CQL requests sent by the client while a connection is being set up.

pub mod auth_response;
pub mod options;
pub mod startup;

use bytes::Bytes;

pub use auth_response::AuthResponse;
pub use options::Options;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use super::TryFromPrimitiveError;

/// Opcode of a request, used to identify the request type in a CQL frame.
///
/// All request opcodes are listed so that frames from a client can be classified,
/// even though only the setup requests have typed bodies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            RequestOpcode::Startup => "STARTUP",
            RequestOpcode::Options => "OPTIONS",
            RequestOpcode::Query => "QUERY",
            RequestOpcode::Prepare => "PREPARE",
            RequestOpcode::Execute => "EXECUTE",
            RequestOpcode::Register => "REGISTER",
            RequestOpcode::Batch => "BATCH",
            RequestOpcode::AuthResponse => "AUTH_RESPONSE",
        };

        f.write_str(kind_str)
    }
}

/// Requests that can be serialized into a CQL frame.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError>;

    fn to_bytes(&self) -> Result<Bytes, CqlRequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

/// Requests that can be deserialized from a CQL frame.
///
/// The client side never needs this; it exists so that test servers can
/// assert on what a client sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError>;
}

/// A connection setup request, as seen by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request<'r> {
    Startup(Startup<'r>),
    Options(Options),
    AuthResponse(AuthResponse),
}

impl Request<'_> {
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
    ) -> Result<Self, RequestDeserializationError> {
        match opcode {
            RequestOpcode::Startup => Startup::deserialize(buf).map(Self::Startup),
            RequestOpcode::Options => Options::deserialize(buf).map(Self::Options),
            RequestOpcode::AuthResponse => AuthResponse::deserialize(buf).map(Self::AuthResponse),
            other => Err(RequestDeserializationError::NotASetupRequest(other)),
        }
    }

    pub fn opcode(&self) -> RequestOpcode {
        match self {
            Request::Startup(_) => RequestOpcode::Startup,
            Request::Options(_) => RequestOpcode::Options,
            Request::AuthResponse(_) => RequestOpcode::AuthResponse,
        }
    }
}
