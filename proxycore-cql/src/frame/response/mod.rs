//! CQL responses a server may send while a connection is being set up.

pub mod authenticate;
pub mod error;
pub mod supported;

pub use authenticate::{AuthChallenge, AuthSuccess, Authenticate};
pub use error::Error;
pub use supported::Supported;

use super::frame_errors::{CqlResponseParseError, CqlResponseSerializationError};
use super::TryFromPrimitiveError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

/// A response to one of the connection setup requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(Error),
    Ready,
    Authenticate(Authenticate),
    AuthSuccess(AuthSuccess),
    AuthChallenge(AuthChallenge),
    Supported(Supported),
}

impl Response {
    pub fn deserialize(
        opcode: ResponseOpcode,
        buf: &mut &[u8],
    ) -> Result<Response, CqlResponseParseError> {
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => Response::Authenticate(Authenticate::deserialize(buf)?),
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => Response::AuthSuccess(AuthSuccess::deserialize(buf)?),
            ResponseOpcode::Result | ResponseOpcode::Event => {
                return Err(CqlResponseParseError::NotASetupResponse(opcode))
            }
        };

        Ok(response)
    }

    /// Parses a raw opcode and body, as found in a [`Frame`](super::Frame).
    pub fn from_raw(opcode: u8, mut body: &[u8]) -> Result<Response, CqlResponseParseError> {
        let opcode = ResponseOpcode::try_from(opcode)?;
        Self::deserialize(opcode, &mut body)
    }
}

/// Responses that can be serialized into a CQL frame.
///
/// Clients never send responses; this is used by test servers.
pub trait SerializableResponse {
    const OPCODE: ResponseOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlResponseSerializationError>;
}

/// The body-less `READY` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready;

impl SerializableResponse for Ready {
    const OPCODE: ResponseOpcode = ResponseOpcode::Ready;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), CqlResponseSerializationError> {
        Ok(())
    }
}
