use crate::frame::frame_errors::{CqlResponseParseError, CqlResponseSerializationError};
use crate::frame::response::{ResponseOpcode, SerializableResponse};
use crate::frame::types;

// Implements Authenticate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let authenticator_name = types::read_string(buf)
            .map_err(CqlResponseParseError::Authenticate)?
            .to_string();

        Ok(Authenticate { authenticator_name })
    }
}

impl SerializableResponse for Authenticate {
    const OPCODE: ResponseOpcode = ResponseOpcode::Authenticate;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlResponseSerializationError> {
        types::write_string(&self.authenticator_name, buf).map_err(|err| {
            CqlResponseSerializationError::FieldTooLong {
                field: "authenticator name",
                err,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let success_message = types::read_bytes_opt(buf)
            .map_err(CqlResponseParseError::AuthSuccess)?
            .map(ToOwned::to_owned);

        Ok(AuthSuccess { success_message })
    }
}

impl SerializableResponse for AuthSuccess {
    const OPCODE: ResponseOpcode = ResponseOpcode::AuthSuccess;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlResponseSerializationError> {
        types::write_bytes_opt(self.success_message.as_ref(), buf).map_err(|err| {
            CqlResponseSerializationError::FieldTooLong {
                field: "auth success message",
                err,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub authenticate_message: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let authenticate_message = types::read_bytes_opt(buf)
            .map_err(CqlResponseParseError::AuthChallenge)?
            .map(|b| b.to_owned());

        Ok(AuthChallenge {
            authenticate_message,
        })
    }
}

impl SerializableResponse for AuthChallenge {
    const OPCODE: ResponseOpcode = ResponseOpcode::AuthChallenge;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlResponseSerializationError> {
        types::write_bytes_opt(self.authenticate_message.as_ref(), buf).map_err(|err| {
            CqlResponseSerializationError::FieldTooLong {
                field: "auth challenge token",
                err,
            }
        })
    }
}
