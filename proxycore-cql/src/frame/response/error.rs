use crate::errors::DbError;
use crate::frame::frame_errors::{CqlResponseParseError, CqlResponseSerializationError};
use crate::frame::response::{ResponseOpcode, SerializableResponse};
use crate::frame::types;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    /// Parses the error code and message. Any code-specific fields that
    /// follow the message are left unread.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let code = types::read_int(buf).map_err(|err| CqlResponseParseError::Error(err.into()))?;
        let reason = types::read_string(buf)
            .map_err(CqlResponseParseError::Error)?
            .to_owned();

        Ok(Error {
            error: DbError::from_code(code),
            reason,
        })
    }
}

impl SerializableResponse for Error {
    const OPCODE: ResponseOpcode = ResponseOpcode::Error;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlResponseSerializationError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf).map_err(|err| {
            CqlResponseSerializationError::FieldTooLong {
                field: "error reason",
                err,
            }
        })
    }
}
