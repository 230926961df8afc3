use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types::{read_bytes_opt, write_bytes_opt};

// Implements Authenticate Response
#[derive(Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

// The token usually carries credentials, so only its size is shown.
impl std::fmt::Debug for AuthResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthResponse")
            .field("response_len", &self.response.as_ref().map(Vec::len))
            .finish()
    }
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        write_bytes_opt(self.response.as_ref(), buf).map_err(|err| {
            CqlRequestSerializationError::FieldTooLong {
                field: "auth response token",
                err,
            }
        })
    }
}

impl DeserializableRequest for AuthResponse {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let response = read_bytes_opt(buf)?.map(|b| b.to_vec());
        Ok(Self { response })
    }
}
