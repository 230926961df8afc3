//! CQL protocol-level representation of a `SUPPORTED` response.

use crate::frame::frame_errors::{CqlResponseParseError, CqlResponseSerializationError};
use crate::frame::response::{ResponseOpcode, SerializableResponse};
use crate::frame::types;
use std::collections::HashMap;

/// The server's supported `STARTUP` options, sent in answer to `OPTIONS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let options =
            types::read_string_multimap(buf).map_err(CqlResponseParseError::Supported)?;

        Ok(Supported { options })
    }
}

impl SerializableResponse for Supported {
    const OPCODE: ResponseOpcode = ResponseOpcode::Supported;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlResponseSerializationError> {
        types::write_string_multimap(&self.options, buf).map_err(|err| {
            CqlResponseSerializationError::FieldTooLong {
                field: "supported options",
                err,
            }
        })
    }
}
