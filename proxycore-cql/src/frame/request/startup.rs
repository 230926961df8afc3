//! CQL protocol-level representation of a `STARTUP` request.

use std::{borrow::Cow, collections::HashMap};

use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

/// The `STARTUP` request, which finalises negotiation and asks the server
/// to either accept the connection or demand authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_string_map(&self.options, buf).map_err(|err| {
            CqlRequestSerializationError::FieldTooLong {
                field: "startup options",
                err,
            }
        })
    }
}

impl DeserializableRequest for Startup<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let options = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { options })
    }
}
