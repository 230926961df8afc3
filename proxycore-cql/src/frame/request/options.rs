use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}

impl DeserializableRequest for Options {
    fn deserialize(_buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        Ok(Options)
    }
}

/* Key names for options in SUPPORTED/STARTUP */
pub const COMPRESSION: &str = "COMPRESSION";
pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";
pub const PROTOCOL_VERSIONS: &str = "PROTOCOL_VERSIONS";

/* Value names for options in SUPPORTED/STARTUP */
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
pub const DEFAULT_DRIVER_NAME: &str = "cql-proxy";
pub const DEFAULT_DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
