//! Errors returned while encoding or decoding CQL frames.

use std::sync::Arc;

use thiserror::Error;

use super::response::ResponseOpcode;
use super::TryFromPrimitiveError;
use crate::frame::request::RequestOpcode;

/// An error that occurred while reading a frame header or body.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FrameError {
    /// A frame travelling in the wrong direction was received,
    /// e.g. a request frame arrived at the client side.
    #[error("Received frame with unexpected direction bit (version byte {0:#04x})")]
    UnexpectedDirection(u8),

    /// The version in the frame header is not one this crate understands.
    #[error("Received a frame from version {0}, but only versions 3, 4 and 5 are supported")]
    VersionNotSupported(u8),

    /// The declared body length exceeds the protocol maximum.
    #[error("Frame body length {0} exceeds the maximum of {max} bytes", max = super::MAX_BODY_LENGTH)]
    BodyTooLarge(usize),

    /// The stream ended before a whole frame was read.
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),

    /// Input/output error while reading the frame.
    #[error("I/O error while reading frame: {0}")]
    IoError(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::IoError(Arc::new(err))
    }
}

/// A low-level deserialization error, raised by the wire-type readers
/// in [`types`](super::types).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    /// Reading a fixed-size number ran out of input.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// A length did not fit the target integer type.
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),

    /// The buffer was shorter than a declared length.
    #[error("Expected {expected} bytes, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },

    /// A `[string]` was not valid UTF-8.
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error that occurred while serializing a request body.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlRequestSerializationError {
    /// A collection or string is too long to be described by its length prefix.
    #[error("Request field {field} is too long: {err}")]
    FieldTooLong {
        field: &'static str,
        err: std::num::TryFromIntError,
    },

    /// The encoded body does not fit the frame length field.
    #[error("Request body of {0} bytes is too large for a single frame")]
    BodyTooLarge(usize),
}

/// An error that occurred while serializing a response body.
/// Only servers (and test doubles playing one) build responses.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlResponseSerializationError {
    #[error("Response field {field} is too long: {err}")]
    FieldTooLong {
        field: &'static str,
        err: std::num::TryFromIntError,
    },
}

/// An error that occurred while parsing the body of a response
/// received during connection setup.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize ERROR response: {0}")]
    Error(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    Authenticate(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTH_CHALLENGE response: {0}")]
    AuthChallenge(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTH_SUCCESS response: {0}")]
    AuthSuccess(LowLevelDeserializationError),
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    Supported(LowLevelDeserializationError),
    #[error(transparent)]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Response opcode {0:?} is not expected during connection setup")]
    NotASetupResponse(ResponseOpcode),
}

/// An error that occurred while parsing the body of a request.
/// Used by servers (and by test doubles that play one).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum RequestDeserializationError {
    #[error(transparent)]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error(transparent)]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Request opcode {0:?} is not a connection setup request")]
    NotASetupRequest(RequestOpcode),
}
