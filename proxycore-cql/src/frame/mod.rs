pub mod frame_errors;
pub mod request;
pub mod response;
pub mod types;

use crate::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseSerializationError, FrameError,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use std::fmt::Display;

use request::SerializableRequest;
use response::SerializableResponse;

pub(crate) const HEADER_SIZE: usize = 9;

/// Maximum body length accepted by Cassandra for a single frame (256 MiB).
pub const MAX_BODY_LENGTH: usize = 256 * 1024 * 1024;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;
pub const FLAG_BETA: u8 = 0x10;

const DIRECTION_MASK: u8 = 0x80;
const VERSION_MASK: u8 = 0x7F;

/// Native protocol versions that share the 9-byte frame header.
///
/// Versions 1 and 2 use an 8-byte header and are not understood by this crate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V3 = 0x03,
    V4 = 0x04,
    V5 = 0x05,
}

impl ProtocolVersion {
    /// The raw version number as it appears in the frame header
    /// (without the direction bit).
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether frames keep the legacy layout after the connection becomes ready.
    ///
    /// From v5 on, everything after READY/AUTH_SUCCESS is wrapped in checksummed
    /// segments, which this crate does not implement.
    pub fn uses_legacy_framing(self) -> bool {
        self < ProtocolVersion::V5
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Self::V3),
            0x04 => Ok(Self::V4),
            0x05 => Ok(Self::V5),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: value,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Which side of the connection produced a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameDirection {
    Request,
    Response,
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl FrameParams {
    pub fn new(version: ProtocolVersion, direction: FrameDirection, stream: i16) -> Self {
        let version = match direction {
            FrameDirection::Request => version.as_u8(),
            FrameDirection::Response => DIRECTION_MASK | version.as_u8(),
        };
        Self {
            version,
            flags: 0,
            stream,
        }
    }

    pub fn direction(&self) -> FrameDirection {
        if self.version & DIRECTION_MASK != 0 {
            FrameDirection::Response
        } else {
            FrameDirection::Request
        }
    }

    /// The header version with the direction bit stripped.
    pub fn raw_version(&self) -> u8 {
        self.version & VERSION_MASK
    }

    pub fn protocol_version(&self) -> Result<ProtocolVersion, FrameError> {
        ProtocolVersion::try_from(self.raw_version())
            .map_err(|_| FrameError::VersionNotSupported(self.raw_version()))
    }

    pub const fn for_request(&self) -> FrameParams {
        Self {
            version: self.version & VERSION_MASK,
            ..*self
        }
    }

    pub const fn for_response(&self) -> FrameParams {
        Self {
            version: DIRECTION_MASK | (self.version & VERSION_MASK),
            ..*self
        }
    }
}

/// A whole native-protocol frame with an uninterpreted body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub params: FrameParams,
    pub opcode: u8,
    pub body: Bytes,
}

impl Frame {
    /// Builds a request frame from a typed request.
    pub fn from_request<R: SerializableRequest>(
        version: ProtocolVersion,
        stream: i16,
        request: &R,
    ) -> Result<Frame, CqlRequestSerializationError> {
        let mut body = Vec::new();
        request.serialize(&mut body)?;
        if body.len() > MAX_BODY_LENGTH {
            return Err(CqlRequestSerializationError::BodyTooLarge(body.len()));
        }

        Ok(Frame {
            params: FrameParams::new(version, FrameDirection::Request, stream),
            opcode: R::OPCODE as u8,
            body: body.into(),
        })
    }

    /// Builds a response frame answering the request with `request_params`.
    pub fn from_response<R: SerializableResponse>(
        request_params: FrameParams,
        response: &R,
    ) -> Result<Frame, CqlResponseSerializationError> {
        let mut body = Vec::new();
        response.serialize(&mut body)?;

        Ok(Frame {
            params: FrameParams {
                flags: 0,
                ..request_params.for_response()
            },
            opcode: R::OPCODE as u8,
            body: body.into(),
        })
    }

    /// Appends the encoded frame to `out`.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.params.version);
        out.put_u8(self.params.flags);
        out.put_i16(self.params.stream);
        out.put_u8(self.opcode);
        // Length is bounded by MAX_BODY_LENGTH on every construction path.
        out.put_u32(self.body.len() as u32);
        out.put_slice(&self.body);
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Decodes one frame from the front of `buf`, if a whole frame is buffered.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is still
    /// incomplete. The header is validated as soon as it is available, so a
    /// garbage stream is rejected without waiting for a bogus body.
    pub fn decode(
        buf: &mut BytesMut,
        expected: FrameDirection,
    ) -> Result<Option<Frame>, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..HEADER_SIZE];
        let (params, opcode, length) = parse_header(&mut header, expected)?;

        if buf.len() < HEADER_SIZE + length {
            buf.reserve(HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let body = buf.split_to(length).freeze();

        Ok(Some(Frame {
            params,
            opcode,
            body,
        }))
    }
}

fn parse_header(
    buf: &mut &[u8],
    expected: FrameDirection,
) -> Result<(FrameParams, u8, usize), FrameError> {
    let version = buf.get_u8();
    let flags = buf.get_u8();
    let stream = buf.get_i16();
    let opcode = buf.get_u8();
    let length = buf.get_u32() as usize;

    let params = FrameParams {
        version,
        flags,
        stream,
    };

    if params.direction() != expected {
        return Err(FrameError::UnexpectedDirection(version));
    }
    params.protocol_version()?;
    if length > MAX_BODY_LENGTH {
        return Err(FrameError::BodyTooLarge(length));
    }

    Ok((params, opcode, length))
}

/// Reads exactly one frame from `reader`.
pub async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    expected: FrameDirection,
) -> Result<Frame, FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let (params, opcode, length) = parse_header(&mut &raw_header[..], expected)?;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok(Frame {
        params,
        opcode,
        body: raw_body.into_inner().into(),
    })
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
