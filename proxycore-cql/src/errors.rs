//! Server-side error codes carried by `ERROR` responses.

use thiserror::Error;

/// An error reported by the server in an `ERROR` frame.
///
/// Only the error code is interpreted. Code-specific trailing fields
/// (consistency levels, replica counts...) never appear during connection
/// setup, so they are not modelled and are skipped when parsing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DbError {
    /// Something unexpected happened on the server side
    #[error("Internal server error")]
    ServerError,

    /// A protocol violation by the client, including an unsupported
    /// protocol version in the frame header
    #[error("Protocol error")]
    ProtocolError,

    /// Authentication failed - bad credentials
    #[error("Authentication failed - bad credentials")]
    AuthenticationError,

    /// Not enough replicas alive to satisfy the consistency level
    #[error("Not enough nodes are alive to satisfy required consistency level")]
    Unavailable,

    /// The request cannot be processed because the coordinator is overloaded
    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,

    /// The coordinator node is still bootstrapping
    #[error("The coordinator node is still bootstrapping")]
    IsBootstrapping,

    #[error("Error during truncate operation")]
    TruncateError,

    #[error("Timeout during a write request")]
    WriteTimeout,

    #[error("Timeout during a read request")]
    ReadTimeout,

    #[error("A non-timeout error during a read request")]
    ReadFailure,

    #[error("User defined function failed during execution")]
    FunctionFailure,

    #[error("A non-timeout error during a write request")]
    WriteFailure,

    #[error("The submitted query has a syntax error")]
    SyntaxError,

    /// The logged user doesn't have the right to perform the query
    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,

    #[error("The query is syntactically correct but invalid")]
    Invalid,

    #[error("The query is invalid because of some configuration issue")]
    ConfigError,

    #[error("Attempted to create a keyspace or a table that was already existing")]
    AlreadyExists,

    #[error("Tried to execute a prepared statement that is not prepared")]
    Unprepared,

    /// Error code not known to this crate
    #[error("Other error not covered by the protocol, error code: {0}")]
    Other(i32),
}

impl DbError {
    pub fn from_code(code: i32) -> DbError {
        match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable,
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout,
            0x1200 => DbError::ReadTimeout,
            0x1300 => DbError::ReadFailure,
            0x1400 => DbError::FunctionFailure,
            0x1500 => DbError::WriteFailure,
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists,
            0x2500 => DbError::Unprepared,
            other => DbError::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout => 0x1100,
            DbError::ReadTimeout => 0x1200,
            DbError::ReadFailure => 0x1300,
            DbError::FunctionFailure => 0x1400,
            DbError::WriteFailure => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists => 0x2400,
            DbError::Unprepared => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}
