//! Errors returned by the connection core.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proxycore_cql::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameError,
};
use proxycore_cql::ProtocolVersion;
use thiserror::Error;

use crate::network::tls::TlsError;
use crate::network::Endpoint;

pub use proxycore_cql::errors::DbError;

/// Boxed error returned by user-provided connection callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Failure to open a socket to an endpoint.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectError {
    /// The endpoint actively refused the connection.
    #[error("Connection to {0} was refused")]
    Refused(SocketAddr),

    /// Establishing the connection (TCP and TLS) did not finish in time.
    #[error("Connecting did not finish within {0:?}")]
    Timeout(Duration),

    /// The host name could not be resolved to any address.
    #[error("Failed to resolve {host}: {reason}")]
    Dns { host: String, reason: String },

    /// The TLS handshake failed or the TLS configuration is unusable.
    #[error("TLS error: {0}")]
    Tls(Arc<std::io::Error>),

    /// Any other I/O error while connecting.
    #[error("I/O error while connecting: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<TlsError> for ConnectError {
    fn from(value: TlsError) -> Self {
        ConnectError::Tls(Arc::new(value.into()))
    }
}

/// An error recorded on a [`Connection`](crate::network::Connection).
///
/// A connection records at most one error: the first fatal one. It can
/// be read with [`Connection::err`](crate::network::Connection::err).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The connection is closing or closed and accepts no more writes.
    #[error("Connection is closed")]
    Closed,

    /// The connection broke.
    #[error("Connection broken: {0}")]
    Broken(#[from] BrokenConnectionErrorKind),
}

/// The reason a connection broke.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// The peer closed its side of the connection.
    #[error("Connection closed by peer")]
    PeerClosed,

    /// Reading from the socket failed (e.g. connection reset).
    #[error("Failed to read from the socket: {0}")]
    ReadError(Arc<std::io::Error>),

    /// Writing to the socket failed.
    #[error("Failed to write to the socket: {0}")]
    WriteError(Arc<std::io::Error>),

    /// A sender failed to produce its bytes.
    #[error("Sender failed: {0}")]
    SenderFailed(Arc<dyn std::error::Error + Send + Sync>),

    /// The receiver could not consume inbound data.
    #[error("Receiver failed: {0}")]
    ReceiverFailed(Arc<dyn std::error::Error + Send + Sync>),

    /// Queued senders could not be flushed within the close timeout after a
    /// graceful close was requested; the socket was dropped.
    #[error("Closing did not finish within {0:?}")]
    CloseTimeout(Duration),

    /// Inbound data was not a valid frame.
    #[error("Failed to decode a frame: {0}")]
    FrameDecodeError(#[from] FrameError),
}

/// Failure to produce credentials for an authentication challenge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to produce credentials: {0}")]
pub struct CredentialsError(pub String);

/// The server rejected the presented credentials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Authentication with {authenticator} failed: {reason}")]
pub struct AuthError {
    /// Authenticator class the server asked for.
    pub authenticator: String,
    /// Message of the server's `ERROR` response.
    pub reason: String,
}

/// Protocol version negotiation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VersionError {
    /// The requested version is recognised but cannot be negotiated.
    #[error("Protocol version {0} cannot be negotiated")]
    NotNegotiable(ProtocolVersion),

    /// The server rejected the version and its proposal cannot be used.
    #[error("Server rejected protocol {requested} and proposed {proposed:?}: {reason}")]
    Unsupported {
        requested: ProtocolVersion,
        proposed: Option<u8>,
        reason: String,
    },

    /// The server rejected the version again after one downgrade.
    #[error("Server rejected protocol {requested} after a downgrade from {initial}: {reason}")]
    RepeatedMismatch {
        initial: ProtocolVersion,
        requested: ProtocolVersion,
        reason: String,
    },
}

/// Failure of the version and authentication negotiation on one connection.
///
/// A failed handshake leaves its connection open; closing it is up to the caller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    /// The handshake did not finish before its deadline.
    #[error("Handshake did not finish within {0:?}")]
    Timeout(Duration),

    /// Database sent an `ERROR` that does not fit any other category
    #[error("Database returned an error: {0}, Error message: {1}")]
    Db(DbError, String),

    /// The server answered with a response that makes no sense at this point.
    #[error("Unexpected response opcode {0:#04x} during handshake")]
    UnexpectedResponse(u8),

    /// A response arrived on a stream no request was sent on.
    #[error("Unexpected stream id {0} during handshake")]
    UnexpectedStream(i16),

    #[error("Failed to parse handshake response: {0}")]
    ResponseParse(#[from] CqlResponseParseError),

    #[error("Failed to serialize handshake request: {0}")]
    RequestSerialization(#[from] CqlRequestSerializationError),

    /// The connection broke or was closed during the handshake.
    #[error("Connection failed during handshake: {0}")]
    Connection(#[from] ConnectionError),
}

/// Why a single endpoint could not be used.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AttemptError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// A failed attempt to connect to one endpoint.
#[derive(Error, Debug, Clone)]
#[error("{endpoint}: {error}")]
pub struct EndpointAttemptError {
    pub endpoint: Endpoint,
    pub error: AttemptError,
}

/// None of the endpoints could be connected to.
#[derive(Error, Debug, Clone)]
pub struct ClusterConnectError {
    /// One entry per endpoint, in the order they were tried.
    pub attempts: Vec<EndpointAttemptError>,
}

impl fmt::Display for ClusterConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "Unable to connect to the cluster: no endpoints to try");
        }
        write!(
            f,
            "Unable to connect to any of {} endpoints",
            self.attempts.len()
        )?;
        for attempt in &self.attempts {
            write!(f, "; {attempt}")?;
        }
        Ok(())
    }
}

/// Error returned by [`ClusterConnector::connect`](crate::cluster::ClusterConnector::connect).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectToClusterError {
    /// Cancellation was requested before the next endpoint was tried.
    #[error("Connecting to the cluster was cancelled after {} failed attempts", .attempts.len())]
    Cancelled { attempts: Vec<EndpointAttemptError> },

    #[error(transparent)]
    Exhausted(#[from] ClusterConnectError),
}

/// A secure connect bundle could not be loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BundleError {
    /// The archive or its config is unreadable.
    #[error("Bundle is corrupt: {0}")]
    Corrupt(String),

    /// A required config field or archive entry is absent.
    #[error("Bundle is missing {0}")]
    MissingField(String),

    /// A certificate or key could not be parsed.
    #[error("Bundle entry {entry} is not a valid certificate or key: {reason}")]
    BadCert { entry: String, reason: String },
}

/// Contact points could not be resolved from the metadata service.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ResolveError {
    /// The metadata service could not be reached or failed to answer.
    #[error("Metadata service at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    /// The metadata service rejected the bundle's credentials.
    #[error("Metadata service rejected the bundle credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    /// The answer could not be turned into contact points.
    #[error("Malformed metadata response: {0}")]
    MalformedResponse(String),

    /// The bundle's TLS material does not form a usable client context.
    #[error("Failed to set up TLS from the bundle: {0}")]
    Tls(#[from] TlsError),
}

/// Error of [`connect_with_bundle`](crate::cluster::connect_with_bundle),
/// naming the phase that failed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyCoreError {
    #[error("Unable to load bundle: {0}")]
    Bundle(#[from] BundleError),
    #[error("Unable to resolve endpoints: {0}")]
    Resolve(#[from] ResolveError),
    #[error("Unable to connect to cluster: {0}")]
    Cluster(#[from] ConnectToClusterError),
}
