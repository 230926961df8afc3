//! Protocol version and authentication negotiation on a freshly opened
//! connection.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use proxycore_cql::errors::DbError;
use proxycore_cql::frame::frame_errors::CqlResponseParseError;
use proxycore_cql::frame::request::{options, AuthResponse, SerializableRequest, Startup};
use proxycore_cql::frame::response::{Authenticate, Error, Response};
use proxycore_cql::frame::{Frame, FrameParams};
use proxycore_cql::ProtocolVersion;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::connection::Connection;
use super::frames::InboundFrames;
use crate::authentication::AuthProvider;
use crate::errors::{AuthError, ConnectionError, HandshakeError, VersionError};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// All handshake requests go out on this stream.
const HANDSHAKE_STREAM: i16 = 0;

/// Options sent in the `STARTUP` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupOptions {
    options: HashMap<String, String>,
}

impl Default for StartupOptions {
    fn default() -> Self {
        let options = [
            (options::CQL_VERSION, options::DEFAULT_CQL_VERSION),
            (options::DRIVER_NAME, options::DEFAULT_DRIVER_NAME),
            (options::DRIVER_VERSION, options::DEFAULT_DRIVER_VERSION),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        Self { options }
    }
}

impl StartupOptions {
    /// Sets an option, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    fn to_startup(&self) -> Startup<'_> {
        Startup {
            options: self
                .options
                .iter()
                .map(|(k, v)| (Cow::Borrowed(k.as_str()), Cow::Borrowed(v.as_str())))
                .collect(),
        }
    }
}

/// How authentication went during a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The server answered `STARTUP` with `READY`.
    NotRequired,
    /// The server demanded authentication with the named authenticator and
    /// accepted the credentials.
    Authenticated { authenticator: String },
}

/// The outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    pub version: ProtocolVersion,
    pub auth: AuthOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Start,
    VersionProposed,
    AuthRequested,
    Authenticating,
    Ready,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Start => "Start",
            HandshakeState::VersionProposed => "VersionProposed",
            HandshakeState::AuthRequested => "AuthRequested",
            HandshakeState::Authenticating => "Authenticating",
            HandshakeState::Ready => "Ready",
            HandshakeState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Negotiates the protocol version and authenticates on `connection`.
///
/// `frames` must be the inbound side of the [`FrameReceiver`](super::FrameReceiver)
/// the connection was opened with. If the server rejects `version` and
/// proposes a lower one, the handshake is retried once at that version.
///
/// Frames already waiting in `frames` are discarded before the first request.
/// On failure the connection is left open; closing it is up to the caller.
/// A reply to a timed out attempt may still be in flight, so a retry on the
/// same connection is only safe once that reply has arrived.
pub async fn perform_handshake(
    connection: &Connection,
    frames: &mut InboundFrames,
    version: ProtocolVersion,
    auth: &dyn AuthProvider,
    options: &StartupOptions,
    timeout: Duration,
) -> Result<HandshakeResult, HandshakeError> {
    if !version.uses_legacy_framing() {
        return Err(VersionError::NotNegotiable(version).into());
    }

    // Replies to an earlier, abandoned handshake would be taken for ours.
    let stale = frames.discard_pending();
    if stale > 0 {
        trace!("Discarded {} stale frames from {}", stale, connection.endpoint());
    }

    let deadline = Instant::now() + timeout;
    let mut handshake = Handshake {
        connection,
        frames,
        auth,
        options,
        initial_version: version,
        version,
        downgraded: false,
        state: HandshakeState::Start,
    };

    let result = match tokio::time::timeout_at(deadline, handshake.negotiate()).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout(timeout)),
    };
    match &result {
        Ok(negotiated) => {
            handshake.transition(HandshakeState::Ready);
            debug!(
                "Handshake with {} finished: protocol {}, {:?}",
                connection.endpoint(),
                negotiated.version,
                negotiated.auth
            );
        }
        Err(err) => {
            handshake.transition(HandshakeState::Failed);
            debug!("Handshake with {} failed: {}", connection.endpoint(), err);
        }
    }
    result
}

struct Handshake<'a> {
    connection: &'a Connection,
    frames: &'a mut InboundFrames,
    auth: &'a dyn AuthProvider,
    options: &'a StartupOptions,
    initial_version: ProtocolVersion,
    version: ProtocolVersion,
    downgraded: bool,
    state: HandshakeState,
}

struct ReceivedResponse {
    params: FrameParams,
    opcode: u8,
    response: Response,
}

impl Handshake<'_> {
    fn transition(&mut self, next: HandshakeState) {
        trace!(
            "Handshake with {}: {} -> {}",
            self.connection.endpoint(),
            self.state,
            next
        );
        self.state = next;
    }

    async fn negotiate(&mut self) -> Result<HandshakeResult, HandshakeError> {
        loop {
            self.send(&self.options.to_startup())?;
            self.transition(HandshakeState::VersionProposed);

            let received = self.next_response().await?;
            match received.response {
                Response::Ready => {
                    return Ok(HandshakeResult {
                        version: self.version,
                        auth: AuthOutcome::NotRequired,
                    })
                }
                Response::Authenticate(authenticate) => {
                    self.transition(HandshakeState::AuthRequested);
                    let authenticator = self.authenticate(authenticate).await?;
                    return Ok(HandshakeResult {
                        version: self.version,
                        auth: AuthOutcome::Authenticated { authenticator },
                    });
                }
                Response::Error(error) if is_version_mismatch(&error) => {
                    self.downgrade(received.params, error)?;
                    self.transition(HandshakeState::Start);
                }
                Response::Error(Error { error, reason }) => {
                    return Err(HandshakeError::Db(error, reason))
                }
                _ => return Err(HandshakeError::UnexpectedResponse(received.opcode)),
            }
        }
    }

    fn downgrade(&mut self, params: FrameParams, error: Error) -> Result<(), VersionError> {
        if self.downgraded {
            return Err(VersionError::RepeatedMismatch {
                initial: self.initial_version,
                requested: self.version,
                reason: error.reason,
            });
        }

        let proposed = proposed_version(params.raw_version(), self.version, &error.reason);
        match proposed.and_then(|v| ProtocolVersion::try_from(v).ok()) {
            Some(lower) if lower < self.version && lower.uses_legacy_framing() => {
                debug!(
                    "{} rejected protocol {}, retrying with {}",
                    self.connection.endpoint(),
                    self.version,
                    lower
                );
                self.version = lower;
                self.downgraded = true;
                Ok(())
            }
            _ => Err(VersionError::Unsupported {
                requested: self.version,
                proposed,
                reason: error.reason,
            }),
        }
    }

    async fn authenticate(&mut self, authenticate: Authenticate) -> Result<String, HandshakeError> {
        let authenticator = authenticate.authenticator_name;
        self.transition(HandshakeState::Authenticating);

        let (mut response, mut session) = self
            .auth
            .start_authentication_session(&authenticator)
            .await?;

        loop {
            self.send(&AuthResponse { response })?;
            let received = self.next_response().await?;
            match received.response {
                Response::AuthChallenge(challenge) => {
                    trace!("{} sent another challenge", self.connection.endpoint());
                    response = session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await?;
                }
                Response::AuthSuccess(success) => {
                    session
                        .success(success.success_message.as_deref())
                        .await?;
                    return Ok(authenticator);
                }
                Response::Error(Error {
                    error: DbError::AuthenticationError,
                    reason,
                }) => {
                    return Err(AuthError {
                        authenticator,
                        reason,
                    }
                    .into())
                }
                Response::Error(Error { error, reason }) => {
                    return Err(HandshakeError::Db(error, reason))
                }
                _ => return Err(HandshakeError::UnexpectedResponse(received.opcode)),
            }
        }
    }

    fn send(&self, request: &impl SerializableRequest) -> Result<(), HandshakeError> {
        let frame = Frame::from_request(self.version, HANDSHAKE_STREAM, request)?;
        self.connection.write(frame)?;
        Ok(())
    }

    async fn next_response(&mut self) -> Result<ReceivedResponse, HandshakeError> {
        loop {
            let Some(frame) = self.frames.next().await else {
                let err = self.connection.err().unwrap_or(ConnectionError::Closed);
                return Err(err.into());
            };

            if frame.params.stream < 0 {
                trace!("Ignoring event frame on stream {}", frame.params.stream);
                continue;
            }
            if frame.params.stream != HANDSHAKE_STREAM {
                return Err(HandshakeError::UnexpectedStream(frame.params.stream));
            }

            let response = match Response::from_raw(frame.opcode, &frame.body) {
                Ok(response) => response,
                Err(
                    CqlResponseParseError::NotASetupResponse(_)
                    | CqlResponseParseError::UnknownOpcode(_),
                ) => return Err(HandshakeError::UnexpectedResponse(frame.opcode)),
                Err(err) => return Err(err.into()),
            };
            return Ok(ReceivedResponse {
                params: frame.params,
                opcode: frame.opcode,
                response,
            });
        }
    }
}

fn is_version_mismatch(error: &Error) -> bool {
    error.error == DbError::ProtocolError
        && error.reason.to_ascii_lowercase().contains("protocol version")
}

/// The version the server wants instead of `requested`.
///
/// Servers answer in the highest version they support, so a lower header
/// version is the proposal. Otherwise the message is searched for the usual
/// "greatest is N" / "highest supported version is N" wording.
fn proposed_version(header_version: u8, requested: ProtocolVersion, reason: &str) -> Option<u8> {
    if header_version < requested.as_u8() {
        return Some(header_version);
    }

    let reason = reason.to_ascii_lowercase();
    ["greatest is ", "highest supported version is "]
        .iter()
        .find_map(|hint| {
            let rest = &reason[reason.find(hint)? + hint.len()..];
            let rest = rest.strip_prefix('v').unwrap_or(rest);
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
}
