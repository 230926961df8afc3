//! Connecting to a cluster: trying contact points in order until one of
//! them accepts a handshake.

use std::path::PathBuf;
use std::time::Duration;

use proxycore_cql::ProtocolVersion;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authentication::AuthProvider;
use crate::cloud::{load_bundle, resolve_astra};
use crate::errors::{
    AttemptError, ClusterConnectError, ConnectError, ConnectToClusterError, EndpointAttemptError,
    HandshakeError, ProxyCoreError,
};
use crate::network::tls::TlsConfig;
use crate::network::{
    perform_handshake, Connection, ConnectionConfig, Endpoint, EndpointFactory, FrameReceiver,
    HandshakeResult, InboundFrames, StartupOptions, DEFAULT_HANDSHAKE_TIMEOUT,
};

/// An open connection on which no handshake has been performed yet.
#[derive(Debug)]
pub struct ClientConnection {
    connection: Connection,
    frames: InboundFrames,
}

impl ClientConnection {
    /// Negotiates the protocol version and authenticates.
    ///
    /// On failure the connection stays open and should be closed. A reply to
    /// the failed attempt may still arrive and would confuse a second one.
    pub async fn handshake(
        &mut self,
        version: ProtocolVersion,
        auth: &dyn AuthProvider,
        options: &StartupOptions,
        timeout: Duration,
    ) -> Result<HandshakeResult, HandshakeError> {
        perform_handshake(
            &self.connection,
            &mut self.frames,
            version,
            auth,
            options,
            timeout,
        )
        .await
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn into_parts(self) -> (Connection, InboundFrames) {
        (self.connection, self.frames)
    }
}

/// Opens a connection to a single endpoint whose inbound bytes are decoded
/// into frames. No handshake is performed.
pub async fn cluster_connect(
    endpoint: &Endpoint,
    tls_config: Option<TlsConfig>,
    config: &ConnectionConfig,
) -> Result<ClientConnection, ConnectError> {
    let (receiver, frames) = FrameReceiver::new();
    let connection = Connection::connect(endpoint, tls_config, Box::new(receiver), config).await?;
    Ok(ClientConnection { connection, frames })
}

/// A handshaken connection to one node of the cluster.
#[derive(Debug)]
pub struct ClusterConnection {
    connection: Connection,
    frames: InboundFrames,
    result: HandshakeResult,
    endpoint: Endpoint,
    failed_attempts: Vec<EndpointAttemptError>,
}

impl ClusterConnection {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Frames received after the handshake.
    pub fn frames(&mut self) -> &mut InboundFrames {
        &mut self.frames
    }

    pub fn result(&self) -> &HandshakeResult {
        &self.result
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.result.version
    }

    /// The endpoint the connection was made to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Why each endpoint tried before this one was not used, in order.
    pub fn failed_attempts(&self) -> &[EndpointAttemptError] {
        &self.failed_attempts
    }

    pub fn into_parts(self) -> (Connection, InboundFrames) {
        (self.connection, self.frames)
    }
}

/// Builds a [`ClusterConnector`].
///
/// # Example
/// ```
/// # use proxycore::cluster::ClusterConnectorBuilder;
/// # use std::time::Duration;
/// let connector = ClusterConnectorBuilder::new()
///     .connect_timeout(Duration::from_secs(3))
///     .handshake_timeout(Duration::from_secs(5))
///     .startup_option("DRIVER_NAME", "my-proxy")
///     .build();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ClusterConnectorBuilder {
    config: ClusterConnector,
}

impl ClusterConnectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_config(mut self, connection_config: ConnectionConfig) -> Self {
        self.config.connection_config = connection_config;
        self
    }

    /// Shorthand for setting [`ConnectionConfig::connect_timeout`].
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_config.connect_timeout = timeout;
        self
    }

    /// Bound on the whole handshake with one endpoint.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Sets an option sent in `STARTUP`.
    pub fn startup_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.startup_options.insert(key, value);
        self
    }

    pub fn build(self) -> ClusterConnector {
        self.config
    }
}

/// Connects to the first contact point of an [`EndpointFactory`] that
/// accepts a connection and a handshake.
///
/// Contact points are tried one at a time, in the factory's order. A single
/// call makes one pass over them; whether to re-resolve and try again is up
/// to the caller.
#[derive(Debug, Clone)]
pub struct ClusterConnector {
    connection_config: ConnectionConfig,
    handshake_timeout: Duration,
    startup_options: StartupOptions,
}

impl Default for ClusterConnector {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            startup_options: StartupOptions::default(),
        }
    }
}

impl ClusterConnector {
    pub fn builder() -> ClusterConnectorBuilder {
        ClusterConnectorBuilder::new()
    }

    /// Tries the contact points until one of them handshakes at `version`
    /// (or the version the node downgrades to).
    ///
    /// `cancel` is checked before each endpoint is tried; once it is
    /// cancelled no new connection is opened. An attempt in progress is
    /// not interrupted.
    pub async fn connect(
        &self,
        version: ProtocolVersion,
        auth: &dyn AuthProvider,
        factory: &EndpointFactory,
        cancel: Option<&CancellationToken>,
    ) -> Result<ClusterConnection, ConnectToClusterError> {
        let mut attempts = Vec::new();

        for endpoint in factory.contact_points() {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                info!(
                    "Connecting to the cluster cancelled after {} failed attempts",
                    attempts.len()
                );
                return Err(ConnectToClusterError::Cancelled { attempts });
            }

            debug!("Trying endpoint {}", endpoint);
            match self.try_endpoint(endpoint, version, auth, factory).await {
                Ok((client, result)) => {
                    info!(
                        "Connected to {} with protocol {} after {} failed attempts",
                        endpoint,
                        result.version,
                        attempts.len()
                    );
                    let (connection, frames) = client.into_parts();
                    return Ok(ClusterConnection {
                        connection,
                        frames,
                        result,
                        endpoint: endpoint.clone(),
                        failed_attempts: attempts,
                    });
                }
                Err(error) => {
                    warn!("Unable to use endpoint {}: {}", endpoint, error);
                    attempts.push(EndpointAttemptError {
                        endpoint: endpoint.clone(),
                        error,
                    });
                }
            }
        }

        Err(ClusterConnectError { attempts }.into())
    }

    async fn try_endpoint(
        &self,
        endpoint: &Endpoint,
        version: ProtocolVersion,
        auth: &dyn AuthProvider,
        factory: &EndpointFactory,
    ) -> Result<(ClientConnection, HandshakeResult), AttemptError> {
        let tls_config = factory.tls_config_for(endpoint);
        let mut client = cluster_connect(endpoint, tls_config, &self.connection_config).await?;

        match client
            .handshake(
                version,
                auth,
                &self.startup_options,
                self.handshake_timeout,
            )
            .await
        {
            Ok(result) => Ok((client, result)),
            Err(err) => {
                client.connection().close();
                Err(err.into())
            }
        }
    }
}

/// Connects with the default [`ClusterConnector`] configuration.
pub async fn connect_to_cluster(
    version: ProtocolVersion,
    auth: &dyn AuthProvider,
    factory: &EndpointFactory,
    cancel: Option<&CancellationToken>,
) -> Result<ClusterConnection, ConnectToClusterError> {
    ClusterConnector::default()
        .connect(version, auth, factory, cancel)
        .await
}

/// Loads a secure connect bundle, resolves its contact points and connects
/// to the cluster.
pub async fn connect_with_bundle(
    path: impl Into<PathBuf>,
    version: ProtocolVersion,
    auth: &dyn AuthProvider,
    cancel: Option<&CancellationToken>,
) -> Result<ClusterConnection, ProxyCoreError> {
    let bundle = load_bundle(path).await?;
    let factory = resolve_astra(&bundle).await?;
    Ok(connect_to_cluster(version, auth, &factory, cancel).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authentication::{AuthSession, PlainTextAuthenticator};
    use crate::errors::{AuthError, CredentialsError, VersionError};
    use crate::network::AuthOutcome;
    use crate::test_utils::{
        bundle_zip, refused_endpoint, setup_tracing, MockBehavior, MockCql, MockMetadataServer,
        MockNode, TestPki,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;
    use std::io::Write;

    fn authenticating_node() -> MockBehavior {
        MockBehavior::Cql(MockCql::default().with_credentials("user", "pass"))
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn silent_node_is_skipped_after_handshake_timeout() {
        setup_tracing();
        let silent = MockNode::start(MockBehavior::Silent).await;
        let healthy = MockNode::start(authenticating_node()).await;
        let factory = EndpointFactory::new(vec![silent.endpoint(), healthy.endpoint()]);
        let auth = PlainTextAuthenticator::new("user", "pass");

        let connector = ClusterConnector::builder()
            .handshake_timeout(Duration::from_secs(1))
            .build();
        let cluster = connector
            .connect(ProtocolVersion::V4, &auth, &factory, None)
            .await
            .unwrap();

        assert_eq!(cluster.version(), ProtocolVersion::V4);
        assert_eq!(cluster.endpoint(), &healthy.endpoint());
        assert_matches!(
            &cluster.result().auth,
            AuthOutcome::Authenticated { .. }
        );
        assert!(cluster.connection().err().is_none());
        assert_eq!(cluster.failed_attempts().len(), 1);
        assert_matches!(
            &cluster.failed_attempts()[0].error,
            AttemptError::Handshake(HandshakeError::Timeout(_))
        );
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn unreachable_endpoints_are_recorded_in_order() {
        setup_tracing();
        let node = MockNode::start(authenticating_node()).await;
        let refused = vec![refused_endpoint().await, refused_endpoint().await];
        let mut endpoints = refused.clone();
        endpoints.push(node.endpoint());
        let auth = PlainTextAuthenticator::new("user", "pass");

        let cluster = connect_to_cluster(
            ProtocolVersion::V4,
            &auth,
            &EndpointFactory::new(endpoints),
            None,
        )
        .await
        .unwrap();

        let failed: Vec<_> = cluster
            .failed_attempts()
            .iter()
            .map(|attempt| attempt.endpoint.clone())
            .collect();
        assert_eq!(failed, refused);
        for attempt in cluster.failed_attempts() {
            assert_matches!(attempt.error, AttemptError::Connect(ConnectError::Refused(_)));
        }
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn exhausted_endpoints_are_aggregated() {
        setup_tracing();
        let bad_version = MockNode::start(MockBehavior::Cql(
            MockCql::default().with_max_version(3).rejecting_all_versions(),
        ))
        .await;
        let endpoints = vec![
            refused_endpoint().await,
            bad_version.endpoint(),
            refused_endpoint().await,
        ];
        let auth = PlainTextAuthenticator::new("user", "pass");

        let err = connect_to_cluster(
            ProtocolVersion::V4,
            &auth,
            &EndpointFactory::new(endpoints.clone()),
            None,
        )
        .await
        .unwrap_err();

        let attempts = match err {
            ConnectToClusterError::Exhausted(ClusterConnectError { attempts }) => attempts,
            other => panic!("expected exhausted endpoints, got {other:?}"),
        };
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().map(|a| a.endpoint.clone()).collect::<Vec<_>>(),
            endpoints
        );
        assert_matches!(
            attempts[1].error,
            AttemptError::Handshake(HandshakeError::Version(
                VersionError::RepeatedMismatch { .. }
            ))
        );
    }

    #[tokio::test]
    async fn empty_factory_fails_with_no_attempts() {
        let auth = PlainTextAuthenticator::new("user", "pass");
        let err = connect_to_cluster(ProtocolVersion::V4, &auth, &EndpointFactory::new(vec![]), None)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ConnectToClusterError::Exhausted(ClusterConnectError { attempts }) if attempts.is_empty()
        );
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn cancelled_before_first_attempt_opens_no_socket() {
        setup_tracing();
        let node = MockNode::start(authenticating_node()).await;
        let auth = PlainTextAuthenticator::new("user", "pass");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = connect_to_cluster(
            ProtocolVersion::V4,
            &auth,
            &EndpointFactory::new(vec![node.endpoint()]),
            Some(&cancel),
        )
        .await
        .unwrap_err();
        assert_matches!(err, ConnectToClusterError::Cancelled { attempts } if attempts.is_empty());
        tokio::task::yield_now().await;
        assert_eq!(node.accepted(), 0);
    }

    /// Cancels the token as soon as it is asked for credentials, then
    /// answers with a wrong password.
    struct CancellingAuth(CancellationToken);

    #[async_trait]
    impl AuthProvider for CancellingAuth {
        async fn start_authentication_session(
            &self,
            authenticator_name: &str,
        ) -> Result<(Option<Vec<u8>>, Box<dyn AuthSession>), CredentialsError> {
            self.0.cancel();
            PlainTextAuthenticator::new("user", "wrong")
                .start_authentication_session(authenticator_name)
                .await
        }
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn cancellation_is_checked_between_attempts() {
        setup_tracing();
        let first = MockNode::start(authenticating_node()).await;
        let second = MockNode::start(authenticating_node()).await;
        let cancel = CancellationToken::new();
        let auth = CancellingAuth(cancel.clone());

        let err = connect_to_cluster(
            ProtocolVersion::V4,
            &auth,
            &EndpointFactory::new(vec![first.endpoint(), second.endpoint()]),
            Some(&cancel),
        )
        .await
        .unwrap_err();

        // The attempt in progress ran to completion.
        let attempts = match err {
            ConnectToClusterError::Cancelled { attempts } => attempts,
            other => panic!("expected cancellation, got {other:?}"),
        };
        assert_eq!(attempts.len(), 1);
        assert_matches!(
            attempts[0].error,
            AttemptError::Handshake(HandshakeError::Auth(AuthError { .. }))
        );
        assert_eq!(first.accepted(), 1);
        assert_eq!(second.accepted(), 0);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn connect_then_handshake_separately() {
        setup_tracing();
        let node = MockNode::start(MockBehavior::Cql(MockCql::default().with_max_version(3))).await;
        let auth = PlainTextAuthenticator::new("user", "pass");

        let mut client = cluster_connect(&node.endpoint(), None, &ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(client.connection().peer_address(), node.address());
        let result = client
            .handshake(
                ProtocolVersion::V4,
                &auth,
                &StartupOptions::default(),
                DEFAULT_HANDSHAKE_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(result.version, ProtocolVersion::V3);
        assert_eq!(result.auth, AuthOutcome::NotRequired);

        let (connection, _frames) = client.into_parts();
        connection.close();
        connection.is_closed().await;
        assert!(connection.err().is_none());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn connect_with_bundle_through_sni_proxy() {
        setup_tracing();
        let host_id = "6f1a2b3c-host-1";
        let pki = TestPki::generate(host_id);
        let node = MockNode::start_tls(authenticating_node(), pki.server_config()).await;
        let metadata = json!({
            "version": 1,
            "region": "local",
            "contact_info": {
                "type": "sni_proxy",
                "local_dc": "dc1",
                "contact_points": [host_id],
                "sni_proxy_address": format!("127.0.0.1:{}", node.endpoint().port()),
            }
        });
        let server = MockMetadataServer::start(&pki, "token-user", "token-pass", metadata).await;

        let config = json!({
            "host": "127.0.0.1",
            "port": server.port(),
            "username": "token-user",
            "password": "token-pass",
        });
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bundle_zip(&config, &pki)).unwrap();

        let auth = PlainTextAuthenticator::new("user", "pass");
        let cluster = connect_with_bundle(file.path(), ProtocolVersion::V4, &auth, None)
            .await
            .unwrap();
        assert_eq!(cluster.endpoint().sni(), Some(host_id));
        assert_eq!(cluster.version(), ProtocolVersion::V4);
        assert!(cluster.failed_attempts().is_empty());

        cluster.connection().close();
        cluster.connection().is_closed().await;
    }

    #[tokio::test]
    async fn connect_with_bundle_names_the_failing_phase() {
        let auth = PlainTextAuthenticator::new("user", "pass");
        let dir = tempfile::tempdir().unwrap();
        let err = connect_with_bundle(
            dir.path().join("missing.zip"),
            ProtocolVersion::V4,
            &auth,
            None,
        )
        .await
        .unwrap_err();
        assert_matches!(err, ProxyCoreError::Bundle(_));
    }
}
