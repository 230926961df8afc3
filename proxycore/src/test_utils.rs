use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::RemoteHandle;
use futures::FutureExt;
use proxycore_cql::errors::DbError;
use proxycore_cql::frame::frame_errors::FrameError;
use proxycore_cql::frame::request::{Request, RequestOpcode};
use proxycore_cql::frame::response::{
    AuthSuccess, Authenticate, Error, Ready, SerializableResponse, Supported,
};
use proxycore_cql::frame::{read_frame, Frame, FrameDirection, FrameParams};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::trace;

use crate::network::tls::{crypto_provider, parse_certificates, parse_private_key, TlsMaterial};
use crate::network::Endpoint;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// An endpoint on localhost that nothing listens on.
pub(crate) async fn refused_endpoint() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

/// A throwaway CA with one server and one client certificate signed by it.
pub(crate) struct TestPki {
    ca_pem: String,
    server_cert_pem: String,
    server_key_pem: String,
    client_cert_pem: String,
    client_key_pem: String,
}

impl TestPki {
    /// The server certificate is valid for `server_name` and 127.0.0.1.
    pub(crate) fn generate(server_name: &str) -> TestPki {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "proxycore test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params =
            CertificateParams::new(vec![server_name.to_owned(), "127.0.0.1".to_owned()]).unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params
            .distinguished_name
            .push(DnType::CommonName, "proxycore test client");
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        TestPki {
            ca_pem: ca_cert.pem(),
            server_cert_pem: server_cert.pem(),
            server_key_pem: server_key.serialize_pem(),
            client_cert_pem: client_cert.pem(),
            client_key_pem: client_key.serialize_pem(),
        }
    }

    pub(crate) fn ca_pem(&self) -> Vec<u8> {
        self.ca_pem.clone().into_bytes()
    }

    pub(crate) fn client_cert_pem(&self) -> String {
        self.client_cert_pem.clone()
    }

    pub(crate) fn client_key_pem(&self) -> String {
        self.client_key_pem.clone()
    }

    pub(crate) fn client_material(&self) -> TlsMaterial {
        TlsMaterial::new(
            self.ca_pem(),
            self.client_cert_pem().into_bytes(),
            self.client_key_pem().into_bytes(),
        )
    }

    /// A server context that requires a client certificate signed by the CA.
    pub(crate) fn server_config(&self) -> Arc<ServerConfig> {
        let mut roots = RootCertStore::empty();
        for ca in parse_certificates(self.ca_pem.as_bytes()).unwrap() {
            roots.add(ca).unwrap();
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
            .build()
            .unwrap();

        let config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                parse_certificates(self.server_cert_pem.as_bytes()).unwrap(),
                parse_private_key(self.server_key_pem.as_bytes()).unwrap(),
            )
            .unwrap();
        Arc::new(config)
    }
}

/// A secure connect bundle with `config` as its `config.json` and the
/// client identity of `pki` in the default entries.
pub(crate) fn bundle_zip(config: &serde_json::Value, pki: &TestPki) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let entries = [
        ("config.json", serde_json::to_vec_pretty(config).unwrap()),
        ("ca.crt", pki.ca_pem()),
        ("cert", pki.client_cert_pem().into_bytes()),
        ("key", pki.client_key_pem().into_bytes()),
    ];
    for (name, contents) in entries {
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(&contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// How a [`MockNode`] treats accepted connections.
#[derive(Debug, Clone)]
pub(crate) enum MockBehavior {
    /// Keeps the connection open and never answers.
    Silent,
    /// Closes the connection right after accepting it.
    Hangup,
    /// Answers handshake requests like a CQL node.
    Cql(MockCql),
}

/// Scripted handshake answers of a mock CQL node.
#[derive(Debug, Clone)]
pub(crate) struct MockCql {
    max_version: u8,
    reject_all_versions: bool,
    credentials: Option<(String, String)>,
    reply_delay: Option<Duration>,
}

impl Default for MockCql {
    fn default() -> Self {
        Self {
            max_version: 4,
            reject_all_versions: false,
            credentials: None,
            reply_delay: None,
        }
    }
}

impl MockCql {
    pub(crate) fn with_max_version(mut self, max_version: u8) -> Self {
        self.max_version = max_version;
        self
    }

    /// Answers every STARTUP with a version mismatch.
    pub(crate) fn rejecting_all_versions(mut self) -> Self {
        self.reject_all_versions = true;
        self
    }

    /// Demands PLAIN authentication with these credentials.
    pub(crate) fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_owned(), password.to_owned()));
        self
    }

    /// Waits this long before answering each request.
    pub(crate) fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct MockNodeState {
    accepted: AtomicUsize,
    startup_versions: Mutex<Vec<u8>>,
}

/// A fake cluster node listening on localhost. Stops when dropped.
pub(crate) struct MockNode {
    address: SocketAddr,
    state: Arc<MockNodeState>,
    _handle: RemoteHandle<()>,
}

impl MockNode {
    pub(crate) async fn start(behavior: MockBehavior) -> MockNode {
        Self::start_inner(behavior, None).await
    }

    /// Like [`start`](Self::start), but every connection starts with a
    /// TLS handshake using `config`.
    pub(crate) async fn start_tls(behavior: MockBehavior, config: Arc<ServerConfig>) -> MockNode {
        Self::start_inner(behavior, Some(tokio_rustls::TlsAcceptor::from(config))).await
    }

    async fn start_inner(
        behavior: MockBehavior,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
    ) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let state = Arc::new(MockNodeState::default());

        let accept_loop = Self::accept_loop(listener, behavior, acceptor, state.clone());
        let (task, handle) = accept_loop.remote_handle();
        tokio::spawn(task);

        MockNode {
            address,
            state,
            _handle: handle,
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        behavior: MockBehavior,
        acceptor: Option<tokio_rustls::TlsAcceptor>,
        state: Arc<MockNodeState>,
    ) {
        // Dropping the set aborts the connection tasks together with the loop.
        let mut connections = JoinSet::new();
        while let Ok((socket, peer)) = listener.accept().await {
            state.accepted.fetch_add(1, Ordering::SeqCst);
            trace!("Mock node accepted {}", peer);
            let behavior = behavior.clone();
            let acceptor = acceptor.clone();
            let state = state.clone();
            connections.spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(stream) = acceptor.accept(socket).await {
                            serve(stream, behavior, state).await;
                        }
                    }
                    None => serve(socket, behavior, state).await,
                }
            });
        }
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.address.port())
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Protocol versions of the STARTUP requests received so far.
    pub(crate) fn startup_versions(&self) -> Vec<u8> {
        self.state.startup_versions.lock().unwrap().clone()
    }
}

async fn serve<S>(mut stream: S, behavior: MockBehavior, state: Arc<MockNodeState>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match behavior {
        MockBehavior::Hangup => {}
        MockBehavior::Silent => {
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        }
        MockBehavior::Cql(cql) => {
            if let Err(err) = serve_cql(&mut stream, &cql, &state).await {
                trace!("Mock node connection ended: {}", err);
            }
        }
    }
}

async fn serve_cql<S>(stream: &mut S, cql: &MockCql, state: &MockNodeState) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = read_frame(stream, FrameDirection::Request).await?;
        let version = frame.params.raw_version();
        let opcode = RequestOpcode::try_from(frame.opcode).unwrap();
        let request = Request::deserialize(&mut &frame.body[..], opcode).unwrap();

        let reply = match request {
            Request::Startup(_) => {
                state.startup_versions.lock().unwrap().push(version);
                if cql.reject_all_versions || version > cql.max_version {
                    let error = Error {
                        error: DbError::ProtocolError,
                        reason: format!(
                            "Invalid or unsupported protocol version ({version}); \
                             the lowest supported version is 3 and the greatest is {}",
                            cql.max_version
                        ),
                    };
                    // Servers answer in the highest version they support.
                    let mut reply = response(frame.params, &error);
                    reply.params.version = 0x80 | cql.max_version;
                    reply
                } else if cql.credentials.is_some() {
                    response(
                        frame.params,
                        &Authenticate {
                            authenticator_name: "org.apache.cassandra.auth.PasswordAuthenticator"
                                .to_owned(),
                        },
                    )
                } else {
                    response(frame.params, &Ready)
                }
            }
            Request::Options(_) => response(
                frame.params,
                &Supported {
                    options: [("CQL_VERSION".to_owned(), vec!["3.0.0".to_owned()])]
                        .into_iter()
                        .collect(),
                },
            ),
            Request::AuthResponse(auth) => {
                let expected = cql
                    .credentials
                    .as_ref()
                    .map(|(user, pass)| format!("\0{user}\0{pass}").into_bytes());
                if expected.is_some() && auth.response == expected {
                    response(
                        frame.params,
                        &AuthSuccess {
                            success_message: None,
                        },
                    )
                } else {
                    response(
                        frame.params,
                        &Error {
                            error: DbError::AuthenticationError,
                            reason: "Provided username and/or password are incorrect".to_owned(),
                        },
                    )
                }
            }
        };

        if let Some(delay) = cql.reply_delay {
            tokio::time::sleep(delay).await;
        }
        let mut out = Vec::with_capacity(reply.encoded_len());
        reply.encode(&mut out);
        stream.write_all(&out).await?;
        stream.flush().await?;
    }
}

fn response(request: FrameParams, response: &impl SerializableResponse) -> Frame {
    Frame::from_response(request, response).unwrap()
}

/// An HTTPS metadata service on localhost that requires a client
/// certificate and the given basic-auth credentials. Stops when dropped.
pub(crate) struct MockMetadataServer {
    port: u16,
    _handle: RemoteHandle<()>,
}

impl MockMetadataServer {
    pub(crate) async fn start(
        pki: &TestPki,
        username: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> MockMetadataServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = tokio_rustls::TlsAcceptor::from(pki.server_config());
        let authorization = format!("Basic {}", STANDARD.encode(format!("{username}:{password}")));
        let body = serde_json::to_string(&metadata).unwrap();

        let serve = async move {
            let mut requests = JoinSet::new();
            while let Ok((socket, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let authorization = authorization.clone();
                let body = body.clone();
                requests.spawn(async move {
                    let Ok(stream) = acceptor.accept(socket).await else {
                        return;
                    };
                    let _ = answer_metadata_request(stream, &authorization, &body).await;
                });
            }
        };
        let (task, handle) = serve.remote_handle();
        tokio::spawn(task);

        MockMetadataServer {
            port,
            _handle: handle,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

async fn answer_metadata_request<S>(
    mut stream: S,
    authorization: &str,
    body: &str,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        request.extend_from_slice(&chunk[..n]);
    }

    let request = String::from_utf8_lossy(&request);
    let authorized = request.lines().any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.eq_ignore_ascii_case("authorization") && value.trim() == authorization
        })
    });
    let (status, body) = if !request.starts_with("GET /metadata ") {
        ("404 Not Found", "")
    } else if !authorized {
        ("401 Unauthorized", "")
    } else {
        ("200 OK", body)
    };

    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
