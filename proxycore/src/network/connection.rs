use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use futures::future::{RemoteHandle, Shared};
use futures::FutureExt;
use proxycore_cql::frame::frame_errors::FrameError;
use proxycore_cql::Frame;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::tls::TlsConfig;
use super::Endpoint;
use crate::errors::{BrokenConnectionErrorKind, CallbackError, ConnectError, ConnectionError};

/// Produces outbound bytes once the connection is ready to write them.
///
/// Senders run on the connection's driver task, one at a time and in the
/// order they were passed to [`Connection::write`].
pub trait Sender: Send + 'static {
    /// Appends the bytes to send to `sink`. An error breaks the connection.
    fn send(&mut self, sink: &mut BytesMut) -> Result<(), CallbackError>;

    /// Called instead of [`send`](Sender::send) when the connection
    /// terminates while this sender is still queued.
    fn closing(&mut self, _error: Option<&ConnectionError>) {}
}

/// Consumes inbound bytes.
pub trait Receiver: Send + 'static {
    /// Called after every read with all bytes received so far and not yet
    /// consumed. Consume what can be handled (e.g. whole frames) and leave the
    /// rest in `source` for the next call. An error breaks the connection.
    fn receive(&mut self, source: &mut BytesMut) -> Result<(), CallbackError>;

    /// Called once when the connection terminates; `error` is `None` after
    /// a graceful close.
    fn closing(&mut self, _error: Option<&ConnectionError>) {}
}

impl Sender for Frame {
    fn send(&mut self, sink: &mut BytesMut) -> Result<(), CallbackError> {
        self.encode(sink);
        Ok(())
    }
}

/// Configuration of a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on establishing TCP and, if used, TLS.
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    /// Idle time after which TCP keepalive probes start. Disabled when `None`.
    pub tcp_keepalive_interval: Option<Duration>,
    /// Initial capacity of the inbound buffer handed to the receiver.
    pub read_buffer_capacity: usize,
    /// Bound on flushing queued senders after [`Connection::close`]. When it
    /// expires the socket is dropped and the connection breaks with
    /// [`BrokenConnectionErrorKind::CloseTimeout`].
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            read_buffer_capacity: 8192,
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Resolves once the connection has terminated, gracefully or not.
///
/// Any number of clones may be awaited; all of them resolve.
#[derive(Clone)]
pub struct ClosedSignal(Shared<oneshot::Receiver<()>>);

impl Future for ClosedSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // A dropped sender means the driver is gone, which is a close too.
        self.0.poll_unpin(cx).map(|_| ())
    }
}

impl std::fmt::Debug for ClosedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosedSignal").finish_non_exhaustive()
    }
}

struct ConnectionShared {
    state: AtomicU8,
    error: StdMutex<Option<ConnectionError>>,
    queue_depth: AtomicUsize,
}

impl ConnectionShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            error: StdMutex::new(None),
            queue_depth: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the state forward and returns the previous one.
    fn advance_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.fetch_max(state as u8, Ordering::AcqRel))
    }

    fn error(&self) -> Option<ConnectionError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Keeps the first error only.
    fn record_error(&self, error: ConnectionError) {
        let mut guard = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(error);
        }
    }
}

type SenderQueue = mpsc::UnboundedReceiver<Box<dyn Sender>>;

enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// A connection to a single endpoint, driven by a background task.
///
/// Outbound data is produced by [`Sender`]s passed to [`write`](Self::write);
/// inbound data goes to the [`Receiver`] given to [`connect`](Self::connect).
/// Failures never surface from the I/O calls themselves; they are recorded and
/// reported through [`err`](Self::err) and [`is_closed`](Self::is_closed).
///
/// Dropping the connection stops its driver immediately; queued senders and
/// the receiver are still told, with [`ConnectionError::Closed`]. Call
/// [`close`](Self::close) and await [`is_closed`](Self::is_closed) to flush
/// queued senders first.
pub struct Connection {
    endpoint: Endpoint,
    peer_address: SocketAddr,
    shared: Arc<ConnectionShared>,
    submit_channel: mpsc::UnboundedSender<Box<dyn Sender>>,
    close_token: CancellationToken,
    closed: ClosedSignal,
    _worker_handle: RemoteHandle<()>,
}

impl Connection {
    /// Opens a connection to `endpoint`, performing the TLS handshake first
    /// when `tls_config` is given. No CQL frames are exchanged.
    pub async fn connect(
        endpoint: &Endpoint,
        tls_config: Option<TlsConfig>,
        receiver: Box<dyn Receiver>,
        config: &ConnectionConfig,
    ) -> Result<Connection, ConnectError> {
        let transport = tokio::time::timeout(
            config.connect_timeout,
            Self::open_transport(endpoint, tls_config.as_ref(), config),
        )
        .await
        .map_err(|_| ConnectError::Timeout(config.connect_timeout))??;

        let peer_address = match &transport {
            Transport::Plain(stream) => stream.peer_addr(),
            Transport::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
        .map_err(|err| ConnectError::Io(Arc::new(err)))?;

        let (submit_channel, submit_receiver) = mpsc::unbounded_channel();
        let (closed_sender, closed_receiver) = oneshot::channel();
        let shared = Arc::new(ConnectionShared::new());
        let close_token = CancellationToken::new();

        let driver = Driver {
            shared: shared.clone(),
            close_token: close_token.clone(),
            read_buffer_capacity: config.read_buffer_capacity.max(1),
            close_timeout: config.close_timeout,
            peer_address,
        };
        let teardown = Teardown {
            shared: shared.clone(),
            receiver,
            submit_receiver,
            closed_sender: Some(closed_sender),
        };
        let _worker_handle = match transport {
            Transport::Plain(stream) => driver.spawn(stream, teardown),
            Transport::Tls(stream) => driver.spawn(*stream, teardown),
        };
        shared.advance_state(ConnectionState::Open);
        debug!("Connection to {} ({}) is open", endpoint, peer_address);

        Ok(Connection {
            endpoint: endpoint.clone(),
            peer_address,
            shared,
            submit_channel,
            close_token,
            closed: ClosedSignal(closed_receiver.shared()),
            _worker_handle,
        })
    }

    async fn open_transport(
        endpoint: &Endpoint,
        tls_config: Option<&TlsConfig>,
        config: &ConnectionConfig,
    ) -> Result<Transport, ConnectError> {
        let stream = Self::connect_tcp(endpoint).await?;
        stream
            .set_nodelay(config.tcp_nodelay)
            .map_err(|err| ConnectError::Io(Arc::new(err)))?;
        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)
                .map_err(|err| ConnectError::Io(Arc::new(err)))?;
        }

        let Some(tls_config) = tls_config else {
            return Ok(Transport::Plain(stream));
        };
        let server_name = tls_config.server_name(endpoint.host())?;
        trace!("Starting TLS handshake with {} as {:?}", endpoint, server_name);
        let stream = tls_config
            .connector()
            .connect(server_name, stream)
            .await
            .map_err(|err| ConnectError::Tls(Arc::new(err)))?;
        Ok(Transport::Tls(Box::new(stream)))
    }

    async fn connect_tcp(endpoint: &Endpoint) -> Result<TcpStream, ConnectError> {
        let dns_error = |reason: String| ConnectError::Dns {
            host: endpoint.host().to_owned(),
            reason,
        };
        let addresses: Vec<SocketAddr> =
            tokio::net::lookup_host((endpoint.host(), endpoint.port()))
                .await
                .map_err(|err| dns_error(err.to_string()))?
                .collect();
        if addresses.is_empty() {
            return Err(dns_error("no addresses found".to_owned()));
        }

        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!("Failed to connect to {} ({}): {}", endpoint, address, err);
                    last_error = Some(match err.kind() {
                        std::io::ErrorKind::ConnectionRefused => ConnectError::Refused(address),
                        _ => ConnectError::Io(Arc::new(err)),
                    });
                }
            }
        }
        Err(last_error.unwrap_or_else(|| dns_error("no addresses found".to_owned())))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before keepalives start, which socket2
        // calls "time"; its "interval" is the time between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from socket2 library, which uses the same constraints.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    /// Queues `sender` to run once the socket is writable.
    ///
    /// Only fails when the connection is already closing or closed. Write
    /// failures afterwards break the connection and are reported through
    /// [`err`](Self::err).
    pub fn write(&self, sender: impl Sender) -> Result<(), ConnectionError> {
        if self.shared.state() >= ConnectionState::Closing {
            return Err(ConnectionError::Closed);
        }
        self.shared.queue_depth.fetch_add(1, Ordering::AcqRel);
        self.submit_channel
            .send(Box::new(sender))
            .map_err(|mpsc::error::SendError(mut sender)| {
                self.shared.queue_depth.fetch_sub(1, Ordering::AcqRel);
                sender.closing(Some(&ConnectionError::Closed));
                ConnectionError::Closed
            })
    }

    /// Starts a graceful shutdown: senders queued so far are still written,
    /// then the write half is shut down. Calling it again does nothing.
    pub fn close(&self) {
        let previous = self.shared.advance_state(ConnectionState::Closing);
        if previous < ConnectionState::Closing {
            debug!("Closing connection to {}", self.endpoint);
        }
        self.close_token.cancel();
    }

    /// A signal that resolves when the connection has terminated.
    pub fn is_closed(&self) -> ClosedSignal {
        self.closed.clone()
    }

    /// The error that broke the connection, or `None` if it is healthy or
    /// was closed gracefully.
    pub fn err(&self) -> Option<ConnectionError> {
        self.shared.error()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Number of senders queued and not yet run.
    pub fn outbound_queue_depth(&self) -> usize {
        self.shared.queue_depth.load(Ordering::Acquire)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("peer_address", &self.peer_address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Driver {
    shared: Arc<ConnectionShared>,
    close_token: CancellationToken,
    read_buffer_capacity: usize,
    close_timeout: Duration,
    peer_address: SocketAddr,
}

/// What the driver owns on behalf of the connection's users. Whoever ends
/// the driver, a finished run or a dropped connection, notifies them once.
struct Teardown {
    shared: Arc<ConnectionShared>,
    receiver: Box<dyn Receiver>,
    submit_receiver: SenderQueue,
    closed_sender: Option<oneshot::Sender<()>>,
}

impl Teardown {
    fn finish(&mut self, error: Option<ConnectionError>) {
        let Some(closed_sender) = self.closed_sender.take() else {
            return;
        };
        if let Some(err) = &error {
            self.shared.record_error(err.clone());
        }
        self.shared.advance_state(ConnectionState::Closed);

        // Senders that never got to run are told why.
        self.submit_receiver.close();
        while let Ok(mut sender) = self.submit_receiver.try_recv() {
            self.shared.queue_depth.fetch_sub(1, Ordering::AcqRel);
            sender.closing(error.as_ref());
        }
        self.receiver.closing(error.as_ref());

        let _ = closed_sender.send(());
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        // Only reached with the sender still present when the driver was
        // dropped together with its connection.
        self.finish(Some(ConnectionError::Closed));
    }
}

impl Driver {
    fn spawn(
        self,
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
        teardown: Teardown,
    ) -> RemoteHandle<()> {
        let (task, handle) = self.run(stream, teardown).remote_handle();
        tokio::task::spawn(task);
        handle
    }

    async fn run(self, stream: impl AsyncRead + AsyncWrite, mut teardown: Teardown) {
        let (read_half, write_half) = split(stream);

        let r = Self::reader(
            read_half,
            teardown.receiver.as_mut(),
            self.read_buffer_capacity,
            &self.close_token,
        );
        let w = Self::bounded_writer(
            Self::writer(
                BufWriter::with_capacity(8192, write_half),
                &mut teardown.submit_receiver,
                &self.shared,
                &self.close_token,
            ),
            self.close_timeout,
            &self.close_token,
        );

        let error = futures::try_join!(r, w).err().map(ConnectionError::Broken);

        match &error {
            Some(err) => debug!("Connection to {} broken: {}", self.peer_address, err),
            None => debug!("Connection to {} closed", self.peer_address),
        }
        teardown.finish(error);
    }

    /// Once a close is requested, the writer gets `close_timeout` to flush
    /// what is queued. A peer that stops reading must not keep it forever.
    async fn bounded_writer(
        writer: impl Future<Output = Result<(), BrokenConnectionErrorKind>>,
        close_timeout: Duration,
        close_token: &CancellationToken,
    ) -> Result<(), BrokenConnectionErrorKind> {
        tokio::pin!(writer);
        tokio::select! {
            biased;
            result = &mut writer => result,
            _ = close_token.cancelled() => {
                tokio::time::timeout(close_timeout, writer)
                    .await
                    .unwrap_or(Err(BrokenConnectionErrorKind::CloseTimeout(close_timeout)))
            }
        }
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        receiver: &mut dyn Receiver,
        read_buffer_capacity: usize,
        close_token: &CancellationToken,
    ) -> Result<(), BrokenConnectionErrorKind> {
        let mut buffer = BytesMut::with_capacity(read_buffer_capacity);
        loop {
            if buffer.len() == buffer.capacity() {
                buffer.reserve(read_buffer_capacity);
            }
            let read = tokio::select! {
                biased;
                _ = close_token.cancelled() => return Ok(()),
                read = read_half.read_buf(&mut buffer) => read,
            };
            let n = read.map_err(|err| BrokenConnectionErrorKind::ReadError(Arc::new(err)))?;
            if n == 0 {
                if close_token.is_cancelled() {
                    return Ok(());
                }
                return Err(BrokenConnectionErrorKind::PeerClosed);
            }
            trace!("Received {} bytes", n);

            receiver
                .receive(&mut buffer)
                .map_err(|err| match err.downcast::<FrameError>() {
                    Ok(frame_error) => BrokenConnectionErrorKind::FrameDecodeError(*frame_error),
                    Err(other) => BrokenConnectionErrorKind::ReceiverFailed(Arc::from(other)),
                })?;
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        submit_receiver: &mut SenderQueue,
        shared: &ConnectionShared,
        close_token: &CancellationToken,
    ) -> Result<(), BrokenConnectionErrorKind> {
        let write_error = |err| BrokenConnectionErrorKind::WriteError(Arc::new(err));
        let mut sink = BytesMut::with_capacity(8192);

        loop {
            let next = tokio::select! {
                biased;
                sender = submit_receiver.recv() => sender,
                _ = close_token.cancelled() => None,
            };
            let Some(mut sender) = next else { break };

            let mut num_senders = 0;
            let mut total_sent = 0;
            loop {
                Self::run_sender(sender, &mut sink, shared)?;
                total_sent += sink.len();
                num_senders += 1;
                write_half.write_all(&sink).await.map_err(write_error)?;
                sink.clear();
                sender = match submit_receiver.try_recv() {
                    Ok(s) => s,
                    Err(_) => break,
                };
            }
            trace!("Sending {} senders; {} bytes", num_senders, total_sent);
            write_half.flush().await.map_err(write_error)?;
        }

        // Closing: accept nothing new, but write what is already queued.
        submit_receiver.close();
        while let Ok(sender) = submit_receiver.try_recv() {
            Self::run_sender(sender, &mut sink, shared)?;
            write_half.write_all(&sink).await.map_err(write_error)?;
            sink.clear();
        }
        write_half.flush().await.map_err(write_error)?;
        write_half.shutdown().await.map_err(write_error)?;
        Ok(())
    }

    fn run_sender(
        mut sender: Box<dyn Sender>,
        sink: &mut BytesMut,
        shared: &ConnectionShared,
    ) -> Result<(), BrokenConnectionErrorKind> {
        shared.queue_depth.fetch_sub(1, Ordering::AcqRel);
        sender
            .send(sink)
            .map_err(|err| BrokenConnectionErrorKind::SenderFailed(Arc::from(err)))
    }
}
