/// A single TCP (optionally TLS) connection to one Riak node
///
/// Lifecycle: `Disconnected -> Connecting -> [TlsHandshake -> AuthHandshake ->]
/// Ready -> Closed`. `Closed` is terminal; the owning node replaces closed
/// connections instead of reconnecting them.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec::{codes, pb, Frame, FrameBuffer, FrameCodec};
use crate::core::tls::SecurityContext;
use crate::core::Command;
use crate::error::{RiakError, RiakResult, ServerError, TimeoutKind};
use crate::utils::split_address;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    TlsHandshake = 2,
    AuthHandshake = 3,
    Ready = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::TlsHandshake,
            3 => ConnectionState::AuthHandshake,
            4 => ConnectionState::Ready,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::TlsHandshake => "tls-handshake",
            ConnectionState::AuthHandshake => "auth-handshake",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Settings shared by every connection a node opens
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub address: String,
    pub connect_timeout: Duration,
    /// Deadline for each awaited response frame
    pub request_timeout: Option<Duration>,
    pub security: Option<SecurityContext>,
}

impl ConnectOptions {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Some(Duration::from_secs(5)),
            security: None,
        }
    }
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

struct Io {
    stream: Box<dyn Transport>,
    buffer: FrameBuffer,
}

enum Outcome {
    Done,
    ServerError { error: ServerError, close: bool },
}

/// One socket, at most one command in flight
pub struct Connection {
    id: u64,
    options: ConnectOptions,
    state: AtomicU8,
    in_flight: AtomicBool,
    io: Mutex<Option<Io>>,
    closed: watch::Sender<bool>,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last execute
    last_used_ms: AtomicU64,
}

/// Clears the in-flight flag however `execute` returns
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Closes the connection if `execute` is cancelled mid-exchange, since the
/// unread response would otherwise be taken for the next command's
struct Abandoned<'a>(Option<&'a Connection>);

impl Drop for Abandoned<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            connection.mark_closed();
        }
    }
}

impl Connection {
    pub fn new(id: u64, options: ConnectOptions) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            options,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            in_flight: AtomicBool::new(false),
            io: Mutex::new(None),
            closed,
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
        }
    }

    /// Create and open a connection in one step
    pub async fn connect(id: u64, options: ConnectOptions) -> RiakResult<Self> {
        let connection = Self::new(id, options);
        connection.open().await?;
        Ok(connection)
    }

    /// Drive the connection from `Disconnected` to `Ready`
    ///
    /// Any failure leaves the connection `Closed`.
    pub async fn open(&self) -> RiakResult<()> {
        if !self.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(RiakError::internal(format!(
                "connection {} opened twice (state {})",
                self.id,
                self.state()
            )));
        }

        let result = match self.establish().await {
            Ok(io) => {
                let mut guard = self.io.lock().await;
                if self.advance(ConnectionState::Ready) {
                    *guard = Some(io);
                    Ok(())
                } else {
                    Err(RiakError::ConnectionClosed)
                }
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => debug!(
                "Connection {} to {} ready (tls: {})",
                self.id,
                self.options.address,
                self.options.security.is_some()
            ),
            Err(e) => {
                debug!("Connection {} to {} failed: {}", self.id, self.options.address, e);
                self.mark_closed();
            }
        }
        result
    }

    async fn establish(&self) -> RiakResult<Io> {
        let address = &self.options.address;
        let (host, port) = split_address(address).map_err(|e| RiakError::connect(address, e))?;

        let stream = match timeout(
            self.options.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(RiakError::connect(address, e.to_string())),
            Err(_) => {
                return Err(RiakError::connect(
                    address,
                    format!("timed out after {:?}", self.options.connect_timeout),
                ))
            }
        };

        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_keepalive(true)?;

        let mut buffer = FrameBuffer::new();
        let stream: Box<dyn Transport> = match &self.options.security {
            None => Box::new(stream),
            Some(security) => Box::new(self.upgrade(stream, &mut buffer, security).await?),
        };

        Ok(Io { stream, buffer })
    }

    /// StartTls in cleartext, TLS handshake, then AuthReq over TLS
    async fn upgrade(
        &self,
        mut stream: TcpStream,
        buffer: &mut FrameBuffer,
        security: &SecurityContext,
    ) -> RiakResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let address = &self.options.address;
        if !self.advance(ConnectionState::TlsHandshake) {
            return Err(RiakError::ConnectionClosed);
        }

        self.handshake_exchange(&mut stream, buffer, codes::START_TLS, codes::START_TLS, None)
            .await?;
        if !buffer.is_empty() {
            return Err(RiakError::handshake(
                address,
                "unexpected bytes after StartTls response",
            ));
        }

        let mut tls = security
            .connector
            .connect(security.server_name.clone(), stream)
            .await
            .map_err(|e| RiakError::handshake(address, format!("TLS negotiation: {}", e)))?;

        if !self.advance(ConnectionState::AuthHandshake) {
            return Err(RiakError::ConnectionClosed);
        }

        let auth = pb::encode_auth_request(&security.username, &security.password);
        self.handshake_exchange(&mut tls, buffer, codes::AUTH_REQ, codes::AUTH_RESP, Some(&auth))
            .await?;

        Ok(tls)
    }

    /// Write one handshake request and read its single response
    async fn handshake_exchange<S>(
        &self,
        stream: &mut S,
        buffer: &mut FrameBuffer,
        code: u8,
        expected: u8,
        body: Option<&[u8]>,
    ) -> RiakResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let address = &self.options.address;

        let request = FrameCodec::encode(code, body)?;
        stream
            .write_all(&request)
            .await
            .map_err(|e| RiakError::handshake(address, e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| RiakError::handshake(address, e.to_string()))?;

        let frame = timeout(
            self.options.connect_timeout,
            read_frame(stream, buffer, address),
        )
        .await
        .map_err(|_| RiakError::handshake(address, "timed out waiting for response"))?
        .map_err(|e| RiakError::handshake(address, e.to_string()))?;

        if frame.is_error() {
            let message = match pb::decode_error_response(frame.body) {
                Ok(error) => error.message,
                Err(e) => e.to_string(),
            };
            return Err(RiakError::handshake(address, message));
        }
        if frame.code != expected {
            return Err(RiakError::handshake(
                address,
                format!("expected response code {} but received {}", expected, frame.code),
            ));
        }
        Ok(())
    }

    /// Send `command` and feed it response frames until it reports completion
    ///
    /// Rejects with `ConnectionBusy` if another command is in flight. A server
    /// error response leaves the connection usable unless the command asks
    /// for teardown; every other failure closes it.
    pub async fn execute<C: Command + ?Sized>(&self, command: &mut C) -> RiakResult<()> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RiakError::ConnectionBusy);
        }
        let _flight = InFlight(&self.in_flight);

        if self.state() != ConnectionState::Ready {
            return Err(RiakError::ConnectionClosed);
        }
        let body = command.encode_body()?;
        let request = FrameCodec::encode(command.request_code(), body.as_deref())?;
        self.touch();

        let mut closed = self.closed.subscribe();
        // Declared before the io guard so it runs after the guard is released
        let mut abandoned = Abandoned(Some(self));
        let mut guard = self.io.lock().await;
        let io = match guard.as_mut() {
            Some(io) => io,
            None => return Err(RiakError::ConnectionClosed),
        };

        let outcome = tokio::select! {
            outcome = self.exchange(io, command, request) => outcome,
            _ = closed.wait_for(|closed| *closed) => Err(RiakError::ConnectionClosed),
        };

        abandoned.0 = None;

        let (result, keep) = match outcome {
            Ok(Outcome::Done) => {
                // Leftover bytes mean we no longer know where the next frame starts
                let clean = io.buffer.is_empty();
                if !clean {
                    debug!(
                        "Connection {}: {} unread bytes after {} completed",
                        self.id,
                        io.buffer.len(),
                        command.name()
                    );
                }
                (Ok(()), clean)
            }
            Ok(Outcome::ServerError { error, close }) => (Err(RiakError::Server(error)), !close),
            Err(e) => (Err(e), false),
        };

        if !keep {
            *guard = None;
            drop(guard);
            self.mark_closed();
        }
        result
    }

    async fn exchange<C: Command + ?Sized>(
        &self,
        io: &mut Io,
        command: &mut C,
        request: bytes::Bytes,
    ) -> RiakResult<Outcome> {
        self.probe(io)?;

        trace!(
            "Connection {}: sending {} (code {}, {} bytes)",
            self.id,
            command.name(),
            command.request_code(),
            request.len()
        );

        let address = &self.options.address;
        // A failed write may still have put bytes on the wire
        io.stream
            .write_all(&request)
            .await
            .map_err(|e| lost(address, e.to_string(), true))?;
        io.stream
            .flush()
            .await
            .map_err(|e| lost(address, e.to_string(), true))?;

        loop {
            let read = read_frame(&mut io.stream, &mut io.buffer, address);
            let frame = match self.options.request_timeout {
                Some(limit) => match timeout(limit, read).await {
                    Ok(frame) => frame,
                    Err(_) => Err(RiakError::timeout(TimeoutKind::Request)),
                },
                None => read.await,
            }
            .map_err(RiakError::after_write)?;

            if frame.is_error() {
                let error = pb::decode_error_response(frame.body)?;
                let close = command.on_server_error(&error);
                return Ok(Outcome::ServerError { error, close });
            }

            if frame.code != command.response_code() {
                return Err(RiakError::protocol(format!(
                    "{}: expected response code {} but received {}",
                    command.name(),
                    command.response_code(),
                    frame.code
                )));
            }

            if command.on_response(frame.body)? {
                return Ok(Outcome::Done);
            }
        }
    }

    /// Detect a peer that hung up while the connection sat idle
    fn probe(&self, io: &mut Io) -> RiakResult<()> {
        let address = &self.options.address;
        match io.stream.read_buf(io.buffer.read_target()).now_or_never() {
            None => Ok(()),
            Some(Ok(0)) => Err(lost(address, "closed by peer while idle", false)),
            Some(Ok(n)) => Err(lost(
                address,
                format!("{} unsolicited bytes on idle connection", n),
                false,
            )),
            Some(Err(e)) => Err(lost(address, e.to_string(), false)),
        }
    }

    /// Check an idle connection without blocking; a dead one is closed
    ///
    /// A connection whose socket is held by an execute is reported alive.
    pub fn is_alive(&self) -> bool {
        if !self.is_ready() {
            return false;
        }
        let Ok(mut guard) = self.io.try_lock() else {
            return true;
        };
        let Some(io) = guard.as_mut() else {
            return false;
        };

        match self.probe(io) {
            Ok(()) => true,
            Err(e) => {
                debug!("Connection {}: discarding idle connection: {}", self.id, e);
                *guard = None;
                drop(guard);
                self.mark_closed();
                false
            }
        }
    }

    /// Close the socket; idempotent
    ///
    /// An in-flight `execute` is woken and fails with `ConnectionClosed`.
    pub fn close(&self) {
        if self.mark_closed() {
            debug!("Connection {} to {} closed", self.id, self.options.address);
        }
    }

    /// Returns true for the call that performed the transition
    fn mark_closed(&self) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return false;
        }
        self.closed.send_replace(true);
        // Drop the socket now unless an execute holds it; that execute drops it
        if let Ok(mut io) = self.io.try_lock() {
            io.take();
        }
        true
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `next` unless the connection was closed meanwhile
    fn advance(&self, next: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == ConnectionState::Closed as u8 {
                    None
                } else {
                    Some(next as u8)
                }
            })
            .is_ok()
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_used_ms.store(elapsed, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.options.address
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last execute (or since creation)
    pub fn idle_for(&self) -> Duration {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::Acquire));
        self.created_at.elapsed().saturating_sub(last_used)
    }

    /// Whether the idle reaper should retire this connection
    pub fn is_expired(&self, idle_timeout: Duration, max_lifetime: Option<Duration>) -> bool {
        self.idle_for() >= idle_timeout || max_lifetime.map_or(false, |max| self.age() >= max)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.options.address)
            .field("state", &self.state())
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

fn lost<S: Into<String>>(address: &str, message: S, request_sent: bool) -> RiakError {
    RiakError::ConnectionLost {
        address: address.to_string(),
        message: message.into(),
        request_sent,
    }
}

/// Read until one complete frame is buffered
async fn read_frame<S>(stream: &mut S, buffer: &mut FrameBuffer, address: &str) -> RiakResult<Frame>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(frame) = buffer.next_frame()? {
            return Ok(frame);
        }
        let n = stream
            .read_buf(buffer.read_target())
            .await
            .map_err(|e| lost(address, e.to_string(), false))?;
        if n == 0 {
            return Err(lost(address, "connection closed by peer", false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Ping, RawCommand};
    use crate::config::SecurityConfig;
    use crate::test_support::{
        answer_ping, error_frame, eventually, frame, pong, refused_address, Handshake, MockServer,
        Reply, TlsIdentity,
    };
    use bytes::Bytes;
    use std::io::Write;
    use std::sync::Arc;

    fn options(address: &str) -> ConnectOptions {
        ConnectOptions {
            address: address.to_string(),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Some(Duration::from_millis(500)),
            security: None,
        }
    }

    #[tokio::test]
    async fn test_connect_and_ping() {
        let server = MockServer::ping().await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        connection.execute(&mut Ping::new()).await.unwrap();
        connection.execute(&mut Ping::new()).await.unwrap();
        assert!(connection.is_ready());
        assert!(!connection.is_in_flight());
        assert_eq!(server.requests(), 2);
    }

    #[tokio::test]
    async fn test_connect_refused_closes() {
        let address = refused_address().await;
        let connection = Connection::new(1, options(&address));
        let result = connection.open().await;
        assert!(matches!(result, Err(RiakError::Connect { .. })));
        assert_eq!(connection.state(), ConnectionState::Closed);

        // closed connections are never reopened
        assert!(connection.open().await.is_err());
    }

    #[tokio::test]
    async fn test_second_execute_rejected_while_in_flight() {
        let server = MockServer::start(|_| {
            Reply::Delayed(Duration::from_millis(200), vec![frame(10, b"first")])
        })
        .await;
        let connection = Arc::new(Connection::connect(1, options(&server.address)).await.unwrap());

        let first = {
            let connection = connection.clone();
            tokio::spawn(async move {
                let mut command = RawCommand::new(9, 10, None);
                connection.execute(&mut command).await.map(|_| command.responses().to_vec())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connection.is_in_flight());
        let second = connection.execute(&mut RawCommand::new(9, 10, None)).await;
        assert!(matches!(second, Err(RiakError::ConnectionBusy)));

        let responses = first.await.unwrap().unwrap();
        assert_eq!(responses, vec![Bytes::from_static(b"first")]);
        assert!(connection.is_ready());
        assert_eq!(server.requests(), 1);
    }

    #[tokio::test]
    async fn test_streaming_response() {
        let server = MockServer::start(|_| {
            Reply::Frames(vec![frame(40, b"a"), frame(40, b"b"), frame(40, b"done")])
        })
        .await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();

        let mut command =
            RawCommand::new(39, 40, None).until(|body| body.map_or(false, |b| b == "done"));
        connection.execute(&mut command).await.unwrap();
        assert_eq!(command.responses().len(), 3);
        assert!(connection.is_ready());
    }

    #[tokio::test]
    async fn test_server_error_keeps_connection() {
        let server = MockServer::start(|f| {
            if f.code == codes::PING_REQ {
                Reply::Frames(vec![pong()])
            } else {
                Reply::Frames(vec![error_frame("bucket type not active")])
            }
        })
        .await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();

        let result = connection.execute(&mut RawCommand::new(9, 10, None)).await;
        match result {
            Err(RiakError::Server(error)) => assert_eq!(error.message, "bucket type not active"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(connection.is_ready());
        connection.execute(&mut Ping::new()).await.unwrap();
    }

    struct Teardown;

    impl Command for Teardown {
        type Output = ();
        fn request_code(&self) -> u8 {
            9
        }
        fn response_code(&self) -> u8 {
            10
        }
        fn encode_body(&self) -> RiakResult<Option<Bytes>> {
            Ok(None)
        }
        fn on_response(&mut self, _body: Option<Bytes>) -> RiakResult<bool> {
            Ok(true)
        }
        fn on_server_error(&mut self, _error: &ServerError) -> bool {
            true
        }
        fn into_output(self) {}
    }

    #[tokio::test]
    async fn test_server_error_with_teardown_request() {
        let server = MockServer::start(|_| Reply::Frames(vec![error_frame("overload")])).await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();

        let result = connection.execute(&mut Teardown).await;
        assert!(matches!(result, Err(RiakError::Server(_))));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_unexpected_code_closes_connection() {
        let server = MockServer::start(|_| Reply::Frames(vec![frame(99, b"??")])).await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();

        let result = connection.execute(&mut Ping::new()).await;
        assert!(matches!(result, Err(RiakError::Protocol(_))));
        assert!(connection.is_closed());

        let again = connection.execute(&mut Ping::new()).await;
        assert!(matches!(again, Err(RiakError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_request_timeout_closes_connection() {
        let server = MockServer::start(|_| Reply::Silent).await;
        let mut opts = options(&server.address);
        opts.request_timeout = Some(Duration::from_millis(100));
        let connection = Connection::connect(1, opts).await.unwrap();

        let result = connection.execute(&mut Ping::new()).await;
        match result {
            Err(RiakError::Timeout { kind, request_sent }) => {
                assert_eq!(kind, TimeoutKind::Request);
                assert!(request_sent);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_peer_closes_mid_response() {
        // half of a 10-byte body, then hang up
        let server = MockServer::start(|_| Reply::RawThenClose(vec![0, 0, 0, 11, 10, 1, 2, 3])).await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();

        let result = connection.execute(&mut RawCommand::new(9, 10, None)).await;
        match result {
            Err(error @ RiakError::ConnectionLost { .. }) => assert!(error.request_sent()),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_partial_frame_waits_for_rest() {
        let server = MockServer::start(|_| Reply::Raw(vec![0, 0, 0, 3])).await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();

        // only the length prefix ever arrives, so the read waits until the deadline
        let result = connection.execute(&mut RawCommand::new(9, 10, None)).await;
        assert!(matches!(
            result,
            Err(RiakError::Timeout {
                kind: TimeoutKind::Request,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_idle_peer_hangup_detected_before_write() {
        let server = MockServer::ping().await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();
        server.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = connection.execute(&mut Ping::new()).await;
        match result {
            Err(error @ RiakError::ConnectionLost { .. }) => assert!(!error.request_sent()),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(server.requests(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_in_flight_execute() {
        let server = MockServer::start(|_| Reply::Silent).await;
        let mut opts = options(&server.address);
        opts.request_timeout = None;
        let connection = Arc::new(Connection::connect(1, opts).await.unwrap());

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.execute(&mut Ping::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        connection.close();
        connection.close();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RiakError::ConnectionClosed)));
        assert!(connection.is_closed());
        assert!(!connection.is_in_flight());
    }

    fn security_config() -> SecurityConfig {
        SecurityConfig {
            username: "riakuser".to_string(),
            password: Some("pw".to_string()),
            ca_file: None,
            cert_file: None,
            key_file: None,
            server_name: Some("localhost".to_string()),
            verify_peer: false,
        }
    }

    fn secure_options(address: &str, security: &SecurityConfig) -> ConnectOptions {
        let mut opts = options(address);
        opts.security = Some(SecurityContext::from_config(security, "127.0.0.1").unwrap());
        opts
    }

    async fn handshake_failure(connection: &Connection) -> String {
        match connection.open().await {
            Err(RiakError::Handshake { message, .. }) => message,
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_tls_rejected() {
        let server = MockServer::start(|f| {
            assert_eq!(f.code, codes::START_TLS);
            assert!(f.body.is_none());
            Reply::Frames(vec![error_frame("security not enabled")])
        })
        .await;

        let connection = Connection::new(1, secure_options(&server.address, &security_config()));
        assert_eq!(handshake_failure(&connection).await, "security not enabled");
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_start_tls_and_auth_then_ping() {
        let identity = TlsIdentity::generate();
        let server = MockServer::start_secure(&identity, Handshake::Accept, answer_ping).await;

        let connection = Connection::connect(1, secure_options(&server.address, &security_config()))
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Ready);

        let mut expected = vec![0x0a, 8];
        expected.extend_from_slice(b"riakuser");
        expected.extend_from_slice(&[0x12, 2]);
        expected.extend_from_slice(b"pw");
        assert_eq!(server.auth_requests(), vec![Bytes::from(expected)]);

        connection.execute(&mut Ping::new()).await.unwrap();
        connection.execute(&mut Ping::new()).await.unwrap();
        assert_eq!(server.requests(), 2);
        assert!(connection.is_ready());
    }

    #[tokio::test]
    async fn test_tls_verified_against_ca_file() {
        let identity = TlsIdentity::generate();
        let server = MockServer::start_secure(&identity, Handshake::Accept, answer_ping).await;
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(identity.cert_pem.as_bytes()).unwrap();

        let mut security = security_config();
        security.verify_peer = true;
        security.ca_file = Some(ca.path().to_path_buf());

        let connection = Connection::connect(1, secure_options(&server.address, &security))
            .await
            .unwrap();
        connection.execute(&mut Ping::new()).await.unwrap();
        assert_eq!(server.auth_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_tls_rejects_unknown_certificate() {
        let identity = TlsIdentity::generate();
        let other = TlsIdentity::generate();
        let server = MockServer::start_secure(&identity, Handshake::Accept, answer_ping).await;
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(other.cert_pem.as_bytes()).unwrap();

        let mut security = security_config();
        security.verify_peer = true;
        security.ca_file = Some(ca.path().to_path_buf());

        let connection = Connection::new(1, secure_options(&server.address, &security));
        let message = handshake_failure(&connection).await;
        assert!(message.starts_with("TLS negotiation"), "{}", message);
        assert!(connection.is_closed());
        assert!(server.auth_requests().is_empty());
    }

    #[tokio::test]
    async fn test_auth_rejected_closes() {
        let identity = TlsIdentity::generate();
        let server = MockServer::start_secure(
            &identity,
            Handshake::RejectAuth("Authentication failed"),
            answer_ping,
        )
        .await;

        let connection = Connection::new(1, secure_options(&server.address, &security_config()));
        assert_eq!(handshake_failure(&connection).await, "Authentication failed");
        assert!(connection.is_closed());
        assert_eq!(server.auth_requests().len(), 1);
        assert_eq!(server.requests(), 0);
    }

    #[tokio::test]
    async fn test_bytes_after_start_tls_rejected() {
        let identity = TlsIdentity::generate();
        let server =
            MockServer::start_secure(&identity, Handshake::TrailingBytes, answer_ping).await;

        let connection = Connection::new(1, secure_options(&server.address, &security_config()));
        assert_eq!(
            handshake_failure(&connection).await,
            "unexpected bytes after StartTls response"
        );
        assert!(connection.is_closed());
        assert!(server.auth_requests().is_empty());
    }

    #[tokio::test]
    async fn test_is_alive_detects_peer_hangup() {
        let server = MockServer::ping().await;
        let connection = Connection::connect(1, options(&server.address)).await.unwrap();
        assert!(connection.is_alive());

        server.stop();
        assert!(eventually(|| !connection.is_alive()).await);
        assert!(connection.is_closed());
        assert!(!connection.is_alive());
        assert_eq!(server.requests(), 0);
    }

    #[test]
    fn test_expiry() {
        let connection = Connection::new(1, options("127.0.0.1:8087"));
        assert!(!connection.is_expired(Duration::from_secs(60), None));
        assert!(connection.is_expired(Duration::ZERO, None));
        assert!(connection.is_expired(Duration::from_secs(60), Some(Duration::ZERO)));
    }
}
