//! Scripted Riak server for tests
//!
//! Speaks the length-prefixed framing over loopback TCP and answers each
//! request frame according to a handler closure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

use crate::codec::{codes, pb, Frame, FrameBuffer, FrameCodec};
use crate::error::ServerError;

/// What the server does with one request frame
pub(crate) enum Reply {
    Frames(Vec<Frame>),
    Delayed(Duration, Vec<Frame>),
    /// Arbitrary bytes, e.g. half a frame
    Raw(Vec<u8>),
    /// Write the bytes, then drop the socket
    RawThenClose(Vec<u8>),
    Close,
    Silent,
}

/// How a secure server answers the StartTls and AuthReq exchange
#[derive(Debug, Clone, Copy)]
pub(crate) enum Handshake {
    Accept,
    /// Answer the AuthReq with an error response
    RejectAuth(&'static str),
    /// Send stray bytes right behind the StartTls response
    TrailingBytes,
}

/// Self-signed certificate for `localhost` and a matching acceptor
pub(crate) struct TlsIdentity {
    pub acceptor: TlsAcceptor,
    pub cert_pem: String,
}

impl TlsIdentity {
    pub fn generate() -> Self {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let config = rustls::ServerConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();

        Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            cert_pem: cert.pem(),
        }
    }
}

type Handler = Arc<dyn Fn(&Frame) -> Reply + Send + Sync>;

#[derive(Clone)]
struct Secure {
    acceptor: TlsAcceptor,
    handshake: Handshake,
    auth_requests: Arc<Mutex<Vec<Bytes>>>,
}

pub(crate) struct MockServer {
    pub address: String,
    accepted: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    auth_requests: Arc<Mutex<Vec<Bytes>>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Frame) -> Reply + Send + Sync + 'static,
    {
        Self::launch("127.0.0.1:0", None, handler).await
    }

    /// Listen on a fixed address, e.g. one a stopped server used
    pub async fn start_on<F>(address: &str, handler: F) -> Self
    where
        F: Fn(&Frame) -> Reply + Send + Sync + 'static,
    {
        Self::launch(address, None, handler).await
    }

    /// Require StartTls, a TLS session and an AuthReq before serving requests
    pub async fn start_secure<F>(identity: &TlsIdentity, handshake: Handshake, handler: F) -> Self
    where
        F: Fn(&Frame) -> Reply + Send + Sync + 'static,
    {
        let secure = Secure {
            acceptor: identity.acceptor.clone(),
            handshake,
            auth_requests: Arc::new(Mutex::new(Vec::new())),
        };
        Self::launch("127.0.0.1:0", Some(secure), handler).await
    }

    async fn launch<F>(address: &str, secure: Option<Secure>, handler: F) -> Self
    where
        F: Fn(&Frame) -> Reply + Send + Sync + 'static,
    {
        let listener = bind(address).await;
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let auth_requests = secure
            .as_ref()
            .map_or_else(Default::default, |secure| secure.auth_requests.clone());
        let (shutdown, _) = watch::channel(false);
        let handler: Handler = Arc::new(handler);

        let task = {
            let accepted = accepted.clone();
            let requests = requests.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let handler = handler.clone();
                    let requests = requests.clone();
                    let secure = secure.clone();
                    let mut stop = shutdown.subscribe();
                    tokio::spawn(async move {
                        let session = async move {
                            match secure {
                                None => serve(stream, handler, requests).await,
                                Some(secure) => {
                                    serve_secure(stream, secure, handler, requests).await
                                }
                            }
                        };
                        tokio::select! {
                            _ = session => {}
                            _ = stop.wait_for(|s| *s) => {}
                        }
                    });
                }
            })
        };

        Self {
            address,
            accepted,
            requests,
            auth_requests,
            shutdown,
            task,
        }
    }

    /// Answers pings, drops the socket on anything else
    pub async fn ping() -> Self {
        Self::start(answer_ping).await
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Bodies of every AuthReq received
    pub fn auth_requests(&self) -> Vec<Bytes> {
        self.auth_requests.lock().unwrap().clone()
    }

    /// Stop accepting and drop every open socket
    pub fn stop(&self) {
        self.task.abort();
        let _ = self.shutdown.send(true);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn answer_ping(frame: &Frame) -> Reply {
    if frame.code == codes::PING_REQ {
        Reply::Frames(vec![pong()])
    } else {
        Reply::Close
    }
}

async fn bind(address: &str) -> TcpListener {
    // a server that was just stopped may not have released the port yet
    for _ in 0..100 {
        if let Ok(listener) = TcpListener::bind(address).await {
            return listener;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    TcpListener::bind(address).await.unwrap()
}

async fn serve<S>(mut stream: S, handler: Handler, requests: Arc<AtomicUsize>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let frames = match buffer.push(&chunk[..n]) {
            Ok(frames) => frames,
            Err(_) => return,
        };
        for frame in frames {
            requests.fetch_add(1, Ordering::SeqCst);
            match handler(&frame) {
                Reply::Frames(frames) => {
                    if write_frames(&mut stream, &frames).await.is_err() {
                        return;
                    }
                }
                Reply::Delayed(delay, frames) => {
                    tokio::time::sleep(delay).await;
                    if write_frames(&mut stream, &frames).await.is_err() {
                        return;
                    }
                }
                Reply::Raw(bytes) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Reply::RawThenClose(bytes) => {
                    let _ = stream.write_all(&bytes).await;
                    return;
                }
                Reply::Close => return,
                Reply::Silent => {}
            }
        }
    }
}

async fn serve_secure(
    mut stream: TcpStream,
    secure: Secure,
    handler: Handler,
    requests: Arc<AtomicUsize>,
) {
    let mut buffer = FrameBuffer::new();
    match read_one(&mut stream, &mut buffer).await {
        Some(frame) if frame.code == codes::START_TLS => {}
        _ => return,
    }
    let mut reply = BytesMut::new();
    FrameCodec::encode_into(codes::START_TLS, None, &mut reply).unwrap();
    if let Handshake::TrailingBytes = secure.handshake {
        reply.extend_from_slice(&[0, 0]);
    }
    if stream.write_all(&reply).await.is_err() {
        return;
    }

    let Ok(mut tls) = secure.acceptor.accept(stream).await else {
        return;
    };
    let mut buffer = FrameBuffer::new();
    let auth = match read_one(&mut tls, &mut buffer).await {
        Some(frame) if frame.code == codes::AUTH_REQ => frame,
        _ => return,
    };
    secure
        .auth_requests
        .lock()
        .unwrap()
        .push(auth.body.unwrap_or_default());

    if let Handshake::RejectAuth(message) = secure.handshake {
        let _ = write_frames(&mut tls, &[error_frame(message)]).await;
        // keep the session until the client hangs up
        let _ = tls.read(&mut [0u8; 1]).await;
        return;
    }
    if write_frames(&mut tls, &[Frame::new(codes::AUTH_RESP, None)])
        .await
        .is_err()
    {
        return;
    }
    serve(tls, handler, requests).await
}

async fn read_one<S>(stream: &mut S, buffer: &mut FrameBuffer) -> Option<Frame>
where
    S: AsyncRead + Unpin,
{
    loop {
        match buffer.next_frame() {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(_) => return None,
        }
        match stream.read_buf(buffer.read_target()).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn write_frames<S>(stream: &mut S, frames: &[Frame]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    for frame in frames {
        FrameCodec::encode_into(frame.code, frame.body.as_deref(), &mut out)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    }
    stream.write_all(&out).await?;
    stream.flush().await
}

pub(crate) fn pong() -> Frame {
    Frame::new(codes::PING_RESP, None)
}

pub(crate) fn frame(code: u8, body: &'static [u8]) -> Frame {
    Frame::new(code, Some(Bytes::from_static(body)))
}

pub(crate) fn error_frame(message: &str) -> Frame {
    let body = pb::encode_error_response(&ServerError {
        code: 0,
        message: message.to_string(),
    });
    Frame::new(codes::ERROR_RESP, Some(body))
}

/// An address nothing listens on
pub(crate) async fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
