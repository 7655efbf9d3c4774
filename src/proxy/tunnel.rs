//! Single shared SOCKS5 tunnel and the HTTP/1.1 backend that runs over it
//!
//! [`TunnelSlot`] caches one connection to the registry through the proxy. A request
//! leases it, speaks HTTP/1.1 with hyper, and returns it once the response body has been
//! read to the end. Before a cached connection is handed out it is probed; a dead one is
//! replaced by a fresh single-attempt dial.

use crate::config::{Endpoint, Scheme};
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::proxy::ProxyConfig;
use crate::proxy::socks5::Socks5Dialer;
use crate::registry::retry::RetryPolicy;
use crate::registry::transport::{BodyStream, HttpBackend, RawResponse};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http::header::HOST;
use http::{HeaderMap, HeaderValue, Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use url::Url;

/// A connection through the proxy, with TLS on top when the registry is https
pub enum TunnelStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl TunnelStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            TunnelStream::Plain(stream) => stream,
            TunnelStream::Tls(stream) => stream.get_ref().0,
        }
    }

    /// Zero-byte write on the socket, then a non-blocking read through the stream.
    /// Reading through TLS lets rustls consume session tickets and other records that
    /// carry no plaintext; EOF, stray bytes or an error all mean the connection is spent.
    pub fn is_alive(&mut self) -> bool {
        match self.tcp().try_write(&[]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => return false,
        }
        read_side_idle(self)
    }
}

/// Poll one read without blocking; only `Pending` means nothing arrived
fn read_side_idle<R: AsyncRead + Unpin>(reader: &mut R) -> bool {
    let mut cx = Context::from_waker(Waker::noop());
    let mut byte = [0u8; 1];
    let mut buf = ReadBuf::new(&mut byte);
    matches!(Pin::new(reader).poll_read(&mut cx, &mut buf), Poll::Pending)
}

impl AsyncRead for TunnelStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            TunnelStream::Tls(stream) => Pin::new(&mut **stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            TunnelStream::Tls(stream) => Pin::new(&mut **stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            TunnelStream::Tls(stream) => Pin::new(&mut **stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            TunnelStream::Tls(stream) => Pin::new(&mut **stream).poll_shutdown(cx),
        }
    }
}

/// Produces fresh tunnel connections
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial(&self) -> Result<TunnelStream>;
}

/// SOCKS5 handshake, then TLS inside the tunnel for https endpoints
pub struct SocksTunnelDialer {
    socks: Socks5Dialer,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl SocksTunnelDialer {
    pub fn new(proxy: &ProxyConfig, endpoint: &Endpoint, connect_timeout: Duration, insecure: bool) -> Result<Self> {
        let tls = match endpoint.scheme {
            Scheme::Https => {
                let server_name = ServerName::try_from(endpoint.bare_host().to_string()).map_err(|e| {
                    RegistryError::Config(format!("invalid TLS server name '{}': {}", endpoint.host, e))
                })?;
                Some((tls_connector(insecure)?, server_name))
            }
            Scheme::Http => None,
        };
        Ok(Self {
            socks: Socks5Dialer::new(proxy, endpoint, connect_timeout),
            tls,
        })
    }
}

#[async_trait]
impl TunnelDialer for SocksTunnelDialer {
    async fn dial(&self) -> Result<TunnelStream> {
        let tcp = self.socks.dial().await?;
        match &self.tls {
            Some((connector, server_name)) => {
                let tls = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| RegistryError::Connectivity(format!("TLS handshake through tunnel failed: {}", e)))?;
                Ok(TunnelStream::Tls(Box::new(tls)))
            }
            None => Ok(TunnelStream::Plain(tcp)),
        }
    }
}

/// rustls client config on the ring provider; `insecure` skips certificate checks
pub fn tls_connector(insecure: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| RegistryError::Config(format!("TLS configuration error: {}", e)))?;

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification::new(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}

mod danger {
    use std::sync::Arc;
    use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use tokio_rustls::rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any certificate but still checks handshake signatures
    #[derive(Debug)]
    pub struct NoVerification(Arc<CryptoProvider>);

    impl NoVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

/// Holds the one cached tunnel connection
pub struct TunnelSlot {
    dialer: Box<dyn TunnelDialer>,
    slot: Mutex<Option<TunnelStream>>,
    gate: Arc<Semaphore>,
    dials: AtomicU64,
    output: Logger,
}

impl TunnelSlot {
    pub fn new(dialer: Box<dyn TunnelDialer>, output: Logger) -> Self {
        Self {
            dialer,
            slot: Mutex::new(None),
            gate: Arc::new(Semaphore::new(1)),
            dials: AtomicU64::new(0),
            output,
        }
    }

    pub fn for_endpoint(
        proxy: &ProxyConfig,
        endpoint: &Endpoint,
        connect_timeout: Duration,
        insecure: bool,
        output: Logger,
    ) -> Result<Self> {
        let dialer = SocksTunnelDialer::new(proxy, endpoint, connect_timeout, insecure)?;
        Ok(Self::new(Box::new(dialer), output))
    }

    /// Connections dialed so far, initial one included
    pub fn dials(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    async fn dial(&self) -> Result<TunnelStream> {
        let stream = self.dialer.dial().await?;
        self.dials.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    /// Initial connection, retried according to `policy`
    pub async fn establish(&self, policy: &RetryPolicy) -> Result<()> {
        let stream = policy
            .run(&self.output, "SOCKS5 tunnel setup", |_| self.dial())
            .await?;
        *self.slot.lock().await = Some(stream);
        Ok(())
    }

    /// Wait for exclusive use of the tunnel, redialing once if the cached one is dead
    pub async fn acquire(self: &Arc<Self>) -> Result<TunnelLease> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| RegistryError::Proxy("tunnel has been closed".to_string()))?;

        let stream = {
            let mut slot = self.slot.lock().await;
            match slot.take() {
                Some(mut stream) => {
                    if stream.is_alive() {
                        stream
                    } else {
                        self.output.detail("Cached tunnel connection is dead, reconnecting");
                        drop(stream);
                        self.dial().await?
                    }
                }
                None => self.dial().await?,
            }
        };

        Ok(TunnelLease {
            stream,
            ticket: ReturnTicket {
                slot: Arc::clone(self),
                _permit: permit,
            },
        })
    }

    /// Drop the cached connection and refuse further leases
    pub async fn close(&self) {
        self.gate.close();
        self.slot.lock().await.take();
    }
}

/// Exclusive use of the tunnel connection
pub struct TunnelLease {
    stream: TunnelStream,
    ticket: ReturnTicket,
}

impl TunnelLease {
    pub fn into_parts(self) -> (TunnelStream, ReturnTicket) {
        (self.stream, self.ticket)
    }
}

/// Gives the connection back to the slot. Dropping it instead discards the connection.
pub struct ReturnTicket {
    slot: Arc<TunnelSlot>,
    _permit: OwnedSemaphorePermit,
}

impl ReturnTicket {
    pub async fn restore(self, stream: TunnelStream) {
        *self.slot.slot.lock().await = Some(stream);
    }
}

type ConnectionTask = JoinHandle<hyper::Result<http1::Parts<TokioIo<TunnelStream>>>>;

/// HTTP/1.1 over the leased tunnel connection
pub struct TunnelBackend {
    slot: Arc<TunnelSlot>,
    timeout: Duration,
}

impl TunnelBackend {
    pub fn new(slot: Arc<TunnelSlot>, timeout: Duration) -> Self {
        Self { slot, timeout }
    }

    fn build_request(url: &Url, headers: HeaderMap) -> Result<Request<Empty<Bytes>>> {
        let host = url
            .host_str()
            .ok_or_else(|| RegistryError::Config(format!("URL {} has no host", url)))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let mut request = Request::builder()
            .method(Method::GET)
            .uri(target)
            .body(Empty::<Bytes>::new())
            .map_err(|e| RegistryError::Config(format!("invalid request for {}: {}", url, e)))?;
        request.headers_mut().insert(HOST, HeaderValue::from_str(&authority)?);
        request.headers_mut().extend(headers);
        Ok(request)
    }

    async fn exchange(&self, lease: TunnelLease, url: &Url, request: Request<Empty<Bytes>>) -> Result<RawResponse> {
        let (stream, ticket) = lease.into_parts();

        let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| NetworkErrorHandler::handle_hyper_error(&e, url.as_str()))?;
        let connection: ConnectionTask = tokio::spawn(connection.without_shutdown());

        let response = match sender.send_request(request).await {
            Ok(response) => response,
            Err(e) => {
                connection.abort();
                return Err(NetworkErrorHandler::handle_hyper_error(&e, url.as_str()));
            }
        };

        let (parts, body) = response.into_parts();
        let state = BodyState {
            body,
            sender: Some(sender),
            connection: Some(connection),
            ticket: Some(ticket),
            url: url.to_string(),
            idle_timeout: self.timeout,
        };

        Ok(RawResponse {
            status: parts.status.as_u16(),
            headers: parts.headers,
            body: body_stream(state),
        })
    }
}

#[async_trait]
impl HttpBackend for TunnelBackend {
    async fn get(&self, url: &Url, headers: HeaderMap) -> Result<RawResponse> {
        let request = Self::build_request(url, headers)?;
        // Waiting for the lease is not part of the request deadline.
        let lease = self.slot.acquire().await?;
        timeout(self.timeout, self.exchange(lease, url, request))
            .await
            .map_err(|_| RegistryError::Transient(format!("request to {} timed out", url)))?
    }
}

struct BodyState {
    body: Incoming,
    sender: Option<SendRequest<Empty<Bytes>>>,
    connection: Option<ConnectionTask>,
    ticket: Option<ReturnTicket>,
    url: String,
    idle_timeout: Duration,
}

impl BodyState {
    /// Recover the connection from hyper and hand it back to the slot
    async fn finish(mut self) {
        self.sender.take();
        let (Some(connection), Some(ticket)) = (self.connection.take(), self.ticket.take()) else {
            return;
        };
        match connection.await {
            Ok(Ok(parts)) if parts.read_buf.is_empty() => ticket.restore(parts.io.into_inner()).await,
            _ => drop(ticket),
        }
    }
}

impl Drop for BodyState {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

fn body_stream(state: BodyState) -> BodyStream {
    futures::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            match timeout(state.idle_timeout, state.body.frame()).await {
                Err(_) => {
                    let err = RegistryError::Transient(format!("timed out reading body from {}", state.url));
                    return Some((Err(err), None));
                }
                Ok(None) => {
                    state.finish().await;
                    return None;
                }
                Ok(Some(Err(e))) => {
                    let err = NetworkErrorHandler::handle_hyper_error(&e, &state.url);
                    return Some((Err(err), None));
                }
                Ok(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return Some((Ok(data), Some(state)));
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Plain TCP dialer against a local listener, counting connections
    struct LocalDialer {
        address: std::net::SocketAddr,
    }

    #[async_trait]
    impl TunnelDialer for LocalDialer {
        async fn dial(&self) -> Result<TunnelStream> {
            let stream = TcpStream::connect(self.address).await?;
            Ok(TunnelStream::Plain(stream))
        }
    }

    async fn listener_with_slot() -> (TcpListener, Arc<TunnelSlot>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dialer = LocalDialer {
            address: listener.local_addr().unwrap(),
        };
        let slot = Arc::new(TunnelSlot::new(Box::new(dialer), Logger::new_quiet()));
        (listener, slot)
    }

    #[tokio::test]
    async fn test_live_connection_is_reused() {
        let (listener, slot) = listener_with_slot().await;
        slot.establish(&RetryPolicy::single_attempt()).await.unwrap();
        let (_server_side, _) = listener.accept().await.unwrap();

        for _ in 0..3 {
            let (stream, ticket) = slot.acquire().await.unwrap().into_parts();
            ticket.restore(stream).await;
        }
        assert_eq!(slot.dials(), 1);
    }

    #[tokio::test]
    async fn test_dead_connection_redialed_once() {
        let (listener, slot) = listener_with_slot().await;
        slot.establish(&RetryPolicy::single_attempt()).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        drop(server_side);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (stream, ticket) = slot.acquire().await.unwrap().into_parts();
        ticket.restore(stream).await;
        let (stream, ticket) = slot.acquire().await.unwrap().into_parts();
        ticket.restore(stream).await;
        assert_eq!(slot.dials(), 2);
    }

    #[tokio::test]
    async fn test_dropped_lease_forces_redial() {
        let (_listener, slot) = listener_with_slot().await;
        slot.establish(&RetryPolicy::single_attempt()).await.unwrap();

        let lease = slot.acquire().await.unwrap();
        drop(lease);
        let _lease = slot.acquire().await.unwrap();
        assert_eq!(slot.dials(), 2);
    }

    #[tokio::test]
    async fn test_one_lease_at_a_time() {
        let (_listener, slot) = listener_with_slot().await;
        slot.establish(&RetryPolicy::single_attempt()).await.unwrap();

        let held = slot.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(100), slot.acquire()).await;
        assert!(waiting.is_err(), "second lease granted while first is held");

        let (stream, ticket) = held.into_parts();
        ticket.restore(stream).await;
        assert!(slot.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_stray_bytes_mark_connection_dead() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut stream = TunnelStream::Plain(client);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stream.is_alive());

        tokio::io::AsyncWriteExt::write_all(&mut server, b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stream.is_alive());
    }

    /// Consumes everything its inner reader yields without surfacing it, the way a TLS
    /// layer absorbs records that hold no application data
    struct RecordLayer<R> {
        inner: R,
    }

    impl<R: AsyncRead + Unpin> AsyncRead for RecordLayer<R> {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            loop {
                let mut scratch = [0u8; 64];
                let mut record = ReadBuf::new(&mut scratch);
                match Pin::new(&mut self.inner).poll_read(cx, &mut record) {
                    Poll::Ready(Ok(())) if record.filled().is_empty() => return Poll::Ready(Ok(())),
                    Poll::Ready(Ok(())) => continue,
                    other => return other,
                }
            }
        }
    }

    #[tokio::test]
    async fn test_records_without_plaintext_keep_connection_alive() {
        let (mut peer, local) = tokio::io::duplex(256);
        let mut layered = RecordLayer { inner: local };
        assert!(read_side_idle(&mut layered));

        // A session ticket arriving after the handshake
        tokio::io::AsyncWriteExt::write_all(&mut peer, &[0x16, 0x03, 0x03, 0x00, 0x04, 1, 2, 3, 4])
            .await
            .unwrap();
        assert!(read_side_idle(&mut layered));

        drop(peer);
        assert!(!read_side_idle(&mut layered));
    }

    #[tokio::test]
    async fn test_pending_plaintext_marks_connection_dead() {
        let (mut peer, mut local) = tokio::io::duplex(256);
        assert!(read_side_idle(&mut local));

        tokio::io::AsyncWriteExt::write_all(&mut peer, b"HTTP/1.1 200 OK\r\n").await.unwrap();
        assert!(!read_side_idle(&mut local));
    }

    #[tokio::test]
    async fn test_closed_slot_refuses_leases() {
        let (_listener, slot) = listener_with_slot().await;
        slot.establish(&RetryPolicy::single_attempt()).await.unwrap();
        slot.close().await;
        assert!(matches!(slot.acquire().await, Err(RegistryError::Proxy(_))));
    }
}
