//! Rate-limited, retrying HTTP transport for Docker Registry API v2 requests
//!
//! Every registry call goes through [`Transport::request`]: it waits for a token from the
//! shared [`RateLimiter`], attaches the standard and authentication headers, retries
//! transient failures, and maps the status code. The bytes on the wire are produced by an
//! [`HttpBackend`]: reqwest for direct and HTTP proxy access, or the SOCKS5 tunnel.

use crate::config::{AuthConfig, DumpConfig};
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::proxy::ProxyKind;
use crate::proxy::tunnel::{TunnelBackend, TunnelSlot};
use crate::registry::progress::ProgressTracker;
use crate::registry::rate_limit::RateLimiter;
use crate::registry::retry::RetryPolicy;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use http::header::{ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, USER_AGENT, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// Manifest media types offered on every request
pub const MANIFEST_ACCEPT: &str =
    "application/vnd.docker.distribution.manifest.v2+json, application/vnd.oci.image.manifest.v1+json";
pub const MAX_REDIRECTS: usize = 10;

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Response as produced by a backend, before status mapping
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

/// Something that can perform a single GET
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn get(&self, url: &Url, headers: HeaderMap) -> Result<RawResponse>;
}

/// Pooled reqwest client for direct access and HTTP/HTTPS proxies
/// The timeout bounds the wait for response headers and each body read, never the
/// whole transfer, so a slow but steady blob still completes.
pub struct ReqwestBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestBackend {
    pub fn new(config: &DumpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .read_timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(1)
            .http1_only()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .danger_accept_invalid_certs(config.insecure);

        builder = match &config.proxy {
            Some(proxy) if proxy.kind != ProxyKind::Socks5 => builder.proxy(proxy.reqwest_proxy()?),
            _ => builder.no_proxy(),
        };

        let client = builder
            .build()
            .map_err(|e| RegistryError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn get(&self, url: &Url, headers: HeaderMap) -> Result<RawResponse> {
        let pending = self.client.get(url.clone()).headers(headers).send();
        let response = timeout(self.timeout, pending)
            .await
            .map_err(|_| RegistryError::Transient(format!("request to {} timed out waiting for headers", url)))?
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, url.as_str()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let source = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| NetworkErrorHandler::handle_network_error(&e, &source)))
            .boxed();

        Ok(RawResponse { status, headers, body })
    }
}

/// A successful (or probed) registry response with a streaming body
pub struct RegistryResponse {
    url: String,
    status: u16,
    headers: HeaderMap,
    body: BodyStream,
}

impl RegistryResponse {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    /// Collect the whole body; meant for catalog pages, tag lists and manifests
    pub async fn bytes(self) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(self.content_length().unwrap_or(0).min(1 << 20) as usize);
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    pub fn into_stream(self) -> BodyStream {
        self.body
    }

    /// Body stream that reports progress under `label` as chunks arrive
    pub fn into_progress_stream(self, label: String, output: Logger) -> BodyStream {
        let tracker = ProgressTracker::new(self.content_length(), output, label);
        futures::stream::unfold((self.body, Some(tracker)), |(mut body, mut tracker)| async move {
            match body.next().await {
                Some(Ok(chunk)) => {
                    if let Some(tracker) = tracker.as_mut() {
                        tracker.advance(chunk.len() as u64);
                    }
                    Some((Ok(chunk), (body, tracker)))
                }
                // The caller stops at the first error; no summary for a failed body.
                Some(Err(err)) => Some((Err(err), (body, None))),
                None => {
                    if let Some(tracker) = tracker.take() {
                        tracker.finish();
                    }
                    None
                }
            }
        })
        .boxed()
    }
}

/// Apply credentials then custom headers. Custom headers win, including over Authorization.
pub fn apply_auth(headers: &mut HeaderMap, auth: &AuthConfig) -> Result<()> {
    if let Some((username, password)) = auth.basic_credentials() {
        let token = BASE64.encode(format!("{}:{}", username, password));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Basic {}", token))?);
    } else if let Some(token) = auth.bearer_token() {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token))?);
    }

    for (name, value) in &auth.headers {
        headers.insert(HeaderName::from_bytes(name.as_bytes())?, HeaderValue::from_str(value)?);
    }
    Ok(())
}

pub struct Transport {
    backend: Box<dyn HttpBackend>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    user_agent: HeaderValue,
    tunnel: Option<Arc<TunnelSlot>>,
    output: Logger,
}

impl Transport {
    /// Build the backend the configuration calls for. A SOCKS5 tunnel is established
    /// here, so an unreachable proxy fails the run before any registry request.
    pub async fn connect(config: &DumpConfig, output: Logger) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::per_second(config.rate_limit)?;
        let user_agent = HeaderValue::from_str(&config.user_agent)?;

        let (backend, tunnel): (Box<dyn HttpBackend>, Option<Arc<TunnelSlot>>) = match &config.proxy {
            Some(proxy) if proxy.kind == ProxyKind::Socks5 => {
                output.step(&format!(
                    "Connecting to SOCKS5 proxy {} for {}",
                    proxy.address(),
                    config.endpoint.authority()
                ));
                let slot = Arc::new(TunnelSlot::for_endpoint(
                    proxy,
                    &config.endpoint,
                    config.connect_timeout,
                    config.insecure,
                    output.clone(),
                )?);
                slot.establish(&RetryPolicy::proxy_dial()).await?;
                output.success(&format!("SOCKS5 tunnel established via {}", proxy.address()));
                let backend = TunnelBackend::new(Arc::clone(&slot), config.timeout);
                (Box::new(backend), Some(slot))
            }
            Some(proxy) => {
                output.info(&format!("Using proxy {}", proxy.display_url()));
                (Box::new(ReqwestBackend::new(config)?), None)
            }
            None => (Box::new(ReqwestBackend::new(config)?), None),
        };

        Ok(Self {
            backend,
            limiter,
            retry: RetryPolicy::transport(),
            user_agent,
            tunnel,
            output,
        })
    }

    /// Transport over an arbitrary backend
    pub fn with_backend(backend: Box<dyn HttpBackend>, limiter: RateLimiter, user_agent: &str, output: Logger) -> Result<Self> {
        Ok(Self {
            backend,
            limiter,
            retry: RetryPolicy::transport(),
            user_agent: HeaderValue::from_str(user_agent)?,
            tunnel: None,
            output,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn tunnel(&self) -> Option<&Arc<TunnelSlot>> {
        self.tunnel.as_ref()
    }

    fn build_headers(&self, auth: &AuthConfig) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, self.user_agent.clone());
        headers.insert(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        apply_auth(&mut headers, auth)?;
        Ok(headers)
    }

    /// Rate-limited, retried GET that returns whatever status the registry answered
    pub async fn send(&self, url: &str, auth: &AuthConfig) -> Result<RegistryResponse> {
        let parsed = Url::parse(url)?;
        let headers = self.build_headers(auth)?;
        let backend = &self.backend;
        let limiter = &self.limiter;

        self.output.verbose(&format!("GET {}", url));
        let raw = self
            .retry
            .run(&self.output, &format!("GET {}", url), |_attempt| {
                let headers = headers.clone();
                let parsed = parsed.clone();
                async move {
                    limiter.acquire().await;
                    backend.get(&parsed, headers).await
                }
            })
            .await?;

        Ok(RegistryResponse {
            url: url.to_string(),
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
        })
    }

    /// GET that succeeds only on 200
    pub async fn request(&self, url: &str, auth: &AuthConfig) -> Result<RegistryResponse> {
        let response = self.send(url, auth).await?;
        match response.status {
            200 => Ok(response),
            401 => Err(RegistryError::Unauthorized {
                url: url.to_string(),
                challenge: response.header(WWW_AUTHENTICATE.as_str()).map(str::to_string),
            }),
            status => Err(RegistryError::Status {
                url: url.to_string(),
                status,
            }),
        }
    }

    /// Release pooled connections
    pub async fn close(&self) {
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_request_head(socket: &mut TcpStream) -> bool {
        let mut head = Vec::new();
        let mut chunk = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return false,
                Ok(n) => head.extend_from_slice(&chunk[..n]),
            }
        }
        true
    }

    /// Hang up on the first connection mid-request, answer 200 on every later one
    async fn serve_after_hangup(accepted: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let connection = accepted.fetch_add(1, Ordering::SeqCst);
                if !read_request_head(&mut socket).await {
                    continue;
                }
                if connection == 0 {
                    drop(socket);
                    continue;
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}")
                    .await;
            }
        });
        format!("http://{}", address)
    }

    #[tokio::test]
    async fn test_hangup_retried_with_fresh_token() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let base = serve_after_hangup(Arc::clone(&accepted)).await;

        let endpoint = Endpoint::parse(&base, 5000).unwrap();
        let config = DumpConfig::new(endpoint).with_rate_limit(1000);
        let transport = Transport::connect(&config, Logger::new_quiet()).await.unwrap();

        let response = transport
            .request(&format!("{}/v2/", base), &AuthConfig::anonymous())
            .await
            .expect("dropped connection was not retried");

        assert_eq!(response.status(), 200);
        assert_eq!(transport.limiter().admitted(), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                if read_request_head(&mut socket).await {
                    let _ = socket
                        .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                }
            }
        });

        let base = format!("http://{}", address);
        let config = DumpConfig::new(Endpoint::parse(&base, 5000).unwrap()).with_rate_limit(1000);
        let transport = Transport::connect(&config, Logger::new_quiet()).await.unwrap();

        let err = match transport
            .request(&format!("{}/v2/missing/tags/list", base), &AuthConfig::anonymous())
            .await
        {
            Ok(_) => panic!("404 was accepted"),
            Err(err) => err,
        };
        assert!(matches!(err, RegistryError::Status { status: 404, .. }));
        assert_eq!(transport.limiter().admitted(), 1);
    }
}
