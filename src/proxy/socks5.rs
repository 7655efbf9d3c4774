//! SOCKS5 client handshake (RFC 1928, username/password per RFC 1929)
//!
//! The handshake is generic over the stream so it can be exercised against an in-memory
//! peer. Every error message carries the raw reply bytes in hex.

use crate::config::Endpoint;
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{RegistryError, Result};
use crate::proxy::ProxyConfig;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const AUTH_VERSION: u8 = 0x01;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

fn handshake_error(stage: &str, detail: impl std::fmt::Display, response: &[u8]) -> RegistryError {
    RegistryError::Proxy(format!(
        "SOCKS5 {}: {} (response: {})",
        stage,
        detail,
        hex::encode(response)
    ))
}

/// Negotiate a method, authenticate if asked to, and CONNECT to `host:port`
pub async fn handshake<S>(stream: &mut S, credentials: Option<(&str, &str)>, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, credentials).await?;
    connect(stream, host, port).await
}

async fn negotiate_method<S>(stream: &mut S, credentials: Option<(&str, &str)>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = match credentials {
        Some(_) => &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS],
        None => &[SOCKS_VERSION, 1, METHOD_NO_AUTH],
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|e| handshake_error("failed to send auth methods", e, &[]))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| handshake_error("failed to read method selection", e, &reply))?;

    if reply[0] != SOCKS_VERSION {
        return Err(handshake_error("method selection", "unexpected protocol version", &reply));
    }

    match (reply[1], credentials) {
        (METHOD_NO_AUTH, _) => Ok(()),
        (METHOD_USER_PASS, Some((username, password))) => authenticate(stream, username, password).await,
        (METHOD_USER_PASS, None) => Err(handshake_error(
            "method selection",
            "proxy requires username/password but none were supplied",
            &reply,
        )),
        _ => Err(handshake_error("method selection", "no acceptable authentication method", &reply)),
    }
}

async fn authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (user, pass) = (username.as_bytes(), password.as_bytes());
    if user.len() > 255 || pass.len() > 255 {
        return Err(RegistryError::Config(
            "SOCKS5 username and password must be at most 255 bytes".to_string(),
        ));
    }

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(AUTH_VERSION);
    request.push(user.len() as u8);
    request.extend_from_slice(user);
    request.push(pass.len() as u8);
    request.extend_from_slice(pass);
    stream
        .write_all(&request)
        .await
        .map_err(|e| handshake_error("failed to send credentials", e, &[]))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| handshake_error("failed to read authentication reply", e, &reply))?;

    if reply[1] != 0x00 {
        return Err(handshake_error("authentication", "credentials rejected", &reply));
    }
    Ok(())
}

/// Encode the CONNECT address: IP literals by type, anything else as a domain name
fn encode_target(host: &str, port: u16) -> Result<Vec<u8>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    if let Ok(ip) = bare.parse::<Ipv4Addr>() {
        request.push(ATYP_IPV4);
        request.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = bare.parse::<Ipv6Addr>() {
        request.push(ATYP_IPV6);
        request.extend_from_slice(&ip.octets());
    } else {
        let name = bare.as_bytes();
        if name.is_empty() || name.len() > 255 {
            return Err(RegistryError::Config(format!(
                "SOCKS5 target host '{}' must be 1 to 255 bytes",
                host
            )));
        }
        request.push(ATYP_DOMAIN);
        request.push(name.len() as u8);
        request.extend_from_slice(name);
    }

    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = encode_target(host, port)?;
    stream
        .write_all(&request)
        .await
        .map_err(|e| handshake_error("failed to send CONNECT", e, &[]))?;

    // VER REP RSV ATYP, then an address whose length depends on ATYP, then the port
    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| handshake_error("failed to read CONNECT reply", e, &head))?;

    if head[0] != SOCKS_VERSION {
        return Err(handshake_error("CONNECT", "unexpected protocol version", &head));
    }
    if head[1] != 0x00 {
        return Err(handshake_error(
            "CONNECT",
            format!("connect to {}:{} failed: {}", host, port, reply_message(head[1])),
            &head,
        ));
    }

    let remaining = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| handshake_error("failed to read CONNECT reply", e, &head))?;
            usize::from(len[0]) + 2
        }
        _ => return Err(handshake_error("CONNECT", "unknown bound address type", &head)),
    };

    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await.map_err(|e| {
        let mut seen = head.to_vec();
        seen.extend_from_slice(&bound);
        handshake_error("failed to read CONNECT reply", e, &seen)
    })?;
    Ok(())
}

/// Dials the proxy and runs the handshake towards the registry endpoint
#[derive(Clone)]
pub struct Socks5Dialer {
    proxy_address: String,
    credentials: Option<(String, String)>,
    target_host: String,
    target_port: u16,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Socks5Dialer {
    pub fn new(proxy: &ProxyConfig, endpoint: &Endpoint, connect_timeout: Duration) -> Self {
        Self {
            proxy_address: proxy.address(),
            credentials: proxy
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            target_host: endpoint.bare_host().to_string(),
            target_port: endpoint.port,
            connect_timeout,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn proxy_address(&self) -> &str {
        &self.proxy_address
    }

    /// TCP connect to the proxy, then a full handshake, each under its own deadline
    pub async fn dial(&self) -> Result<TcpStream> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(&self.proxy_address))
            .await
            .map_err(|_| {
                RegistryError::Proxy(format!(
                    "timed out connecting to SOCKS5 proxy {}",
                    self.proxy_address
                ))
            })?
            .map_err(|e| match NetworkErrorHandler::handle_io_error(&e, &self.proxy_address) {
                RegistryError::Connectivity(msg) => RegistryError::Proxy(msg),
                other => other,
            })?;
        let _ = stream.set_nodelay(true);

        let credentials = self
            .credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()));
        timeout(
            self.handshake_timeout,
            handshake(&mut stream, credentials, &self.target_host, self.target_port),
        )
        .await
        .map_err(|_| {
            RegistryError::Proxy(format!(
                "SOCKS5 handshake with {} timed out after {:?}",
                self.proxy_address, self.handshake_timeout
            ))
        })??;

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Read exactly `n` bytes from the proxy side of the pipe
    async fn expect_bytes<S: AsyncRead + Unpin>(peer: &mut S, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_no_auth_handshake_by_domain() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            assert_eq!(expect_bytes(&mut proxy, 3).await, [5, 1, 0]);
            proxy.write_all(&[5, 0]).await.unwrap();

            let head = expect_bytes(&mut proxy, 5).await;
            assert_eq!(head, [5, 1, 0, 3, 14]);
            assert_eq!(expect_bytes(&mut proxy, 14).await, b"registry.local");
            assert_eq!(expect_bytes(&mut proxy, 2).await, 5000u16.to_be_bytes());
            proxy.write_all(&[5, 0, 0, 1, 10, 0, 0, 1, 0x13, 0x88]).await.unwrap();
            proxy
        });

        handshake(&mut client, None, "registry.local", 5000).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_user_pass_handshake() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            assert_eq!(expect_bytes(&mut proxy, 4).await, [5, 2, 0, 2]);
            proxy.write_all(&[5, 2]).await.unwrap();

            assert_eq!(expect_bytes(&mut proxy, 2).await, [1, 5]);
            assert_eq!(expect_bytes(&mut proxy, 5).await, b"alice");
            assert_eq!(expect_bytes(&mut proxy, 1).await, [6]);
            assert_eq!(expect_bytes(&mut proxy, 6).await, b"s3cret");
            proxy.write_all(&[1, 0]).await.unwrap();

            // IPv4 literal target, domain-typed bound address in the reply
            assert_eq!(expect_bytes(&mut proxy, 10).await, [5, 1, 0, 1, 10, 1, 2, 3, 0x01, 0xbb]);
            proxy.write_all(&[5, 0, 0, 3, 4]).await.unwrap();
            proxy.write_all(b"host\x01\xbb").await.unwrap();
            proxy
        });

        handshake(&mut client, Some(("alice", "s3cret")), "10.1.2.3", 443)
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_credentials_report_raw_bytes() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            expect_bytes(&mut proxy, 4).await;
            proxy.write_all(&[5, 2]).await.unwrap();
            expect_bytes(&mut proxy, 2 + 1 + 1 + 1).await;
            proxy.write_all(&[1, 1]).await.unwrap();
            proxy
        });

        let err = handshake(&mut client, Some(("u", "p")), "registry.local", 5000)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("credentials rejected"), "{}", text);
        assert!(text.contains("0101"), "{}", text);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unacceptable_method_rejected() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            expect_bytes(&mut proxy, 3).await;
            proxy.write_all(&[5, 0xff]).await.unwrap();
            proxy
        });

        let err = handshake(&mut client, None, "registry.local", 5000).await.unwrap_err();
        assert!(err.to_string().contains("05ff"), "{}", err);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_password_demanded_without_credentials() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            expect_bytes(&mut proxy, 3).await;
            proxy.write_all(&[5, 2]).await.unwrap();
            proxy
        });

        let err = handshake(&mut client, None, "registry.local", 5000).await.unwrap_err();
        assert!(err.to_string().contains("requires username/password"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_status() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            expect_bytes(&mut proxy, 3).await;
            proxy.write_all(&[5, 0]).await.unwrap();
            expect_bytes(&mut proxy, 4 + 1 + 14 + 2).await;
            proxy.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
            proxy
        });

        let err = handshake(&mut client, None, "registry.local", 5000).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("connection refused"), "{}", text);
        assert!(text.contains("05050001"), "{}", text);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_reply_is_an_error() {
        let (mut client, mut proxy) = duplex(1024);

        let server = tokio::spawn(async move {
            expect_bytes(&mut proxy, 3).await;
            proxy.write_all(&[5]).await.unwrap();
        });

        let err = handshake(&mut client, None, "registry.local", 5000).await.unwrap_err();
        assert!(matches!(err, RegistryError::Proxy(_)));
        server.await.unwrap();
    }

    #[test]
    fn test_encode_ipv6_target() {
        let encoded = encode_target("[::1]", 5000).unwrap();
        assert_eq!(encoded[3], ATYP_IPV6);
        assert_eq!(encoded.len(), 4 + 16 + 2);
        assert!(encode_target("", 5000).is_err());
    }
}
