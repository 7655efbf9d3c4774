//! SOCKS5 tunnel reuse and redial against a scripted proxy.
//!
//! The proxy speaks just enough SOCKS5 to accept a no-auth CONNECT, then relays to a
//! wiremock registry. A `Notify` lets the test cut every live relay.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use registry_dumper::error::ErrorKind;
use registry_dumper::proxy::ProxyConfig;
use registry_dumper::registry::CatalogOperations;
use registry_dumper::{AuthConfig, DumpConfig, Endpoint, Logger, RegistrySession, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct ScriptedProxy {
    address: SocketAddr,
    handshakes: Arc<AtomicUsize>,
    kill: Arc<Notify>,
}

async fn serve_handshake(client: &mut TcpStream) -> io::Result<()> {
    let mut greeting = [0u8; 3];
    client.read_exact(&mut greeting).await?;
    if greeting != [0x05, 0x01, 0x00] {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected greeting"));
    }
    client.write_all(&[0x05, 0x00]).await?;

    let mut head = [0u8; 4];
    client.read_exact(&mut head).await?;
    if head[..3] != [0x05, 0x01, 0x00] {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected request"));
    }
    let remaining = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "bad address type")),
    };
    let mut target = vec![0u8; remaining];
    client.read_exact(&mut target).await?;

    client
        .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
        .await
}

/// Accept SOCKS5 clients and relay each one to `upstream`
async fn start_proxy(upstream: SocketAddr) -> ScriptedProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let kill = Arc::new(Notify::new());

    let counter = Arc::clone(&handshakes);
    let switch = Arc::clone(&kill);
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            let switch = Arc::clone(&switch);
            tokio::spawn(async move {
                let killed = switch.notified();
                tokio::pin!(killed);

                if serve_handshake(&mut client).await.is_err() {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let Ok(mut registry) = TcpStream::connect(upstream).await else {
                    return;
                };
                tokio::select! {
                    _ = copy_bidirectional(&mut client, &mut registry) => {}
                    _ = &mut killed => {}
                }
            });
        }
    });

    ScriptedProxy {
        address,
        handshakes,
        kill,
    }
}

async fn mount_catalog(mock_server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "repositories": ["alpine", "busybox"]
        })))
        .mount(mock_server)
        .await;
}

fn socks_config(mock_server: &MockServer, proxy: SocketAddr) -> DumpConfig {
    let endpoint = Endpoint::parse(&mock_server.uri(), 5000).unwrap();
    let proxy = ProxyConfig::parse(&format!("socks5://{}", proxy), None, None).unwrap();
    DumpConfig::new(endpoint)
        .with_rate_limit(1000)
        .with_connect_timeout(Duration::from_secs(2))
        .with_proxy(Some(proxy))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tunnel_reused_then_redialed_once_after_drop() {
    let mock_server = MockServer::start().await;
    mount_catalog(&mock_server).await;
    let proxy = start_proxy(*mock_server.address()).await;

    let config = socks_config(&mock_server, proxy.address);
    let output = Logger::new_quiet();
    let transport = Arc::new(Transport::connect(&config, output.clone()).await.unwrap());
    let tunnel = Arc::clone(transport.tunnel().expect("SOCKS5 config builds a tunnel"));
    assert_eq!(proxy.handshakes.load(Ordering::SeqCst), 1);

    let session = RegistrySession::new(
        Arc::clone(&transport),
        config.endpoint.clone(),
        AuthConfig::anonymous(),
        output,
    );
    let catalog = CatalogOperations::new(session, 100);

    for _ in 0..2 {
        let repositories = catalog.list_repositories().await.unwrap();
        assert_eq!(repositories, vec!["alpine", "busybox"]);
    }
    assert_eq!(proxy.handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(tunnel.dials(), 1);

    // Cut the relay; the cached connection now fails its liveness probe
    proxy.kill.notify_waiters();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let repositories = catalog.list_repositories().await.unwrap();
    assert_eq!(repositories, vec!["alpine", "busybox"]);
    assert_eq!(proxy.handshakes.load(Ordering::SeqCst), 2);
    assert_eq!(tunnel.dials(), 2);

    let repositories = catalog.list_repositories().await.unwrap();
    assert_eq!(repositories.len(), 2);
    assert_eq!(proxy.handshakes.load(Ordering::SeqCst), 2);

    transport.close().await;
}

#[tokio::test]
async fn test_rejecting_proxy_fails_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 3];
                if client.read_exact(&mut greeting).await.is_ok() {
                    let _ = client.write_all(&[0x05, 0xff]).await;
                }
            });
        }
    });

    let mock_server = MockServer::start().await;
    let config = socks_config(&mock_server, address);
    let err = match Transport::connect(&config, Logger::new_quiet()).await {
        Ok(_) => panic!("connect through a rejecting proxy succeeded"),
        Err(err) => err,
    };

    assert_eq!(err.kind(), ErrorKind::Connectivity);
    assert!(err.to_string().contains("05ff"), "unexpected error: {}", err);
}
