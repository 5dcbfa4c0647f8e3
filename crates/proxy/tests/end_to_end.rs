//! End-to-end routing through real sockets.
//!
//! A proxy is started on a loopback port with certificates from a local
//! issuer; clients connect with tokio-rustls and talk to tagged echo
//! backends through it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use tlsmux_config::ProxyConfig;
use tlsmux_proxy::{
    bind, handshake, AcmeError, CertificateIssuer, CertificateProvider, CertificateStorage,
    ChallengeManager, IssuedCertificate, ProxyContext, RotatingTicketer,
};

/// Hands out one self-signed certificate covering every test hostname.
#[derive(Debug)]
struct FixedIssuer {
    cert_pem: String,
    key_pem: String,
    issued: AtomicUsize,
}

#[async_trait]
impl CertificateIssuer for FixedIssuer {
    async fn issue(&self, _domain: &str) -> Result<IssuedCertificate, AcmeError> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCertificate {
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
        })
    }
}

/// Echo server that announces `tag` on connect.
struct Backend {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

async fn spawn_backend(tag: &'static str) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut read, mut write) = stream.into_split();
                if write.write_all(format!("{tag}\n").as_bytes()).await.is_err() {
                    return;
                }
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    Backend { addr, connections }
}

struct Harness {
    proxy: SocketAddr,
    client: Arc<ClientConfig>,
    issuer: Arc<FixedIssuer>,
    _cache: TempDir,
}

impl Harness {
    async fn start(h2: &Backend, http1: &Backend, unreachable: SocketAddr) -> Self {
        let cache = TempDir::new().unwrap();
        let config = ProxyConfig::from_json_str(&format!(
            r#"{{
                "cacheDir": {cache:?},
                "protos": [
                    {{ "name": "h2", "hosts": {{ "a.example": "{h2}", "down.example": "{down}" }} }},
                    {{ "name": "http/1.1", "hosts": {{ "b.example": "{http1}" }} }}
                ],
                "defaultProto": "http/1.1",
                "relay": {{ "dialTimeoutMs": 500 }}
            }}"#,
            cache = cache.path().display().to_string(),
            h2 = h2.addr,
            http1 = http1.addr,
            down = unreachable,
        ))
        .unwrap();
        let routes = config.routing_table().unwrap();

        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![
            "a.example".to_string(),
            "b.example".to_string(),
            "down.example".to_string(),
        ])
        .unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let cert_der: CertificateDer<'static> = cert.der().clone();

        let issuer = Arc::new(FixedIssuer {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            issued: AtomicUsize::new(0),
        });

        let storage = Arc::new(CertificateStorage::new(cache.path()).unwrap());
        let challenges = ChallengeManager::new();
        let provider = Arc::new(CertificateProvider::new(
            routes.hostnames(),
            storage,
            Arc::clone(&issuer) as Arc<dyn CertificateIssuer>,
            challenges,
            config.acme.renew_before_days,
        ));
        let ticketer = Arc::new(
            RotatingTicketer::generate(
                config.session_tickets.key_capacity,
                config.session_tickets.rotation_interval(),
            )
            .unwrap(),
        );
        let ctx = Arc::new(ProxyContext::new(routes, provider, ticketer, &config.relay).unwrap());

        let acceptor = bind("127.0.0.1", 0).unwrap();
        let proxy = acceptor.local_addr().unwrap();
        tokio::spawn(handshake::run(acceptor, ctx));

        let mut roots = RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

        Self {
            proxy,
            client: Arc::new(client),
            issuer,
            _cache: cache,
        }
    }

    async fn connect(&self, server_name: &'static str, alpn: &[&[u8]]) -> TlsStream<TcpStream> {
        let mut config = (*self.client).clone();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect(self.proxy).await.unwrap();
        let name = ServerName::try_from(server_name).unwrap();
        connector.connect(name, tcp).await.unwrap()
    }
}

async fn unused_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn read_tag(stream: &mut BufReader<TlsStream<TcpStream>>) -> String {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_line(&mut line))
        .await
        .expect("no greeting from backend")
        .unwrap();
    line.trim_end().to_string()
}

/// Reads until the proxy closes the connection; a reset also counts.
async fn expect_closed(stream: TlsStream<TcpStream>) {
    let mut stream = stream;
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("connection was not closed");
    if read.is_ok() {
        assert!(rest.is_empty());
    }
}

#[tokio::test]
async fn test_routes_by_alpn_and_sni() {
    let h2 = spawn_backend("h2").await;
    let http1 = spawn_backend("http1").await;
    let harness = Harness::start(&h2, &http1, unused_port().await).await;

    let tls = harness.connect("a.example", &[b"h2"]).await;
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));

    let mut tls = BufReader::new(tls);
    assert_eq!(read_tag(&mut tls).await, "h2");

    tls.get_mut().write_all(b"hello through the proxy").await.unwrap();
    let mut echoed = [0u8; 23];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the proxy");

    assert_eq!(h2.connections.load(Ordering::SeqCst), 1);
    assert_eq!(http1.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_no_alpn_uses_default_protocol() {
    let h2 = spawn_backend("h2").await;
    let http1 = spawn_backend("http1").await;
    let harness = Harness::start(&h2, &http1, unused_port().await).await;

    let tls = harness.connect("b.example", &[]).await;
    assert_eq!(tls.get_ref().1.alpn_protocol(), None);

    let mut tls = BufReader::new(tls);
    assert_eq!(read_tag(&mut tls).await, "http1");
    assert_eq!(h2.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unsupported_alpn_offer_uses_default_protocol() {
    let h2 = spawn_backend("h2").await;
    let http1 = spawn_backend("http1").await;
    let harness = Harness::start(&h2, &http1, unused_port().await).await;

    let tls = harness.connect("b.example", &[b"spdy/3"]).await;
    assert_eq!(tls.get_ref().1.alpn_protocol(), None);

    let mut tls = BufReader::new(tls);
    assert_eq!(read_tag(&mut tls).await, "http1");

    tls.get_mut().write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tls.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(h2.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_route_closes_without_dialing() {
    let h2 = spawn_backend("h2").await;
    let http1 = spawn_backend("http1").await;
    let harness = Harness::start(&h2, &http1, unused_port().await).await;

    // b.example has a certificate but is only routed for http/1.1
    let tls = harness.connect("b.example", &[b"h2"]).await;
    expect_closed(tls).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h2.connections.load(Ordering::SeqCst), 0);
    assert_eq!(http1.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_backend_closes_client() {
    let h2 = spawn_backend("h2").await;
    let http1 = spawn_backend("http1").await;
    let harness = Harness::start(&h2, &http1, unused_port().await).await;

    let tls = harness.connect("down.example", &[b"h2"]).await;
    expect_closed(tls).await;
}

#[tokio::test]
async fn test_certificate_issued_once_per_name() {
    let h2 = spawn_backend("h2").await;
    let http1 = spawn_backend("http1").await;
    let harness = Harness::start(&h2, &http1, unused_port().await).await;

    for _ in 0..3 {
        let mut tls = BufReader::new(harness.connect("a.example", &[b"h2"]).await);
        assert_eq!(read_tag(&mut tls).await, "h2");
    }

    assert_eq!(harness.issuer.issued.load(Ordering::SeqCst), 1);
    assert_eq!(h2.connections.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_handshake_failure_does_not_stop_listener() {
    let h2 = spawn_backend("h2").await;
    let http1 = spawn_backend("http1").await;
    let harness = Harness::start(&h2, &http1, unused_port().await).await;

    // Plaintext garbage instead of a ClientHello
    let mut raw = TcpStream::connect(harness.proxy).await.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), raw.read_to_end(&mut rest)).await;

    let mut tls = BufReader::new(harness.connect("a.example", &[b"h2"]).await);
    assert_eq!(read_tag(&mut tls).await, "h2");
}
