//! TLS tests: default-root rejection and the one-shot fallback CA retry.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use steward_fetch::{FetchClient, FetchConfig, FetchError};

/// Spawn a TLS server with a locally-generated self-signed certificate.
/// Accepts connections until dropped; each successful handshake gets
/// `response`. Returns the address and the CA bundle PEM that validates
/// the server.
async fn spawn_tls_server(response: Vec<u8>) -> (SocketAddr, String, JoinHandle<()>) {
    let certified_key =
        rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("generate cert");
    let ca_pem = certified_key.cert.pem();

    let cert_chain = vec![certified_key.cert.der().clone()];
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
        certified_key.key_pair.serialize_der(),
    ));
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .expect("server config");
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            let response = response.clone();
            tokio::spawn(async move {
                // Handshakes against untrusting clients fail here; keep
                // accepting so the fallback retry can land.
                let Ok(mut tls) = acceptor.accept(socket).await else {
                    return;
                };
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let Ok(n) = tls.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = tls.write_all(&response).await;
                let _ = tls.shutdown().await;
            });
        }
    });

    (addr, ca_pem, handle)
}

#[tokio::test]
async fn test_unknown_ca_fails_without_fallback() {
    let response = b"HTTP/1.1 200 OK\r\n\r\nnever seen".to_vec();
    let (addr, _ca_pem, _server) = spawn_tls_server(response).await;

    let client = FetchClient::new(FetchConfig::default()).expect("client");
    let err = client
        .get(&format!("https://localhost:{}/payload", addr.port()))
        .await
        .expect_err("self-signed cert must fail against default roots");
    assert!(
        matches!(err, FetchError::TlsFailed { .. }),
        "expected TlsFailed, got {err:?}"
    );
}

#[tokio::test]
async fn test_fallback_ca_retry_succeeds() {
    let response = b"HTTP/1.1 200 OK\r\n\r\nsigned payload body".to_vec();
    let (addr, ca_pem, _server) = spawn_tls_server(response).await;

    let client = FetchClient::new(FetchConfig {
        fallback_ca_pem: Some(ca_pem.into_bytes()),
        ..FetchConfig::default()
    })
    .expect("client");

    let body = client
        .get(&format!("https://localhost:{}/payload", addr.port()))
        .await
        .expect("fallback retry should succeed");
    assert_eq!(body, b"signed payload body");
}

#[tokio::test]
async fn test_fallback_not_tried_for_refused_connection() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    };

    let certified_key =
        rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("generate cert");
    let client = FetchClient::new(FetchConfig {
        fallback_ca_pem: Some(certified_key.cert.pem().into_bytes()),
        ..FetchConfig::default()
    })
    .expect("client");

    let err = client
        .get(&format!("https://localhost:{}/payload", addr.port()))
        .await
        .expect_err("refused connect must not reach the fallback path");
    assert!(
        matches!(err, FetchError::ConnectFailed { .. }),
        "expected ConnectFailed, got {err:?}"
    );
}
