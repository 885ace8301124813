//! TLS plumbing for the payload client.
//!
//! Certificate validation runs against the bundled webpki root set. A
//! failure classified as a certificate problem (unknown issuer, empty
//! trust store, expired chain) can be retried once against an
//! operator-supplied fallback CA bundle; refused connections and
//! protocol-level TLS failures never trigger the fallback.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::FetchError;

/// Build a client config trusting the bundled webpki roots, offering
/// protocol versions in descending preference order.
pub(crate) fn default_client_config() -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config_with_roots(roots)
}

/// Build a client config trusting only the operator's fallback bundle.
pub(crate) fn fallback_client_config(pem: &[u8]) -> Result<Arc<ClientConfig>, FetchError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .filter_map(|item| item.ok())
        .collect();
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(FetchError::FallbackBundle(
            "no usable certificates in bundle".into(),
        ));
    }
    Ok(client_config_with_roots(roots))
}

fn client_config_with_roots(roots: RootCertStore) -> Arc<ClientConfig> {
    let config = ClientConfig::builder_with_protocol_versions(rustls::ALL_VERSIONS)
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// True when a handshake error came from certificate validation rather
/// than the transport or the protocol. An empty trust store surfaces
/// here too (every chain fails with an unknown issuer).
pub(crate) fn is_certificate_error(err: &std::io::Error) -> bool {
    let Some(inner) = err.get_ref() else {
        return false;
    };
    let Some(tls_err) = inner.downcast_ref::<rustls::Error>() else {
        return false;
    };
    matches!(tls_err, rustls::Error::InvalidCertificate(_))
}

/// Plaintext or TLS transport under one reader type.
pub(crate) enum FetchStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for FetchStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FetchStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            FetchStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FetchStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            FetchStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            FetchStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FetchStream::Plain(s) => Pin::new(s).poll_flush(cx),
            FetchStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            FetchStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            FetchStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
