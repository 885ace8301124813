//! Single-shot GET client over a raw socket.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

use crate::chunked::{self, decode_chunked};
use crate::error::FetchError;
use crate::tls::{self, FetchStream};

/// Tunables for the payload client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Bound on TCP connect and TLS handshake.
    pub connect_timeout: Duration,
    /// Bound applied to every read from the server.
    pub read_timeout: Duration,
    /// Upper bound on the decoded body size.
    pub max_body_bytes: usize,
    /// PEM bundle tried once when certificate validation fails against
    /// the default roots.
    pub fallback_ca_pem: Option<Vec<u8>>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            max_body_bytes: 64 * 1024 * 1024,
            fallback_ca_pem: None,
        }
    }
}

enum HandshakeFailure {
    Timeout,
    Io(std::io::Error),
}

/// Raw-socket HTTP(S) client issuing one `GET` per call.
///
/// No keep-alive, no pooling, no redirects: the fetch target is a
/// signed, trusted reference and the response is consumed whole.
pub struct FetchClient {
    config: FetchConfig,
    default_tls: Arc<ClientConfig>,
    fallback_tls: Option<Arc<ClientConfig>>,
}

impl FetchClient {
    /// Build a client, validating the fallback bundle up front.
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let fallback_tls = match &config.fallback_ca_pem {
            Some(pem) => Some(tls::fallback_client_config(pem)?),
            None => None,
        };
        Ok(Self {
            default_tls: tls::default_client_config(),
            fallback_tls,
            config,
        })
    }

    /// Fetch `url` and return the response body.
    ///
    /// Requires exactly HTTP status 200. The body is decoded from
    /// chunked transfer encoding when the server says so, otherwise
    /// read to end of stream.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let use_tls = match parsed.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(FetchError::InvalidUrl(format!(
                    "unsupported scheme {other:?}"
                )))
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl("url has no host".into()))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .unwrap_or(if use_tls { 443 } else { 80 });

        debug!(url, "fetching payload");
        let stream = self.open_stream(&host, port, use_tls).await?;
        let mut reader = BufReader::new(stream);
        self.send_request(&mut reader, &parsed, &host, port).await?;

        let (status, reason) = self.read_status_line(&mut reader).await?;
        if status != 200 {
            return Err(FetchError::BadStatus { status, reason });
        }
        let is_chunked = self.read_headers(&mut reader).await?;
        if is_chunked {
            decode_chunked(
                &mut reader,
                self.config.read_timeout,
                self.config.max_body_bytes,
            )
            .await
        } else {
            self.read_body_to_end(&mut reader).await
        }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, FetchError> {
        let addr = format!("{host}:{port}");
        timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| FetchError::Timeout {
                stage: "connect",
                after: self.config.connect_timeout,
            })?
            .map_err(|e| FetchError::ConnectFailed { addr, source: e })
    }

    async fn handshake(
        &self,
        tcp: TcpStream,
        server_name: ServerName<'static>,
        config: Arc<ClientConfig>,
    ) -> Result<TlsStream<TcpStream>, HandshakeFailure> {
        let connector = TlsConnector::from(config);
        timeout(self.config.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| HandshakeFailure::Timeout)?
            .map_err(HandshakeFailure::Io)
    }

    async fn open_stream(
        &self,
        host: &str,
        port: u16,
        use_tls: bool,
    ) -> Result<FetchStream, FetchError> {
        let tcp = self.connect(host, port).await?;
        if !use_tls {
            return Ok(FetchStream::Plain(tcp));
        }

        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            FetchError::InvalidUrl(format!("host {host:?} is not a valid tls server name"))
        })?;

        match self
            .handshake(tcp, server_name.clone(), self.default_tls.clone())
            .await
        {
            Ok(stream) => Ok(FetchStream::Tls(Box::new(stream))),
            Err(HandshakeFailure::Timeout) => Err(FetchError::Timeout {
                stage: "tls handshake",
                after: self.config.connect_timeout,
            }),
            Err(HandshakeFailure::Io(err)) => {
                if let Some(fallback) = &self.fallback_tls {
                    if tls::is_certificate_error(&err) {
                        warn!(
                            host,
                            error = %err,
                            "certificate validation failed, retrying with fallback ca bundle"
                        );
                        let tcp = self.connect(host, port).await?;
                        return match self.handshake(tcp, server_name, fallback.clone()).await {
                            Ok(stream) => Ok(FetchStream::Tls(Box::new(stream))),
                            Err(HandshakeFailure::Timeout) => Err(FetchError::Timeout {
                                stage: "tls handshake",
                                after: self.config.connect_timeout,
                            }),
                            Err(HandshakeFailure::Io(e)) => Err(FetchError::TlsFailed {
                                host: host.to_string(),
                                detail: e.to_string(),
                            }),
                        };
                    }
                }
                Err(FetchError::TlsFailed {
                    host: host.to_string(),
                    detail: err.to_string(),
                })
            }
        }
    }

    async fn send_request(
        &self,
        reader: &mut BufReader<FetchStream>,
        url: &Url,
        host: &str,
        port: u16,
    ) -> Result<(), FetchError> {
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        let request =
            format!("GET {target} HTTP/1.1\r\nHost: {host}:{port}\r\nConnection: close\r\n\r\n");

        let stream = reader.get_mut();
        timeout(self.config.read_timeout, async {
            stream.write_all(request.as_bytes()).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| FetchError::Timeout {
            stage: "request",
            after: self.config.read_timeout,
        })?
        .map_err(|e| FetchError::Io {
            stage: "request",
            source: e,
        })
    }

    async fn read_status_line<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<(u16, String), FetchError> {
        let line = chunked::read_line(reader, self.config.read_timeout, "status line")
            .await?
            .ok_or(FetchError::UnexpectedEof {
                stage: "status line",
            })?;
        let text = String::from_utf8_lossy(&line);
        parse_status_line(text.trim_end())
    }

    async fn read_headers<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<bool, FetchError> {
        let mut is_chunked = false;
        loop {
            let line = chunked::read_line(reader, self.config.read_timeout, "headers")
                .await?
                .ok_or(FetchError::UnexpectedEof { stage: "headers" })?;
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end();
            if text.is_empty() {
                return Ok(is_chunked);
            }
            let Some((name, value)) = text.split_once(':') else {
                return Err(FetchError::MalformedResponse(format!(
                    "header line without a colon: {text:?}"
                )));
            };
            if name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.trim().eq_ignore_ascii_case("chunked")
            {
                is_chunked = true;
            }
        }
    }

    async fn read_body_to_end<R: AsyncBufRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Vec<u8>, FetchError> {
        let mut body = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let read = timeout(self.config.read_timeout, reader.read(&mut buf))
                .await
                .map_err(|_| FetchError::Timeout {
                    stage: "body",
                    after: self.config.read_timeout,
                })?;
            let n = match read {
                Ok(n) => n,
                // Identity bodies end at connection close; tolerate peers
                // that drop the link without a TLS close_notify.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
                Err(e) => {
                    return Err(FetchError::Io {
                        stage: "body",
                        source: e,
                    })
                }
            };
            if n == 0 {
                return Ok(body);
            }
            if body.len() + n > self.config.max_body_bytes {
                return Err(FetchError::MalformedResponse(format!(
                    "body larger than {} bytes",
                    self.config.max_body_bytes
                )));
            }
            body.extend_from_slice(&buf[..n]);
        }
    }
}

/// Parse `HTTP/<d>.<d> <3-digit code> <reason>`.
fn parse_status_line(line: &str) -> Result<(u16, String), FetchError> {
    let malformed = || FetchError::MalformedResponse(format!("bad status line {line:?}"));

    let rest = line.strip_prefix("HTTP/").ok_or_else(malformed)?;
    let mut parts = rest.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");
    let reason = parts.next().unwrap_or("").to_string();

    let version_ok = version.len() == 3
        && version.as_bytes()[0].is_ascii_digit()
        && version.as_bytes()[1] == b'.'
        && version.as_bytes()[2].is_ascii_digit();
    if !version_ok || code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let status = code.parse::<u16>().map_err(|_| malformed())?;
    Ok((status, reason))
}
