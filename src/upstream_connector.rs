//! Upstream Connector Module
//!
//! Connector used by the hyper client for coordinator calls and image-server
//! fetches. Plain `http` URIs get a TCP stream, `https` URIs a rustls stream
//! verified against the webpki root set.

use crate::{NodeError, Result};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

/// Connection produced by [`UpstreamConnector`].
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

fn poll_read_into<T: AsyncRead + Unpin>(
    io: &mut T,
    cx: &mut Context<'_>,
    mut buf: ReadBufCursor<'_>,
) -> Poll<io::Result<()>> {
    let mut tokio_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });
    match Pin::new(io).poll_read(cx, &mut tokio_buf) {
        Poll::Ready(Ok(())) => {
            let filled = tokio_buf.filled().len();
            unsafe {
                buf.advance(filled);
            }
            Poll::Ready(Ok(()))
        }
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
    }
}

impl Read for UpstreamStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            UpstreamStream::Plain(tcp) => poll_read_into(tcp, cx, buf),
            UpstreamStream::Tls(tls) => poll_read_into(tls.as_mut(), cx, buf),
        }
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            UpstreamStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            UpstreamStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            UpstreamStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            UpstreamStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            UpstreamStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            UpstreamStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// `tower::Service<Uri>` connector for the hyper client.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls_connector: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    /// Build a connector trusting the webpki root certificates.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| NodeError::TlsError(format!("Failed to configure TLS: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
            connect_timeout,
        })
    }
}

impl Service<Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = NodeError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let secure = match uri.scheme_str() {
                Some("https") => true,
                Some("http") => false,
                other => {
                    return Err(NodeError::ConnectionError(format!(
                        "Unsupported scheme {:?} in {}",
                        other, uri
                    )))
                }
            };
            let hostname = uri
                .host()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
                .ok_or_else(|| NodeError::ConnectionError(format!("No host in URI {}", uri)))?;
            let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

            debug!("Connecting upstream: host={}, port={}, tls={}", hostname, port, secure);

            let tcp = tokio::time::timeout(
                connect_timeout,
                TcpStream::connect((hostname.as_str(), port)),
            )
            .await
            .map_err(|_| {
                NodeError::TimeoutError(format!("Connecting to {}:{} timed out", hostname, port))
            })?
            .map_err(|e| {
                warn!("TCP connection failed to {}:{}: {}", hostname, port, e);
                NodeError::ConnectionError(format!(
                    "Failed to connect to {}:{}: {}",
                    hostname, port, e
                ))
            })?;

            if let Err(e) = tcp.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}:{}: {}", hostname, port, e);
            }

            if !secure {
                return Ok(UpstreamStream::Plain(tcp));
            }

            let server_name = ServerName::try_from(hostname.clone()).map_err(|e| {
                NodeError::TlsError(format!("Invalid server name '{}': {}", hostname, e))
            })?;

            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("TLS handshake failed to {}: {}", hostname, e);
                NodeError::TlsError(format!("TLS handshake failed to {}: {}", hostname, e))
            })?;

            debug!("TLS connection established to {}:{}", hostname, port);
            Ok(UpstreamStream::Tls(Box::new(tls)))
        })
    }
}
