use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::{BoxFuture, poll_fn};
use http::header::HOST;
use http::{HeaderValue, Request, Uri};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tower_service::Service;
use tracing::debug;
use url::Url;

use super::{AttemptProbe, RequestBody, ResponseLike, Transport, TransportRequest};
use crate::error::{BoxError, Error, ErrorCode};
use crate::util::default_port;

/// HTTP/1.1 over TCP, with TLS for `https` URLs.
///
/// Every attempt dials a fresh connection so the probe sees the full
/// socket, lookup, connect and TLS sequence.
#[derive(Clone)]
pub struct HyperTransport {
    tls_config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl HyperTransport {
    pub fn new() -> crate::Result<Self> {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::request(ErrorCode::Generic, source))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        Ok(Self::with_tls_config(tls_config))
    }

    pub fn with_tls_config(tls_config: rustls::ClientConfig) -> Self {
        Self {
            tls_config: Arc::new(tls_config),
        }
    }
}

impl Transport for HyperTransport {
    fn perform(
        &self,
        request: TransportRequest,
        probe: AttemptProbe,
    ) -> BoxFuture<'static, Result<ResponseLike, BoxError>> {
        let tls_config = (*self.tls_config).clone();
        Box::pin(async move {
            let (method, url, mut headers, body) = request.into_parts();
            let connect_uri = connect_uri(&url)?;
            let secure = url.scheme() == "https";

            let mut https = HttpsConnectorBuilder::new()
                .with_tls_config(tls_config)
                .https_or_http()
                .enable_http1()
                .wrap_connector(ProbeConnector {
                    probe: probe.clone(),
                });
            poll_fn(|cx| https.poll_ready(cx)).await?;
            let stream = https.call(connect_uri).await?;
            if secure {
                probe.secure_connect();
            }

            let (mut sender, connection) =
                hyper::client::conn::http1::handshake::<_, RequestBody>(stream).await?;
            let connection_task = tokio::spawn(async move {
                if let Err(error) = connection.await {
                    debug!(error = %error, "connection task ended with error");
                }
            });
            let guard = AbortOnDrop(connection_task.abort_handle());

            if !headers.contains_key(HOST) {
                headers.insert(HOST, host_header(&url)?);
            }
            let mut http_request = Request::builder()
                .method(method)
                .uri(origin_form(&url)?)
                .body(body)?;
            *http_request.headers_mut() = headers;

            let response = sender.send_request(http_request).await?;
            let (parts, incoming) = response.into_parts();
            let body = GuardedBody {
                inner: incoming,
                _guard: guard,
            };
            Ok(ResponseLike::streaming(parts.status, parts.headers, body).with_version(parts.version))
        })
    }
}

fn connect_uri(url: &Url) -> Result<Uri, BoxError> {
    let host = url.host_str().ok_or("url has no host")?;
    let port = default_port(url).ok_or("url has no port")?;
    Ok(format!("{}://{host}:{port}/", url.scheme()).parse()?)
}

fn origin_form(url: &Url) -> Result<Uri, BoxError> {
    let mut target = url.path().to_owned();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    Ok(target.parse()?)
}

fn host_header(url: &Url) -> Result<HeaderValue, BoxError> {
    let host = url.host_str().ok_or("url has no host")?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    Ok(HeaderValue::from_str(&value)?)
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Response body that tears the connection down when dropped.
struct GuardedBody {
    inner: Incoming,
    _guard: AbortOnDrop,
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[derive(Clone)]
struct ProbeConnector {
    probe: AttemptProbe,
}

impl Service<Uri> for ProbeConnector {
    type Response = ProbedStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let probe = self.probe.clone();
        Box::pin(async move {
            let host = dst
                .host()
                .ok_or("connect uri has no host")?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_owned();
            let port = dst.port_u16().ok_or("connect uri has no port")?;
            let literal = host.parse::<IpAddr>().ok();

            probe.socket(false, literal.is_none());
            let addresses: Vec<SocketAddr> = match literal {
                Some(ip) => vec![SocketAddr::new(ip, port)],
                None => {
                    let resolved = tokio::net::lookup_host((host.as_str(), port))
                        .await?
                        .collect::<Vec<_>>();
                    probe.lookup();
                    resolved
                }
            };
            if addresses.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses resolved for {host}"),
                )
                .into());
            }

            let mut last_error = None;
            for address in addresses {
                match TcpStream::connect(address).await {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        probe.connect(Some(address));
                        return Ok(ProbedStream {
                            inner: TokioIo::new(stream),
                            probe,
                        });
                    }
                    Err(error) => last_error = Some(error),
                }
            }
            Err(match last_error {
                Some(error) => error.into(),
                None => "connect failed".into(),
            })
        })
    }
}

/// TCP stream that reports socket activity to the probe.
struct ProbedStream {
    inner: TokioIo<TcpStream>,
    probe: AttemptProbe,
}

impl HyperRead for ProbedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            this.probe.activity();
        }
        polled
    }
}

impl HyperWrite for ProbedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = polled
            && written > 0
        {
            this.probe.activity();
        }
        polled
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connection for ProbedStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}
