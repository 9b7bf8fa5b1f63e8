//! Async TCP server using Tokio.
//!
//! Accepts TCP (or TLS) connections and feeds HTTP/1.1 requests to an
//! [`App`]. Connections are persistent by default; each one is served by
//! its own task, and every request on it runs in a child task so that a
//! panicking handler costs one `500` response rather than the connection
//! loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::http::{Payload, RawRequest, RequestError, Response, StatusCode};

mod tls;

pub use tls::TlsConfig;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid listen address {0:?} (expected host:port)")]
    InvalidAddress(String),

    #[error("could not resolve {host}")]
    Resolve { host: String },

    #[error("failed to read {path}: {source}")]
    TlsFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {path}")]
    NoCertificates { path: String },

    #[error("no private key found in {path}")]
    NoPrivateKey { path: String },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// How long an idle keep-alive connection waits for its next request.
const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    pub host: String,
    pub port: u16,
    /// Pending-connection queue length passed to `listen(2)`.
    pub backlog: u32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 3000,
            backlog: 511,
        }
    }
}

impl ListenOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Parses `"host:port"`, `":port"` or `"[v6]:port"`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidAddress`] when no valid port is present.
    pub fn parse(addr: &str) -> Result<Self, ServerError> {
        let invalid = || ServerError::InvalidAddress(addr.to_owned());
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(Self::new(host, port))
    }
}

/// A bound listener serving one [`App`].
///
/// Obtained from [`App::bind`] or [`App::bind_tls`]. Once this value exists
/// the socket is listening, so [`local_addr`](Self::local_addr) can be
/// handed to clients before [`run`](Self::run) is awaited.
///
/// # Examples
///
/// ```rust,no_run
/// use keel::{App, ListenOptions};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = App::new().bind(ListenOptions::new("127.0.0.1", 0)).await?;
///     println!("listening on http://{}", server.local_addr());
///     server.run_until(async { tokio::signal::ctrl_c().await.unwrap_or(()) }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    app: Arc<App>,
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Resolve`] if the host does not resolve and
    /// [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub(crate) async fn bind(
        app: Arc<App>,
        options: &ListenOptions,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, ServerError> {
        let display = format!("{}:{}", options.host, options.port);
        let addr = tokio::net::lookup_host((options.host.as_str(), options.port))
            .await
            .map_err(|source| ServerError::Bind {
                addr: display.clone(),
                source,
            })?
            .next()
            .ok_or_else(|| ServerError::Resolve {
                host: options.host.clone(),
            })?;

        let bind_err = |source| ServerError::Bind {
            addr: display.clone(),
            source,
        };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(options.backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            app,
            tls,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections until the process is terminated.
    ///
    /// # Errors
    ///
    /// See [`run_until`](Self::run_until).
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves, then stops accepting,
    /// lets in-flight requests finish, closes idle connections and returns
    /// once every connection task has ended.
    ///
    /// # Errors
    ///
    /// Accept errors are logged and do not end the loop; this currently
    /// always returns `Ok`.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        info!(address = %self.local_addr, tls = self.tls.is_some(), env = %self.app.config().env, "keel listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "connection task failed");
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer_addr, "connection accepted");

                    let app = Arc::clone(&self.app);
                    let stop = stop_rx.clone();
                    match self.tls.clone() {
                        None => {
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, false, app, stop).await {
                                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Some(acceptor) => {
                            connections.spawn(async move {
                                let stream = match acceptor.accept(stream).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        warn!(peer = %peer_addr, error = %e, "TLS handshake failed");
                                        return;
                                    }
                                };
                                if let Err(e) = handle_connection(stream, peer_addr, true, app, stop).await {
                                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                                }
                            });
                        }
                    }
                }
            }
        }

        info!(open = connections.len(), "shutting down, draining connections");
        drop(self.listener);
        // Receivers only fail once every connection is gone.
        let _ = stop_tx.send(true);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "connection task failed during shutdown");
            }
        }
        info!("server stopped");
        Ok(())
    }
}

/// A request that cannot be handed to the application.
#[derive(Debug)]
struct Rejection {
    status: StatusCode,
    message: String,
}

impl Rejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn into_bytes(self) -> BytesMut {
        let mut response = Response::default();
        response.set_keep_alive(false);
        response
            .status(self.status.as_u16())
            .content_type("text/plain; charset=utf-8");
        // A fresh response is never already sent.
        let _ = response.send(Payload::Text(self.message));
        response.into_bytes()
    }
}

/// Per-connection limits taken from the application config.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_request_size: usize,
    body_limit: usize,
}

/// Tries to frame one request at the start of `buf`.
///
/// Returns the request (body not yet attached), the body offset and the
/// total frame length, or `None` when more bytes are needed.
fn next_request(buf: &[u8], limits: Limits) -> Result<Option<(RawRequest, usize, usize)>, Rejection> {
    let (request, body_offset) = match RawRequest::parse(buf) {
        Ok(pair) => pair,
        Err(RequestError::Incomplete) if buf.len() > limits.max_request_size => {
            return Err(Rejection::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request header fields too large",
            ));
        }
        Err(RequestError::Incomplete) => return Ok(None),
        Err(e) => return Err(Rejection::new(StatusCode::BAD_REQUEST, format!("Bad Request: {e}"))),
    };

    if request.is_chunked() {
        return Err(Rejection::new(
            StatusCode::LENGTH_REQUIRED,
            "Chunked request bodies are not supported",
        ));
    }
    let content_length = request
        .content_length()
        .map_err(|e| Rejection::new(StatusCode::BAD_REQUEST, format!("Bad Request: {e}")))?;
    let total = body_offset
        .checked_add(content_length)
        .filter(|&total| content_length <= limits.body_limit && total <= limits.max_request_size)
        .ok_or_else(|| Rejection::new(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large"))?;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((request, body_offset, total)))
}

/// Handles a single connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, stays idle past the keep-alive timeout, or the
/// server shuts down between requests.
async fn handle_connection<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    secure: bool,
    app: Arc<App>,
    mut stop: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let limits = Limits {
        max_request_size: app.config().max_request_size,
        body_limit: app.config().body_limit,
    };
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let framed = match next_request(&buf, limits) {
            Ok(framed) => framed,
            Err(rejection) => {
                warn!(peer = %peer_addr, status = rejection.status.as_u16(), reason = %rejection.message, "rejecting request");
                stream.write_all(&rejection.into_bytes()).await?;
                stream.flush().await?;
                break;
            }
        };

        let Some((mut raw, body_offset, total)) = framed else {
            // Between requests the connection may idle out or be told to stop.
            let bytes_read = if buf.is_empty() {
                if *stop.borrow() {
                    break;
                }
                tokio::select! {
                    read = tokio::time::timeout(KEEP_ALIVE_TIMEOUT, stream.read_buf(&mut buf)) => match read {
                        Ok(read) => read?,
                        Err(_) => {
                            debug!(peer = %peer_addr, "keep-alive timeout");
                            break;
                        }
                    },
                    _ = stop.changed() => break,
                }
            } else {
                stream.read_buf(&mut buf).await?
            };

            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
            continue;
        };

        let frame = buf.split_to(total).freeze();
        raw.body = frame.slice(body_offset..);
        raw.peer_addr = Some(peer_addr);
        raw.secure = secure;
        let mut keep_alive = raw.is_keep_alive();

        debug!(peer = %peer_addr, method = %raw.method, target = %raw.target, "dispatching request");

        let task_app = Arc::clone(&app);
        let bytes = match tokio::spawn(async move { task_app.handle(raw).await.into_bytes() }).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(peer = %peer_addr, error = %e, "request handler panicked");
                keep_alive = false;
                Rejection::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_bytes()
            }
        };

        stream.write_all(&bytes).await?;
        stream.flush().await?;

        if !keep_alive || *stop.borrow() {
            debug!(peer = %peer_addr, "closing connection");
            break;
        }
    }

    stream.shutdown().await.or_else(|e| match e.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => Ok(()),
        _ => Err(e),
    })
}
