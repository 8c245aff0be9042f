//! Listener and accept loop in front of a [`Dispatcher`]

use crate::dispatch::{ClientInfo, Dispatcher};
use crate::ProxyError;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Bound on a client's TLS handshake
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound listener serving one dispatcher
///
/// Each accepted connection runs in its own task. Shutdown first asks every
/// connection to finish in-flight requests and aborts whatever is still
/// running once the grace period is over.
pub struct ProxyServer {
    local_addr: SocketAddr,
    secure: bool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    /// Bind `addr` and start accepting; TLS is terminated when `tls` is set
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<Arc<ServerConfig>>,
        dispatcher: Dispatcher,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        let secure = tls.is_some();

        info!(
            "{} listener bound on {}",
            if secure { "HTTPS" } else { "HTTP" },
            local_addr
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = tls.map(TlsAcceptor::from);
        let task = tokio::spawn(accept_loop(listener, acceptor, dispatcher, shutdown_rx));

        Ok(Self {
            local_addr,
            secure,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether the accept loop is still alive
    pub async fn is_running(&self) -> bool {
        matches!(self.task.lock().await.as_ref(), Some(task) if !task.is_finished())
    }

    /// Stop accepting and close every connection
    ///
    /// Waits up to `grace` for in-flight requests, then force-closes the rest.
    /// Returns `true` when shutdown finished gracefully. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self, grace: Duration) -> Result<bool, ProxyError> {
        let Some(mut task) = self.task.lock().await.take() else {
            return Ok(true);
        };

        let _ = self.shutdown_tx.send(true);

        match timeout(grace, &mut task).await {
            Ok(Ok(())) => {
                info!("Listener on {} stopped", self.local_addr);
                Ok(true)
            }
            Ok(Err(e)) if e.is_cancelled() => Ok(true),
            Ok(Err(e)) => Err(ProxyError::ListenerFailed {
                addr: self.local_addr,
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(
                    "Listener on {} did not drain within {:?}, forcing close",
                    self.local_addr, grace
                );
                task.abort();
                let _ = task.await;
                Ok(false)
            }
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                let _ = self.shutdown_tx.send(true);
                task.abort();
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    dispatcher: Dispatcher,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted connection from {}", peer_addr);
                    connections.spawn(handle_connection(
                        stream,
                        peer_addr,
                        acceptor.clone(),
                        dispatcher.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Release the port before draining connections
    drop(listener);
    debug!("Draining {} connection(s)", connections.len());
    while connections.join_next().await.is_some() {}
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    dispatcher: Dispatcher,
    shutdown_rx: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);

    match acceptor {
        Some(acceptor) => match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => {
                serve(tls_stream, peer_addr, true, dispatcher, shutdown_rx).await
            }
            Ok(Err(e)) => debug!("TLS handshake failed from {}: {}", peer_addr, e),
            Err(_) => debug!("TLS handshake from {} timed out", peer_addr),
        },
        None => serve(stream, peer_addr, false, dispatcher, shutdown_rx).await,
    }
}

async fn serve<S>(
    io: S,
    peer_addr: SocketAddr,
    secure: bool,
    dispatcher: Dispatcher,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let client = ClientInfo { peer_addr, secure };
    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        let client = client.clone();
        async move { Ok::<_, Infallible>(dispatcher.dispatch(req, client).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut draining = *shutdown_rx.borrow();
    if draining {
        conn.as_mut().graceful_shutdown();
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!("Connection from {} closed: {}", peer_addr, e);
                }
                break;
            }
            _ = shutdown_rx.changed(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}
