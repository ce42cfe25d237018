//! Server-side acceptor yielding framed, optionally TLS, connections.
//!
//! Every accepted connection gets a reader loop that hands each request to a
//! [`RequestHandler`] and a writer task fed through the connection's handle in
//! the [`ConnectionMap`]. The map doubles as the server's kill switch:
//! [`Server::drop_all`] severs every link, which is how the client's
//! reconnection path is exercised end to end.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_rustls::TlsAcceptor;

use crate::framing::{FrameConfig, read_frame, write_frame};
use crate::socket::{SocketConfig, configure_stream, create_listener};
use crate::transport::TransportError;

/// Identifier assigned to an accepted connection, unique per [`ConnectionMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// The server already holds its maximum number of connections.
#[derive(Debug, thiserror::Error)]
#[error("connection limit of {limit} reached")]
pub struct ConnectionLimitReached {
    /// Configured maximum.
    pub limit: usize,
}

/// Handle to one accepted connection.
struct ConnectionHandle {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close_tx: watch::Sender<bool>,
}

/// Active connections keyed by [`ConnectionId`].
pub struct ConnectionMap {
    handles: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
    limit: usize,
}

impl ConnectionMap {
    /// Empty map admitting at most `limit` connections.
    pub fn new(limit: usize) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            limit,
        }
    }

    /// Admit a connection and assign its id. Ids are never reused.
    async fn register(&self, handle: ConnectionHandle) -> Result<ConnectionId, ConnectionLimitReached> {
        let mut handles = self.handles.write().await;
        if handles.len() >= self.limit {
            return Err(ConnectionLimitReached { limit: self.limit });
        }
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        handles.insert(id, handle);
        Ok(id)
    }

    async fn remove(&self, id: &ConnectionId) -> bool {
        self.handles.write().await.remove(id).is_some()
    }

    /// Push an unsolicited payload to one connection.
    pub async fn send_to(&self, id: ConnectionId, payload: Vec<u8>) -> Result<(), TransportError> {
        let map = self.handles.read().await;
        let handle = map.get(&id).ok_or(TransportError::NotConnected)?;
        handle
            .outbound
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    /// Close one connection.
    pub async fn close(&self, id: ConnectionId) -> bool {
        match self.handles.read().await.get(&id) {
            Some(handle) => {
                let _ = handle.close_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Close every connection and return how many were closed.
    pub async fn close_all(&self) -> usize {
        let map = self.handles.read().await;
        for (id, handle) in map.iter() {
            tracing::debug!("Closing connection {id:?} from {}", handle.peer);
            let _ = handle.close_tx.send(true);
        }
        map.len()
    }

    /// IDs of all live connections.
    pub async fn ids(&self) -> Vec<ConnectionId> {
        self.handles.read().await.keys().copied().collect()
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// Whether no connection is live.
    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }
}

/// Produces the reply for one request, or `None` to stay silent.
pub type RequestHandler = Arc<dyn Fn(ConnectionId, Vec<u8>) -> Option<Vec<u8>> + Send + Sync>;

/// Configuration for [`Server`].
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:13400`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 64.
    pub max_connections: usize,
    /// Frame size limits.
    pub frame: FrameConfig,
    /// Socket options for accepted streams.
    pub socket: SocketConfig,
    /// TLS acceptor; `None` serves plain TCP.
    pub tls: Option<TlsAcceptor>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 13400)),
            max_connections: 64,
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
            tls: None,
        }
    }
}

/// Framed request/reply server.
pub struct Server {
    config: ServerConfig,
    handler: RequestHandler,
    /// Live connections, for pushing to or closing individual clients.
    pub connections: Arc<ConnectionMap>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Create a server answering requests with `handler`.
    pub fn new(config: ServerConfig, handler: RequestHandler) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            config,
            handler,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A server that replies to every request with the request itself.
    pub fn echo(config: ServerConfig) -> Self {
        Self::new(config, Arc::new(|_, request| Some(request)))
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = create_listener(self.config.bind_addr, &self.config.socket)?;
        tracing::info!("Server listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = result?;
                    if let Err(e) = configure_stream(&stream, &self.config.socket) {
                        tracing::warn!("Rejecting {peer}: {e}");
                        continue;
                    }

                    let (outbound, outbound_rx) = mpsc::unbounded_channel();
                    let (close_tx, close_rx) = watch::channel(false);
                    let handle = ConnectionHandle { peer, outbound: outbound.clone(), close_tx };

                    let id = match self.connections.register(handle).await {
                        Ok(id) => id,
                        Err(e) => {
                            tracing::warn!("Rejecting {peer}: {e}");
                            continue;
                        }
                    };
                    tracing::info!("Accepted connection {id:?} from {peer}");

                    let session = Session {
                        id,
                        frame: self.config.frame.clone(),
                        handler: Arc::clone(&self.handler),
                        outbound,
                        outbound_rx,
                        close_rx,
                        shutdown_rx: self.shutdown_rx.clone(),
                        connections: Arc::clone(&self.connections),
                    };
                    let connections = Arc::clone(&self.connections);
                    let tls = self.config.tls.clone();

                    tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => session.run(stream).await,
                                Err(e) => tracing::warn!("TLS handshake with {peer} failed: {e}"),
                            },
                            None => session.run(stream).await,
                        }
                        connections.remove(&id).await;
                        tracing::info!("Connection {id:?} closed");
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Sever every live connection without stopping the accept loop.
    pub async fn drop_all(&self) -> usize {
        self.connections.close_all().await
    }

    /// Signal the server and all its connections to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// State owned by one connection task.
struct Session {
    id: ConnectionId,
    frame: FrameConfig,
    handler: RequestHandler,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    close_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    connections: Arc<ConnectionMap>,
}

impl Session {
    async fn run<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Session {
            id,
            frame,
            handler,
            outbound,
            mut outbound_rx,
            mut close_rx,
            mut shutdown_rx,
            connections,
        } = self;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let writer_frame = frame.clone();
        let mut writer_close = close_rx.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = outbound_rx.recv() => match next {
                        Some(payload) => {
                            if write_frame(&mut writer, &payload, &writer_frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_close.changed() => break,
                }
            }
            let _ = writer.shutdown().await;
        });

        loop {
            tokio::select! {
                result = read_frame(&mut reader, &frame) => match result {
                    Ok(request) => {
                        tracing::trace!("Connection {id:?} received {} bytes", request.len());
                        if let Some(reply) = handler(id, request) {
                            let _ = outbound.send(reply);
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Connection {id:?} read ended: {e}");
                        break;
                    }
                },
                _ = close_rx.changed() => break,
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Dropping the map entry releases the last outbound sender so the
        // writer drains and exits.
        connections.remove(&id).await;
        drop(outbound);
        drop(reader);
        let _ = writer_task.await;
    }
}
