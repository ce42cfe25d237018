//! TCP (optionally TLS) implementation of [`Transport`].
//!
//! Each successful `connect` installs a *link*: a reader task turning frames
//! into [`TransportEvent::Message`]s and a writer task draining an outbound
//! queue. Whichever side notices the stream dying first flips the link's
//! `closed` flag and emits a single [`TransportEvent::Dropped`]. A local
//! `shutdown` flips the flag first, so it never produces a drop event.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;

use crate::framing::{FrameConfig, FrameError, read_frame, write_frame};
use crate::socket::{SocketConfig, configure_stream};
use crate::tls::{TlsError, TlsSettings};
use crate::transport::{EventSink, Transport, TransportError, TransportEvent};

/// Options for [`TcpTransport`].
#[derive(Debug, Clone, Default)]
pub struct TcpTransportConfig {
    /// Frame size limits.
    pub frame: FrameConfig,
    /// Socket options applied after connect.
    pub socket: SocketConfig,
    /// TLS parameters; `None` means plain TCP.
    pub tls: Option<TlsSettings>,
}

impl From<&tsp_config::Config> for TcpTransportConfig {
    fn from(config: &tsp_config::Config) -> Self {
        Self {
            frame: FrameConfig::from(&config.framing),
            socket: SocketConfig::default(),
            tls: TlsSettings::from_config(&config.tls),
        }
    }
}

/// One established connection.
struct Link {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Link {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }
}

/// Stream transport over TCP with optional TLS.
pub struct TcpTransport {
    config: TcpTransportConfig,
    connector: Option<TlsConnector>,
    link: Mutex<Option<Link>>,
}

impl TcpTransport {
    /// Create a transport. Fails only if the TLS settings are unusable.
    pub fn new(config: TcpTransportConfig) -> Result<Self, TlsError> {
        let connector = config.tls.as_ref().map(TlsSettings::connector).transpose()?;
        Ok(Self {
            config,
            connector,
            link: Mutex::new(None),
        })
    }

    /// Plain TCP transport with default framing and socket options.
    pub fn plain() -> Self {
        Self {
            config: TcpTransportConfig::default(),
            connector: None,
            link: Mutex::new(None),
        }
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock_link().as_ref().filter(|l| l.is_open()).map(|l| l.peer)
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn establish(
        &self,
        host: &str,
        port: u16,
        events: EventSink,
    ) -> Result<(), TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        configure_stream(&stream, &self.config.socket)?;
        let peer = stream.peer_addr()?;

        match (&self.connector, &self.config.tls) {
            (Some(connector), Some(tls)) => {
                let name = tls
                    .server_name_for(host)
                    .map_err(TransportError::InvalidServerName)?;
                let stream = connector.connect(name, stream).await?;
                tracing::debug!("TLS handshake with {peer} complete");
                self.install(stream, peer, events);
            }
            _ => self.install(stream, peer, events),
        }
        Ok(())
    }

    fn install<S>(&self, stream: S, peer: SocketAddr, events: EventSink)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(
            reader,
            self.config.frame.clone(),
            events.clone(),
            Arc::clone(&closed),
            shutdown_rx.clone(),
        ));
        tokio::spawn(write_loop(
            writer,
            self.config.frame.clone(),
            outbound_rx,
            events,
            Arc::clone(&closed),
            shutdown_rx,
        ));

        let previous = self.lock_link().replace(Link {
            peer,
            outbound,
            closed,
            shutdown_tx,
        });
        if let Some(previous) = previous {
            previous.close();
        }
        tracing::info!("Connected to {peer}");
    }
}

impl Transport for TcpTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        events: EventSink,
    ) -> Result<(), TransportError> {
        self.shutdown();

        // A zero timeout means "no deadline beyond the OS connect timeout".
        if timeout.is_zero() {
            return self.establish(host, port, events).await;
        }
        tokio::time::timeout(timeout, self.establish(host, port, events))
            .await
            .map_err(|_| TransportError::Timeout {
                host: host.to_string(),
                port,
                timeout,
            })?
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let max = self.config.frame.max_payload_size;
        if payload.len() > max as usize {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            }
            .into());
        }

        let link = self.lock_link();
        let link = link
            .as_ref()
            .filter(|l| l.is_open())
            .ok_or(TransportError::NotConnected)?;
        link.outbound
            .send(payload)
            .map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.lock_link().as_ref().is_some_and(Link::is_open)
    }

    fn shutdown(&self) {
        if let Some(link) = self.lock_link().take() {
            link.close();
            tracing::info!("Closed connection to {}", link.peer);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn report_drop(closed: &AtomicBool, events: &EventSink, cause: &FrameError) {
    if !closed.swap(true, Ordering::SeqCst) {
        if cause.is_disconnect() {
            tracing::info!("Connection closed by peer: {cause}");
        } else {
            tracing::warn!("Connection dropped: {cause}");
        }
        let _ = events.send(TransportEvent::Dropped);
    }
}

async fn read_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    frame: FrameConfig,
    events: EventSink,
    closed: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = read_frame(&mut reader, &frame) => match result {
                Ok(payload) => {
                    tracing::trace!("Received {} byte frame", payload.len());
                    if events.send(TransportEvent::Message(payload)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    report_drop(&closed, &events, &e);
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    frame: FrameConfig,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events: EventSink,
    closed: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(payload) => {
                    if let Err(e) = write_frame(&mut writer, &payload, &frame).await {
                        report_drop(&closed, &events, &e);
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
}
