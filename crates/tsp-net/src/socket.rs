//! TCP socket options shared by the client transport and the acceptor.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpListener, TcpStream};

/// Keepalive probing, so a half-open link eventually surfaces as a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Time between probes.
    pub interval: Duration,
    /// Unanswered probes before the kernel resets the link. Ignored on macOS.
    pub retries: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            retries: 3,
        }
    }
}

/// Options applied to client streams, accepted streams and listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm; requests are small and latency bound.
    pub nodelay: bool,
    /// `None` leaves keepalive off.
    pub keepalive: Option<Keepalive>,
    /// Set `SO_REUSEADDR` on listeners. Off on Windows, where it allows port theft.
    pub reuse_addr: bool,
    /// Pending-connection queue length for listeners.
    pub backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: Some(Keepalive::default()),
            reuse_addr: !cfg!(windows),
            backlog: 128,
        }
    }
}

/// Apply `config` to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)?;

    if let Some(ka) = &config.keepalive {
        let params = TcpKeepalive::new().with_time(ka.idle).with_interval(ka.interval);
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let params = params.with_retries(ka.retries);
        SockRef::from(stream).set_tcp_keepalive(&params)?;
    }

    Ok(())
}

/// Bind a non-blocking listener; IPv6 addresses also accept IPv4 peers.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(config.reuse_addr)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog)?;

    TcpListener::from_std(socket.into())
}
