//! Stream transport for the `tsp` client: framing, TCP/TLS connections, and a
//! matching server-side acceptor.

pub mod framing;
pub mod socket;
pub mod tcp_server;
pub mod tcp_transport;
pub mod tls;
pub mod transport;

pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use socket::{Keepalive, SocketConfig};
pub use tcp_server::{
    ConnectionId, ConnectionLimitReached, ConnectionMap, RequestHandler, Server, ServerConfig,
};
pub use tcp_transport::{TcpTransport, TcpTransportConfig};
pub use tls::{TlsError, TlsServerSettings, TlsSettings};
pub use transport::{
    EventSink, EventStream, Transport, TransportError, TransportEvent, event_channel,
};
