//! Resilient request/reply client.
//!
//! Requests are queued in send order and matched to replies first-in,
//! first-out. When the link drops the client reconnects per its
//! [`ReconnectPolicy`] and retransmits unanswered requests; every reply
//! handler runs exactly once.

pub mod client;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod reconnection;
pub mod state;

#[cfg(test)]
mod stub;

pub use client::{Client, ConnectOptions};
pub use command::{Command, CommandQueue, Reply, ReplyHandler};
pub use dispatcher::{Dispatcher, InFlightCounter};
pub use error::{ClientError, CommandError};
pub use reconnection::{ReconnectPolicy, ReconnectState};
pub use state::{ConnectionState, ConnectionStateWatch, Phase, PhaseObserver};
