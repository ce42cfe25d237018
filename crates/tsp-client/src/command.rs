//! Outstanding requests and the FIFO queue that matches them to replies.

use std::collections::VecDeque;
use std::fmt;

use crate::error::CommandError;

/// What a reply handler receives: the reply payload or the reason none came.
pub type Reply = Result<Vec<u8>, CommandError>;

/// Owned callback invoked exactly once per command.
pub type ReplyHandler = Box<dyn FnOnce(Reply) + Send + 'static>;

/// A queued request and its optional reply handler.
pub struct Command {
    /// Opaque request bytes.
    pub payload: Vec<u8>,
    /// Invoked with the matching reply; `None` discards it.
    pub handler: Option<ReplyHandler>,
}

impl Command {
    /// Create a command.
    pub fn new(payload: Vec<u8>, handler: Option<ReplyHandler>) -> Self {
        Self { payload, handler }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("payload_len", &self.payload.len())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Unanswered commands in send order.
///
/// There is no correlation id: the oldest command owns the next reply.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: VecDeque<Command>,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    pub fn push(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    /// Remove the oldest command, the one the next reply belongs to.
    pub fn pop_oldest(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Remove the most recently pushed command.
    pub fn pop_newest(&mut self) -> Option<Command> {
        self.commands.pop_back()
    }

    /// Move every command out, leaving the queue empty.
    pub fn take_all(&mut self) -> VecDeque<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Number of unanswered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether no command is outstanding.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
