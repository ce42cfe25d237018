//! Scripted in-memory transport for client tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tsp_net::{EventSink, FrameError, Transport, TransportError, TransportEvent};

/// Connect outcomes are taken from a script, then from a fallback. Replies
/// and drops are injected by the test.
pub(crate) struct StubTransport {
    outcomes: Mutex<VecDeque<bool>>,
    fallback: AtomicBool,
    connected: AtomicBool,
    reject_sends: AtomicBool,
    connect_calls: AtomicU32,
    sent: Mutex<Vec<Vec<u8>>>,
    sink: Mutex<Option<EventSink>>,
}

impl StubTransport {
    /// Every connect succeeds unless scripted otherwise.
    pub(crate) fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            reject_sends: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        }
    }

    /// Every connect fails unless scripted otherwise.
    pub(crate) fn failing() -> Self {
        let stub = Self::new();
        stub.set_fallback(false);
        stub
    }

    /// Queue outcomes for the next connects.
    pub(crate) fn script(self, outcomes: &[bool]) -> Self {
        self.outcomes.lock().unwrap().extend(outcomes.iter().copied());
        self
    }

    pub(crate) fn set_fallback(&self, ok: bool) {
        self.fallback.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn set_reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Deliver one inbound message.
    pub(crate) fn reply(&self, data: &[u8]) {
        self.emit(TransportEvent::Message(data.to_vec()));
    }

    /// Lose the link. Emits `Dropped` only if a link was up.
    pub(crate) fn drop_link(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(TransportEvent::Dropped);
        }
    }

    fn emit(&self, event: TransportEvent) {
        let sink = self.sink.lock().unwrap();
        let sink = sink.as_ref().expect("stub was never connected");
        // A superseded link's stream may already be gone.
        let _ = sink.send(event);
    }
}

impl Transport for StubTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        _timeout: Duration,
        events: EventSink,
    ) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(events);

        let outcome = self.outcomes.lock().unwrap().pop_front();
        if outcome.unwrap_or_else(|| self.fallback.load(Ordering::SeqCst)) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("stub refused {host}:{port}"),
            )))
        }
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: 0,
            }
            .into());
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
