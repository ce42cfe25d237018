//! The client facade: connection lifecycle, request submission and the event
//! pump that feeds replies and drops into the dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tsp_net::{EventSink, EventStream, Transport, TransportError, TransportEvent, event_channel};

use crate::command::{Command, CommandQueue, Reply, ReplyHandler};
use crate::dispatcher::Dispatcher;
use crate::error::{ClientError, CommandError};
use crate::reconnection::ReconnectPolicy;
use crate::state::{ConnectionState, ConnectionStateWatch, Phase, PhaseObserver};

/// Where to connect and how to recover from drops.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Deadline for each connect attempt. Zero means none.
    pub timeout: Duration,
    /// Automatic reconnection behavior.
    pub reconnect: ReconnectPolicy,
}

impl ConnectOptions {
    /// Options with a one second timeout and the default reconnect policy.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl From<&tsp_config::Config> for ConnectOptions {
    fn from(config: &tsp_config::Config) -> Self {
        Self {
            host: config.connection.host.clone(),
            port: config.connection.port,
            timeout: Duration::from_millis(config.connection.timeout_ms),
            reconnect: ReconnectPolicy::from(&config.reconnect),
        }
    }
}

struct Session {
    target: ConnectOptions,
    observer: Option<PhaseObserver>,
}

/// A handler whose command was refused before reaching the queue.
type Rejected = (Option<ReplyHandler>, CommandError);

/// Event stream of one link, tagged with its generation.
type Link = (u64, EventStream);

/// State shared by the facade, the event pump and failure batches.
pub(crate) struct Inner<T> {
    pub(crate) transport: T,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) state: ConnectionStateWatch,
    pub(crate) cancelled: AtomicBool,
    pub(crate) attempts: AtomicU32,
    link: AtomicU64,
    links: mpsc::UnboundedSender<Link>,
    session: Mutex<Option<Session>>,
    handshake: Mutex<Option<Vec<u8>>>,
}

impl<T: Transport> Inner<T> {
    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handshake(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.handshake.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Parameters of the last `connect`.
    pub(crate) fn target(&self) -> Option<ConnectOptions> {
        self.lock_session().as_ref().map(|s| s.target.clone())
    }

    /// Start a new link generation and hand its event stream to the pump.
    /// From here on, events of earlier links are discarded.
    pub(crate) fn open_link(&self) -> EventSink {
        let (sink, stream) = event_channel();
        let generation = self.link.fetch_add(1, Ordering::SeqCst) + 1;
        if self.links.send((generation, stream)).is_err() {
            tracing::debug!(generation, "Event pump stopped, link events will be ignored");
        }
        sink
    }

    /// Generation of the most recently opened link.
    pub(crate) fn current_link(&self) -> u64 {
        self.link.load(Ordering::SeqCst)
    }

    /// Report `phase` for the current target. No lock is held during the call.
    pub(crate) fn notify(&self, phase: Phase) {
        let (host, port, observer) = {
            let session = self.lock_session();
            let Some(session) = session.as_ref() else {
                return;
            };
            (
                session.target.host.clone(),
                session.target.port,
                session.observer.clone(),
            )
        };
        tracing::debug!(%host, port, %phase, "Connection phase");
        if let Some(observer) = observer {
            observer(&host, port, phase);
        }
    }

    fn submit(&self, payload: Vec<u8>, handler: Option<ReplyHandler>) {
        let rejected = {
            let mut queue = self.dispatcher.lock();
            self.enqueue(&mut queue, Command::new(payload, handler))
        };
        if let Some((handler, error)) = rejected {
            self.dispatcher.fail_now(handler, error);
        }
    }

    /// Queue `command` according to the current state. Caller holds the lock.
    ///
    /// While connected the payload is transmitted right after it is queued, so
    /// queue order is wire order.
    fn enqueue(&self, queue: &mut CommandQueue, command: Command) -> Option<Rejected> {
        match self.state.current() {
            ConnectionState::Connected => {
                let payload = command.payload.clone();
                let len = payload.len();
                queue.push(command);
                match self.transport.send(payload) {
                    Ok(()) => {
                        tracing::trace!(len, outstanding = queue.len(), "Request sent");
                        None
                    }
                    Err(TransportError::NotConnected | TransportError::Closed) => {
                        // The link is gone but its drop has not reached the pump yet;
                        // on_drop resubmits or fails everything still queued.
                        tracing::debug!(len, "Link down, request held for resubmission");
                        None
                    }
                    Err(e) => {
                        tracing::warn!("Transport rejected request ({len} bytes): {e}");
                        let handler = queue.pop_newest().and_then(|c| c.handler);
                        Some((handler, CommandError::SendFailed(e.to_string())))
                    }
                }
            }
            state if state.defers_sends() => {
                tracing::trace!(len = command.payload.len(), ?state, "Request deferred");
                queue.push(command);
                None
            }
            state => {
                tracing::debug!(?state, "Request refused, not connected");
                Some((command.handler, CommandError::NotConnected))
            }
        }
    }

    /// Move from `from` to `Connected` and transmit everything queued while
    /// the link was down, handshake first.
    ///
    /// Returns `false` without changing anything if the state is no longer
    /// `from`, meaning a disconnect won the race.
    pub(crate) fn mark_connected(&self, from: ConnectionState) -> bool {
        let rejected = {
            let mut queue = self.dispatcher.lock();
            if self.state.current() != from {
                return false;
            }
            self.state.set(ConnectionState::Connected);

            let pending = queue.take_all();
            let mut rejected = Vec::new();
            let handshake = self.lock_handshake().clone();
            if let Some(payload) = handshake {
                rejected.extend(self.enqueue(&mut queue, Command::new(payload, Some(handshake_handler()))));
            }
            if !pending.is_empty() {
                tracing::info!("Resubmitting {} pending request(s)", pending.len());
            }
            for command in pending {
                rejected.extend(self.enqueue(&mut queue, command));
            }
            rejected
        };

        for (handler, error) in rejected {
            self.dispatcher.fail_now(handler, error);
        }
        true
    }

    /// Close the link and fail everything outstanding with `ConnectionLost`.
    /// Returns the number of requests failed.
    fn close(&self) -> usize {
        self.transport.shutdown();
        let mut queue = self.dispatcher.lock();
        self.state.set(ConnectionState::Disconnected);
        self.dispatcher
            .drain_with_failure(&mut queue, CommandError::ConnectionLost)
    }
}

fn handshake_handler() -> ReplyHandler {
    Box::new(|reply: Reply| match reply {
        Ok(data) => tracing::info!(len = data.len(), "Handshake acknowledged"),
        Err(e) => tracing::warn!("Handshake failed: {e}"),
    })
}

enum PumpSlot {
    Idle(mpsc::UnboundedReceiver<Link>),
    Running(JoinHandle<()>),
    Stopped,
}

/// Asynchronous request/reply client over a [`Transport`].
///
/// Requests are matched to replies in FIFO order. After a drop the client
/// reconnects per [`ReconnectPolicy`] and retransmits every unanswered request
/// in its original order. Every reply handler runs exactly once, with either
/// the reply or a [`CommandError`].
///
/// Dropping the client closes the connection and fails outstanding requests
/// without waiting; use [`shutdown`](Self::shutdown) to wait for that to finish.
pub struct Client<T: Transport> {
    inner: Arc<Inner<T>>,
    pump: Mutex<PumpSlot>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: Transport> Client<T> {
    /// Create a disconnected client.
    pub fn new(transport: T) -> Self {
        let (links, link_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                dispatcher: Dispatcher::new(),
                state: ConnectionStateWatch::new(),
                cancelled: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                link: AtomicU64::new(0),
                links,
                session: Mutex::new(None),
                handshake: Mutex::new(None),
            }),
            pump: Mutex::new(PumpSlot::Idle(link_rx)),
            shutdown_tx,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Connect to `options.host:options.port`.
    ///
    /// Emits `start`, then `ok` or `failed` to `observer`, which is kept for
    /// later reconnect events. A failed initial connect is not retried and
    /// fails any request submitted meanwhile with `NotConnected`.
    pub async fn connect(
        &self,
        options: ConnectOptions,
        observer: Option<PhaseObserver>,
    ) -> Result<(), ClientError> {
        {
            let _queue = self.inner.dispatcher.lock();
            match self.inner.state.current() {
                ConnectionState::Disconnected | ConnectionState::Stopped => {}
                _ => return Err(ClientError::AlreadyConnected),
            }
            *self.inner.lock_session() = Some(Session {
                target: options.clone(),
                observer,
            });
            self.inner.attempts.store(0, Ordering::SeqCst);
            self.inner.state.set(ConnectionState::Connecting);
        }
        self.start_pump();

        tracing::info!("Connecting to {}:{}", options.host, options.port);
        self.inner.notify(Phase::Start);

        let events = self.inner.open_link();
        let result = self
            .inner
            .transport
            .connect(&options.host, options.port, options.timeout, events)
            .await;

        match result {
            Ok(()) => {
                if !self.inner.mark_connected(ConnectionState::Connecting) {
                    self.inner.transport.shutdown();
                    return Err(ClientError::Aborted);
                }
                tracing::info!("Connected to {}:{}", options.host, options.port);
                self.inner.notify(Phase::Ok);
                Ok(())
            }
            Err(source) => {
                tracing::warn!("Connect to {}:{} failed: {source}", options.host, options.port);
                {
                    let mut queue = self.inner.dispatcher.lock();
                    if self.inner.state.current() == ConnectionState::Connecting {
                        self.inner.state.set(ConnectionState::Disconnected);
                    }
                    self.inner
                        .dispatcher
                        .drain_with_failure(&mut queue, CommandError::NotConnected);
                }
                self.inner.notify(Phase::Failed);
                Err(ClientError::Connect {
                    host: options.host,
                    port: options.port,
                    source,
                })
            }
        }
    }

    /// Close the connection and fail every outstanding request with
    /// `ConnectionLost`.
    ///
    /// Returns once all of those handlers, and any handler already running,
    /// have finished. A running retry loop stops at its next check.
    pub async fn disconnect(&self) {
        let failed = self.inner.close();
        tracing::info!(failed, "Disconnected");
        self.inner.dispatcher.wait_idle().await;
    }

    /// Send a request; `handler` receives the reply or the reason it failed.
    ///
    /// Never blocks. Safe to call from inside a reply handler.
    pub fn send(
        &self,
        payload: impl Into<Vec<u8>>,
        handler: impl FnOnce(Reply) + Send + 'static,
    ) -> &Self {
        self.inner.submit(payload.into(), Some(Box::new(handler)));
        self
    }

    /// Send a request whose reply is consumed and discarded.
    pub fn send_detached(&self, payload: impl Into<Vec<u8>>) -> &Self {
        self.inner.submit(payload.into(), None);
        self
    }

    /// Permanently disable automatic reconnection for this client.
    pub fn cancel_reconnect(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            tracing::info!("Automatic reconnection cancelled");
        }
    }

    /// Payload sent as the first request after every successful connect.
    /// Its reply is logged and discarded.
    pub fn set_handshake(&self, payload: Option<Vec<u8>>) {
        *self.inner.lock_handshake() = payload;
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Whether the retry loop is running.
    pub fn is_reconnecting(&self) -> bool {
        self.state() == ConnectionState::Reconnecting
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Receiver observing every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.inner.dispatcher.pending()
    }

    /// Handler invocations claimed but not finished.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight()
    }

    /// Attempts made by the current or last retry loop.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Disconnect, stop the event pump and wait for both.
    pub async fn shutdown(self) {
        self.cancel_reconnect();
        self.disconnect().await;

        self.shutdown_tx.send_replace(true);
        let slot = std::mem::replace(&mut *self.lock_pump(), PumpSlot::Stopped);
        if let PumpSlot::Running(task) = slot
            && let Err(e) = task.await
        {
            tracing::error!("Event pump ended abnormally: {e}");
        }
        tracing::debug!("Client shut down");
    }

    fn lock_pump(&self) -> MutexGuard<'_, PumpSlot> {
        self.pump.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_pump(&self) {
        let mut slot = self.lock_pump();
        if !matches!(*slot, PumpSlot::Idle(_)) {
            return;
        }
        if let PumpSlot::Idle(links) = std::mem::replace(&mut *slot, PumpSlot::Stopped) {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.shutdown_tx.subscribe();
            *slot = PumpSlot::Running(tokio::spawn(run_pump(inner, links, shutdown_rx)));
        }
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let failed = self.inner.close();
        if failed > 0 {
            tracing::debug!(failed, "Client dropped with requests outstanding");
        }
        self.shutdown_tx.send_replace(true);
    }
}

enum PumpStep {
    Link(Option<Link>),
    Event(Option<TransportEvent>),
}

async fn next_event(stream: &mut Option<EventStream>) -> Option<TransportEvent> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

/// Serializes transport events: replies in arrival order, drops one at a time.
///
/// Only the newest link is read. A newer link replaces the current stream,
/// so anything still buffered for a superseded link is discarded.
async fn run_pump<T: Transport>(
    inner: Arc<Inner<T>>,
    mut links: mpsc::UnboundedReceiver<Link>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut generation = 0;
    let mut stream = None;
    loop {
        let step = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            link = links.recv() => PumpStep::Link(link),
            event = next_event(&mut stream) => PumpStep::Event(event),
        };

        match step {
            PumpStep::Link(Some((next, events))) => {
                if next > generation {
                    generation = next;
                    stream = Some(events);
                }
            }
            PumpStep::Link(None) => break,
            PumpStep::Event(Some(TransportEvent::Message(data))) => {
                if generation == inner.current_link() {
                    inner.dispatcher.on_reply(data);
                } else {
                    tracing::debug!(len = data.len(), "Discarding reply from a superseded link");
                }
            }
            PumpStep::Event(Some(TransportEvent::Dropped)) => inner.on_drop(generation).await,
            PumpStep::Event(None) => stream = None,
        }
    }
    tracing::debug!("Event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubTransport;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn options(max_attempts: Option<u32>, interval_ms: u64) -> ConnectOptions {
        ConnectOptions::new("127.0.0.1", 13400)
            .with_reconnect(ReconnectPolicy::fixed(max_attempts, Duration::from_millis(interval_ms)))
    }

    fn phase_channel() -> (PhaseObserver, mpsc::UnboundedReceiver<Phase>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer: PhaseObserver = Arc::new(move |host: &str, port: u16, phase: Phase| {
            assert_eq!((host, port), ("127.0.0.1", 13400));
            let _ = tx.send(phase);
        });
        (observer, rx)
    }

    async fn expect_phases(rx: &mut mpsc::UnboundedReceiver<Phase>, expected: &[Phase]) {
        for want in expected {
            let got = timeout(WAIT, rx.recv()).await.expect("phase timeout").unwrap();
            assert_eq!(got, *want);
        }
    }

    fn reply_channel() -> (
        mpsc::UnboundedSender<Reply>,
        mpsc::UnboundedReceiver<Reply>,
    ) {
        mpsc::unbounded_channel()
    }

    fn forward(tx: &mpsc::UnboundedSender<Reply>) -> impl FnOnce(Reply) + Send + 'static {
        let tx = tx.clone();
        move |reply| {
            let _ = tx.send(reply);
        }
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<Reply>) -> Reply {
        timeout(WAIT, rx.recv()).await.expect("reply timeout").unwrap()
    }

    fn payloads(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[tokio::test]
    async fn test_connect_reports_start_then_ok() {
        let client = Client::new(StubTransport::new());
        let (observer, mut phases) = phase_channel();

        client.connect(options(None, 10), Some(observer)).await.unwrap();

        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;
        assert!(client.is_connected());
        assert!(!client.is_reconnecting());
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_retried() {
        let client = Client::new(StubTransport::failing());
        let (observer, mut phases) = phase_channel();

        let err = client.connect(options(None, 10), Some(observer)).await.unwrap_err();

        assert!(matches!(err, ClientError::Connect { port: 13400, .. }));
        expect_phases(&mut phases, &[Phase::Start, Phase::Failed]).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.transport().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_immediately() {
        let client = Client::new(StubTransport::new());
        let (tx, mut rx) = reply_channel();

        client.send("hello", forward(&tx));

        assert_eq!(next_reply(&mut rx).await, Err(CommandError::NotConnected));
        assert_eq!(client.pending(), 0);
        assert!(client.transport().sent().is_empty());
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();

        let err = client.connect(options(None, 10), None).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyConnected));
        assert_eq!(client.transport().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_replies_match_sends_in_order() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();
        let (tx, mut rx) = reply_channel();

        for i in 0..5 {
            client.send(format!("req-{i}"), forward(&tx));
        }
        assert_eq!(client.pending(), 5);
        assert_eq!(
            client.transport().sent(),
            payloads(&["req-0", "req-1", "req-2", "req-3", "req-4"])
        );

        for i in 0..5 {
            client.transport().reply(format!("resp-{i}").as_bytes());
        }
        for i in 0..5 {
            assert_eq!(next_reply(&mut rx).await, Ok(format!("resp-{i}").into_bytes()));
        }
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_send_is_chainable_and_detached_consumes_reply() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();
        let (tx, mut rx) = reply_channel();

        client.send_detached("noise").send("query", forward(&tx));
        client.transport().reply(b"for-noise");
        client.transport().reply(b"for-query");

        assert_eq!(next_reply(&mut rx).await, Ok(b"for-query".to_vec()));
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_exactly_once() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();
        let failures = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let failures = Arc::clone(&failures);
            client.send("pending", move |reply| {
                assert_eq!(reply, Err(CommandError::ConnectionLost));
                failures.fetch_add(1, Ordering::SeqCst);
            });
        }

        client.disconnect().await;

        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.pending(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.transport().is_connected());
    }

    #[tokio::test]
    async fn test_transport_rejection_reaches_handler() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();
        client.transport().set_reject_sends(true);
        let (tx, mut rx) = reply_channel();

        client.send("doomed", forward(&tx));

        assert!(matches!(next_reply(&mut rx).await, Err(CommandError::SendFailed(_))));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_poison_client() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();
        let (tx, mut rx) = reply_channel();

        client.send("first", |_| panic!("handler bug"));
        client.send("second", forward(&tx));
        client.transport().reply(b"r1");
        client.transport().reply(b"r2");

        assert_eq!(next_reply(&mut rx).await, Ok(b"r2".to_vec()));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_handler_can_send_follow_up() {
        let client = Arc::new(Client::new(StubTransport::new()));
        client.connect(options(None, 10), None).await.unwrap();
        let (tx, mut rx) = reply_channel();

        let reentrant = Arc::clone(&client);
        let follow_up = forward(&tx);
        client.send("login", move |reply| {
            assert!(reply.is_ok());
            reentrant.send("after-login", follow_up);
        });
        client.transport().reply(b"welcome");
        client.transport().reply(b"done");

        assert_eq!(next_reply(&mut rx).await, Ok(b"done".to_vec()));
        assert_eq!(client.transport().sent(), payloads(&["login", "after-login"]));
    }

    #[tokio::test]
    async fn test_drop_reconnects_and_resubmits_in_order() {
        let client = Client::new(StubTransport::new().script(&[true, false, true]));
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 500), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        let (tx, mut rx) = reply_channel();
        for name in ["a", "b", "c"] {
            client.send(name, forward(&tx));
        }
        client.transport().clear_sent();
        client.transport().drop_link();

        expect_phases(
            &mut phases,
            &[Phase::Dropped, Phase::Sleeping, Phase::Sleeping, Phase::Ok],
        )
        .await;
        assert!(client.is_connected());
        assert_eq!(client.reconnect_attempts(), 2);
        assert_eq!(client.transport().sent(), payloads(&["a", "b", "c"]));

        for name in ["A", "B", "C"] {
            client.transport().reply(name.as_bytes());
        }
        for name in ["A", "B", "C"] {
            assert_eq!(next_reply(&mut rx).await, Ok(name.as_bytes().to_vec()));
        }
    }

    #[tokio::test]
    async fn test_zero_interval_skips_sleeping() {
        let client = Client::new(StubTransport::new().script(&[true, false, true]));
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 0), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        client.transport().drop_link();

        expect_phases(&mut phases, &[Phase::Dropped, Phase::Ok]).await;
        assert_eq!(client.transport().connect_calls(), 3);
    }

    #[tokio::test]
    async fn test_bounded_retries_then_stopped() {
        let client = Client::new(StubTransport::new().script(&[true]));
        client.transport().set_fallback(false);
        let (observer, mut phases) = phase_channel();
        client.connect(options(Some(3), 5), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        let (tx, mut rx) = reply_channel();
        client.send("lost", forward(&tx));
        client.transport().drop_link();

        expect_phases(
            &mut phases,
            &[
                Phase::Dropped,
                Phase::Sleeping,
                Phase::Sleeping,
                Phase::Sleeping,
                Phase::Stopped,
            ],
        )
        .await;
        assert_eq!(client.transport().connect_calls(), 1 + 3);
        assert_eq!(client.reconnect_attempts(), 3);
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(next_reply(&mut rx).await, Err(CommandError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_cancel_before_drop_makes_no_attempts() {
        let client = Client::new(StubTransport::new());
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 5), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        client.cancel_reconnect();
        client.transport().drop_link();

        expect_phases(&mut phases, &[Phase::Dropped, Phase::Stopped]).await;
        assert_eq!(client.transport().connect_calls(), 1);
        assert_eq!(client.reconnect_attempts(), 0);
        assert_eq!(client.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_cancel_while_sleeping_stops_before_next_attempt() {
        let client = Client::new(StubTransport::new().script(&[true]));
        client.transport().set_fallback(false);
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 100), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        client.transport().drop_link();
        expect_phases(&mut phases, &[Phase::Dropped, Phase::Sleeping]).await;
        client.cancel_reconnect();

        expect_phases(&mut phases, &[Phase::Stopped]).await;
        assert_eq!(client.transport().connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_sends_during_reconnect_are_deferred() {
        let client = Client::new(StubTransport::new().script(&[true, false, true]));
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 50), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        client.send_detached("early");
        client.transport().clear_sent();
        client.transport().drop_link();
        expect_phases(&mut phases, &[Phase::Dropped]).await;

        let (tx, mut rx) = reply_channel();
        client.send("late", forward(&tx));
        assert!(client.is_reconnecting());
        assert!(client.transport().sent().is_empty());
        assert_eq!(client.pending(), 2);

        expect_phases(&mut phases, &[Phase::Sleeping, Phase::Sleeping, Phase::Ok]).await;
        assert_eq!(client.transport().sent(), payloads(&["early", "late"]));

        client.transport().reply(b"one");
        client.transport().reply(b"two");
        assert_eq!(next_reply(&mut rx).await, Ok(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_disconnect_during_reconnect_ends_loop() {
        let client = Client::new(StubTransport::new().script(&[true]));
        client.transport().set_fallback(false);
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 50), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        client.transport().drop_link();
        expect_phases(&mut phases, &[Phase::Dropped, Phase::Sleeping]).await;
        client.disconnect().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.transport().connect_calls(), 1);
        assert!(phases.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_of_previous_link_does_not_retransmit() {
        let client = Client::new(StubTransport::new());
        let (observer, mut phases) = phase_channel();
        client
            .connect(options(None, 10), Some(Arc::clone(&observer)))
            .await
            .unwrap();
        client.transport().drop_link();
        client.disconnect().await;
        client.connect(options(None, 10), Some(observer)).await.unwrap();

        client.send_detached("x");
        client.transport().clear_sent();
        client.send_detached("y");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(client.transport().sent(), payloads(&["y"]));
        assert!(client.is_connected());
        assert_eq!(client.pending(), 2);
        assert_eq!(client.transport().connect_calls(), 2);
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok, Phase::Start, Phase::Ok]).await;
        assert!(phases.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_before_drop_is_handled_is_resubmitted() {
        let client = Client::new(StubTransport::new());
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 10), Some(observer)).await.unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        client.transport().drop_link();
        let (tx, mut rx) = reply_channel();
        client.send("req", forward(&tx));
        assert!(client.is_connected());
        assert_eq!(client.pending(), 1);
        assert!(client.transport().sent().is_empty());

        expect_phases(&mut phases, &[Phase::Dropped, Phase::Sleeping, Phase::Ok]).await;
        assert_eq!(client.transport().sent(), payloads(&["req"]));
        client.transport().reply(b"done");
        assert_eq!(next_reply(&mut rx).await, Ok(b"done".to_vec()));
    }

    #[tokio::test]
    async fn test_extreme_backoff_from_config_still_reconnects() {
        let mut config = tsp_config::Config::default();
        config.connection.host = "127.0.0.1".into();
        config.connection.port = 13400;
        config.reconnect.interval_ms = 5;
        config.reconnect.max_interval_ms = 20;
        config.reconnect.backoff_multiplier = 1e20;

        let client = Client::new(StubTransport::new().script(&[true, false, true]));
        let (observer, mut phases) = phase_channel();
        client
            .connect(ConnectOptions::from(&config), Some(observer))
            .await
            .unwrap();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok]).await;

        let (tx, mut rx) = reply_channel();
        client.send("survivor", forward(&tx));
        client.transport().drop_link();

        expect_phases(
            &mut phases,
            &[Phase::Dropped, Phase::Sleeping, Phase::Sleeping, Phase::Ok],
        )
        .await;
        client.transport().reply(b"ok");
        assert_eq!(next_reply(&mut rx).await, Ok(b"ok".to_vec()));
    }

    #[tokio::test]
    async fn test_drop_while_reconnecting_is_ignored() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();
        client.inner.state.set(ConnectionState::Reconnecting);

        client.inner.on_drop(client.inner.current_link()).await;

        assert_eq!(client.transport().connect_calls(), 1);
        assert_eq!(client.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_reconnect_after_stopped_is_allowed() {
        let client = Client::new(StubTransport::new());
        client.connect(options(Some(0), 0), None).await.unwrap();
        client.transport().drop_link();

        let mut state = client.subscribe_state();
        timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Stopped))
            .await
            .unwrap()
            .unwrap();

        client.connect(options(Some(0), 0), None).await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_is_sent_first_on_every_connect() {
        let client = Client::new(StubTransport::new());
        client.set_handshake(Some(b"AUTH".to_vec()));
        let (observer, mut phases) = phase_channel();
        client.connect(options(None, 0), Some(observer)).await.unwrap();
        assert_eq!(client.transport().sent(), payloads(&["AUTH"]));
        client.transport().reply(b"auth-ok");

        let (tx, mut rx) = reply_channel();
        client.send("work", forward(&tx));
        client.transport().clear_sent();
        client.transport().drop_link();
        expect_phases(&mut phases, &[Phase::Start, Phase::Ok, Phase::Dropped, Phase::Ok]).await;

        assert_eq!(client.transport().sent(), payloads(&["AUTH", "work"]));
        client.transport().reply(b"auth-ok");
        client.transport().reply(b"result");
        assert_eq!(next_reply(&mut rx).await, Ok(b"result".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_keep_queue_and_wire_order_equal() {
        let client = Arc::new(Client::new(StubTransport::new()));
        client.connect(options(None, 10), None).await.unwrap();
        let mismatches = Arc::new(AtomicUsize::new(0));
        let answered = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for t in 0..4 {
            let client = Arc::clone(&client);
            let mismatches = Arc::clone(&mismatches);
            let answered = Arc::clone(&answered);
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let expected = format!("t{t}-{i}").into_bytes();
                    let mismatches = Arc::clone(&mismatches);
                    let answered = Arc::clone(&answered);
                    client.send(expected.clone(), move |reply| {
                        if reply != Ok(expected) {
                            mismatches.fetch_add(1, Ordering::SeqCst);
                        }
                        answered.fetch_add(1, Ordering::SeqCst);
                    });
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let sent = client.transport().sent();
        assert_eq!(sent.len(), 200);
        for t in 0..4 {
            let prefix = format!("t{t}-");
            let own: Vec<_> = sent
                .iter()
                .filter(|p| p.starts_with(prefix.as_bytes()))
                .cloned()
                .collect();
            let expected: Vec<_> = (0..50).map(|i| format!("t{t}-{i}").into_bytes()).collect();
            assert_eq!(own, expected);
        }

        // Echo in wire order: each handler must get back its own payload.
        for payload in &sent {
            client.transport().reply(payload);
        }
        timeout(WAIT, async {
            while answered.load(Ordering::SeqCst) < 200 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(mismatches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_closes() {
        let client = Client::new(StubTransport::new());
        client.connect(options(None, 10), None).await.unwrap();
        let failures = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let failures = Arc::clone(&failures);
            client.send("never", move |reply| {
                if reply == Err(CommandError::ConnectionLost) {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        client.shutdown().await;
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropping_client_fails_pending() {
        let (tx, mut rx) = reply_channel();
        {
            let client = Client::new(StubTransport::new());
            client.connect(options(None, 10), None).await.unwrap();
            client.send("orphan", forward(&tx));
        }
        assert_eq!(next_reply(&mut rx).await, Err(CommandError::ConnectionLost));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = tsp_config::Config::default();
        config.connection.host = "example.net".into();
        config.connection.port = 9000;
        config.connection.timeout_ms = 250;
        config.reconnect.max_attempts = Some(4);

        let options = ConnectOptions::from(&config);
        assert_eq!(options.host, "example.net");
        assert_eq!(options.port, 9000);
        assert_eq!(options.timeout, Duration::from_millis(250));
        assert_eq!(options.reconnect.max_attempts, Some(4));
    }
}
