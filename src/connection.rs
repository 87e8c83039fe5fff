//! Connection/session orchestration state machine

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use pin_project_lite::pin_project;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::engine::{DeliveryId, EngineFactory, EngineWaker, ErrorCondition, Outcome};
use crate::handler::EventHandler;
use crate::message::{Message, MessageResult};
use crate::reactor;

/// Errors produced while establishing a connection
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConnectError {
    /// The connection did not become ready within the configured bound
    #[error("connection was not opened in time")]
    TimedOut,
    /// The token source produced an empty credential
    #[error("credential source produced an empty token")]
    InvalidCredential,
    /// The connection was closed before it became ready
    #[error("connection closed before it became ready")]
    Aborted,
    /// The engine's transport failed during establishment
    #[error("transport failed: {0}")]
    Transport(ErrorCondition),
}

/// Errors resolving a scheduled send
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SendError {
    /// The connection was closed before the delivery settled
    #[error("connection closed")]
    ConnectionClosed,
    /// The link closed before the message was sent
    #[error("link closed before the message was sent")]
    LinkClosed,
    /// The remote peer did not accept the message
    #[error("message was not accepted by the remote peer")]
    Rejected,
    /// No delivery could be produced within the dispatch bound
    #[error("timed out waiting for the message to be sent")]
    DispatchTimedOut,
    /// The engine's transport failed
    #[error("transport failed: {0}")]
    Transport(ErrorCondition),
}

impl SendError {
    /// Whether the failure took the whole connection down, as opposed to
    /// being specific to this message
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::ConnectionClosed | Self::LinkClosed | Self::Transport(_) => true,
            Self::Rejected | Self::DispatchTimedOut => false,
        }
    }
}

/// Operation attempted in a state that does not permit it
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StateError {
    /// The connection is closed
    #[error("connection is closed; call open() first")]
    Closed,
    /// A message result was sent with no unacknowledged received message
    #[error("no message received since the last acknowledgement")]
    NoMessageReceived,
}

pin_project! {
    /// Resolves to the terminal outcome of a scheduled send
    ///
    /// Completion means the remote peer accepted the delivery, or the message
    /// exhausted its retry budget, or the connection went away. Dropping the
    /// future does not cancel the send.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct Settlement {
        #[pin]
        rx: oneshot::Receiver<Result<(), SendError>>,
    }
}

impl Future for Settlement {
    type Output = Result<(), SendError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().rx.poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(SendError::ConnectionClosed),
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Stage {
    Closed,
    Opening,
    Open,
}

pub(crate) struct OutboundPacket {
    pub(crate) body: Bytes,
    pub(crate) message_id: Option<String>,
    pub(crate) application_properties: Vec<(String, String)>,
    notify: Option<oneshot::Sender<Result<(), SendError>>>,
    attempts: u32,
}

impl OutboundPacket {
    fn resolve(&mut self, result: Result<(), SendError>) {
        if let Some(tx) = self.notify.take() {
            // The caller may have dropped its Settlement future
            let _ = tx.send(result);
        }
    }
}

/// A packet popped off the queue and handed to the event handler, parked
/// until link credit lets it go on the wire
pub(crate) struct PendingTransmit {
    pub(crate) packet: OutboundPacket,
    epoch: u64,
    pub(crate) transmitted: Option<oneshot::Sender<()>>,
}

struct ReceivedMessage {
    message: Message,
    delivery: DeliveryId,
}

pub(crate) struct ConnectionInner {
    stage: Stage,
    outbound: VecDeque<OutboundPacket>,
    /// Dispatch gate: set by a sender link-flow event and by a settled
    /// delivery, cleared while a packet is being put on the wire
    ready_to_send: bool,
    pub(crate) pending_transmit: Option<PendingTransmit>,
    transmit_epoch: u64,
    pub(crate) in_flight: FxHashMap<DeliveryId, OutboundPacket>,
    inbound: VecDeque<ReceivedMessage>,
    last_received: Option<DeliveryId>,
    pub(crate) pending_settlements: Vec<(DeliveryId, Outcome)>,
    pub(crate) close_requested: bool,
    on_ready: Option<oneshot::Sender<Result<(), ConnectError>>>,
    waker: Option<Box<dyn EngineWaker>>,
}

impl ConnectionInner {
    fn new() -> Self {
        Self {
            stage: Stage::Closed,
            outbound: VecDeque::new(),
            ready_to_send: false,
            pending_transmit: None,
            transmit_epoch: 0,
            in_flight: FxHashMap::default(),
            inbound: VecDeque::new(),
            last_received: None,
            pending_settlements: Vec::new(),
            close_requested: false,
            on_ready: None,
            waker: None,
        }
    }

    fn wake_engine(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }
}

pub(crate) struct ConnectionShared {
    pub(crate) config: ClientConfig,
    factory: Arc<dyn EngineFactory>,
    runtime: Handle,
    /// One reactor per connection instance at a time; held from before the
    /// reactor thread spawns until its run returns
    pub(crate) gate: Semaphore,
    pub(crate) state: Mutex<ConnectionInner>,
    completion: watch::Sender<Option<Result<(), SendError>>>,
}

impl ConnectionShared {
    pub(crate) fn on_reactor_exit(self: &Arc<Self>) {
        // Tolerate a poisoned lock: this path must run even when the engine
        // panicked mid-dispatch, or the gate and any outstanding futures
        // would leak
        let mut inner = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        teardown(&mut inner, SendError::ConnectionClosed, ConnectError::Aborted);
        inner.waker = None;
        debug!("reactor terminated");
    }
}

/// A logical connection between one device and the hub's messaging endpoint
///
/// Cheaply cloneable; all clones share the same underlying state. The
/// connection is created closed: call [`open`](Self::open) before scheduling
/// work. After any failure the connection ends up closed again, and the next
/// `open` rebuilds everything from scratch: engine, session, and links are
/// never reused across failures.
#[derive(Clone)]
pub struct Connection(Arc<ConnectionShared>);

impl Connection {
    /// Create a connection for `config`, building engines with `factory`
    ///
    /// Must be called from within a Tokio runtime; the watchdog timers are
    /// spawned onto the ambient runtime.
    pub fn new(config: ClientConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self(Arc::new(ConnectionShared {
            config,
            factory,
            runtime: Handle::current(),
            gate: Semaphore::new(1),
            state: Mutex::new(ConnectionInner::new()),
            completion: watch::channel(None).0,
        }))
    }

    /// Open the connection, waiting until it is ready to send
    ///
    /// No-op if already open. Otherwise this fetches a fresh credential,
    /// starts a reactor over a new engine instance, and waits for the sender
    /// link to be confirmed by the remote peer, bounded by the configured
    /// open timeout. If a previous reactor on this instance is still winding
    /// down, the call stalls until it has fully terminated.
    pub async fn open(&self) -> Result<(), ConnectError> {
        if self.0.state.lock().unwrap().stage == Stage::Open {
            return Ok(());
        }
        let token = self.0.config.token_source.token();
        if token.is_empty() {
            return Err(ConnectError::InvalidCredential);
        }

        let permit = self.0.gate.acquire().await.expect("reactor gate closed");
        permit.forget();

        let engine = self.0.factory.create(&self.0.config.address());
        let waker = engine.waker();
        let ready = {
            let mut inner = self.0.state.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            inner.stage = Stage::Opening;
            inner.close_requested = false;
            inner.ready_to_send = false;
            inner.on_ready = Some(tx);
            inner.waker = Some(waker);
            rx
        };
        self.0.completion.send_replace(None);

        let handler = EventHandler::new(self.0.clone(), token);
        reactor::spawn(self.0.clone(), engine, handler);

        let result = match time::timeout(self.0.config.open_timeout, ready).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectError::Aborted),
            Err(_) => Err(ConnectError::TimedOut),
        };

        let mut inner = self.0.state.lock().unwrap();
        match result {
            Ok(()) if inner.stage == Stage::Opening && !inner.close_requested => {
                inner.stage = Stage::Open;
                self.0.completion.send_replace(Some(Ok(())));
                info!(device = %self.0.config.device_id, "connection open");
                Ok(())
            }
            // Closed out from under us while the handshake completed
            Ok(()) => Err(ConnectError::Aborted),
            Err(e) => {
                warn!(error = %e, "open failed");
                inner.close_requested = true;
                inner.wake_engine();
                self.0
                    .completion
                    .send_replace(Some(Err(SendError::ConnectionClosed)));
                teardown(&mut inner, SendError::ConnectionClosed, ConnectError::Aborted);
                Err(e)
            }
        }
    }

    /// Close the connection
    ///
    /// Idempotent. In-flight and queued sends fail with
    /// [`SendError::ConnectionClosed`]; the reactor tears the engine down and
    /// terminates shortly after. A subsequent [`open`](Self::open)
    /// re-establishes connectivity with a fresh engine.
    pub fn close(&self) {
        let mut inner = self.0.state.lock().unwrap();
        if inner.stage == Stage::Closed && !inner.close_requested {
            return;
        }
        debug!(device = %self.0.config.device_id, "closing connection");
        inner.close_requested = true;
        inner.wake_engine();
        self.0
            .completion
            .send_replace(Some(Err(SendError::ConnectionClosed)));
        teardown(&mut inner, SendError::ConnectionClosed, ConnectError::Aborted);
    }

    /// Queue `body` for sending and return its settlement future
    ///
    /// Fails immediately if the connection is not open. The returned
    /// [`Settlement`] resolves once the remote peer accepts the delivery, or
    /// with the terminal failure once the retry budget is spent.
    pub fn schedule_send(
        &self,
        body: impl Into<Bytes>,
        message_id: Option<String>,
    ) -> Result<Settlement, StateError> {
        self.enqueue(body.into(), message_id, Vec::new())
    }

    /// Queue an application [`Message`] for sending
    ///
    /// Like [`schedule_send`](Self::schedule_send), but carries the message's
    /// application properties onto the wire.
    pub fn schedule_message(&self, message: Message) -> Result<Settlement, StateError> {
        let (body, message_id, properties) = message.take_parts();
        self.enqueue(body, message_id, properties)
    }

    fn enqueue(
        &self,
        body: Bytes,
        message_id: Option<String>,
        application_properties: Vec<(String, String)>,
    ) -> Result<Settlement, StateError> {
        let mut inner = self.0.state.lock().unwrap();
        if inner.stage != Stage::Open {
            return Err(StateError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        inner.outbound.push_back(OutboundPacket {
            body,
            message_id,
            application_properties,
            notify: Some(tx),
            attempts: 0,
        });
        self.0.completion.send_replace(None);
        dispatch_next(&self.0, &mut inner);
        Ok(Settlement { rx })
    }

    /// Pull the next received message, if any
    ///
    /// The returned message is retained internally as the last received one
    /// until [`send_message_result`](Self::send_message_result) reports a
    /// result for it.
    pub fn consume_message(&self) -> Result<Option<Message>, StateError> {
        let mut inner = self.0.state.lock().unwrap();
        if inner.stage != Stage::Open {
            return Err(StateError::Closed);
        }
        Ok(inner.inbound.pop_front().map(|received| {
            inner.last_received = Some(received.delivery);
            received.message
        }))
    }

    /// Report the result for the last received message and settle it
    ///
    /// `Complete`, `Abandon` and `Reject` map to accepted, released and
    /// rejected dispositions respectively. Fails with
    /// [`StateError::NoMessageReceived`] unless a message was consumed since
    /// the previous result.
    pub fn send_message_result(&self, result: MessageResult) -> Result<(), StateError> {
        let mut inner = self.0.state.lock().unwrap();
        if inner.stage != Stage::Open {
            return Err(StateError::Closed);
        }
        let delivery = inner
            .last_received
            .take()
            .ok_or(StateError::NoMessageReceived)?;
        let outcome = match result {
            MessageResult::Complete => Outcome::Accepted,
            MessageResult::Abandon => Outcome::Released,
            MessageResult::Reject => Outcome::Rejected,
        };
        inner.pending_settlements.push((delivery, outcome));
        // Settlement happens on the reactor thread
        inner.wake_engine();
        Ok(())
    }

    /// Wait for the aggregate completion signal
    ///
    /// Resolves with `Ok` once the outbound queue has drained after a
    /// successful delivery (or immediately after a clean open with nothing
    /// queued), and with the failure once the transport has failed.
    pub async fn completion(&self) -> Result<(), SendError> {
        let mut rx = self.0.completion.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.as_ref().expect("guarded by wait_for").clone(),
            Err(_) => Err(SendError::ConnectionClosed),
        };
        result
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.0.config.device_id)
            .finish_non_exhaustive()
    }
}

/// Record the remote disposition for an in-flight delivery
///
/// Success settles the packet and triggers the next dispatch; failure sends
/// the packet back through the retry path at the tail of the queue.
pub(crate) fn acknowledge(shared: &Arc<ConnectionShared>, delivery: DeliveryId, accepted: bool) {
    let mut inner = shared.state.lock().unwrap();
    let Some(mut packet) = inner.in_flight.remove(&delivery) else {
        return;
    };
    inner.ready_to_send = true;
    if accepted {
        trace!(?delivery, "delivery accepted");
        packet.resolve(Ok(()));
        if inner.outbound.is_empty() {
            shared.completion.send_replace(Some(Ok(())));
        } else {
            dispatch_next(shared, &mut inner);
        }
    } else {
        debug!(?delivery, "delivery not accepted");
        requeue_failed(shared, &mut inner, packet, SendError::Rejected);
    }
}

/// Signal that the sender link was confirmed by the remote peer
pub(crate) fn ready(shared: &Arc<ConnectionShared>) {
    let mut inner = shared.state.lock().unwrap();
    if let Some(tx) = inner.on_ready.take() {
        let _ = tx.send(Ok(()));
    }
}

/// Open the dispatch gate after a sender link-flow event
pub(crate) fn link_ready(shared: &Arc<ConnectionShared>) {
    let mut inner = shared.state.lock().unwrap();
    if inner.pending_transmit.is_none() && inner.in_flight.is_empty() {
        inner.ready_to_send = true;
    }
    dispatch_next(shared, &mut inner);
}

/// Fail the connection after a local or remote link close
pub(crate) fn link_closed(shared: &Arc<ConnectionShared>, error: Option<ErrorCondition>) {
    let mut inner = shared.state.lock().unwrap();
    let connect_err = match &error {
        Some(condition) => ConnectError::Transport(condition.clone()),
        None => ConnectError::Aborted,
    };
    shared
        .completion
        .send_replace(Some(Err(SendError::LinkClosed)));
    teardown(&mut inner, SendError::LinkClosed, connect_err);
}

/// Fail the connection after the remote peer closed it with an error
pub(crate) fn remote_closed(shared: &Arc<ConnectionShared>, error: Option<ErrorCondition>) {
    let mut inner = shared.state.lock().unwrap();
    let connect_err = match &error {
        Some(condition) => ConnectError::Transport(condition.clone()),
        None => ConnectError::Aborted,
    };
    shared
        .completion
        .send_replace(Some(Err(SendError::ConnectionClosed)));
    teardown(&mut inner, SendError::ConnectionClosed, connect_err);
}

/// Fail the aggregate status and close out after a transport error
pub(crate) fn transport_failed(shared: &Arc<ConnectionShared>, condition: ErrorCondition) {
    let mut inner = shared.state.lock().unwrap();
    shared
        .completion
        .send_replace(Some(Err(SendError::Transport(condition.clone()))));
    inner.close_requested = true;
    teardown(
        &mut inner,
        SendError::Transport(condition.clone()),
        ConnectError::Transport(condition),
    );
}

/// Hand an inbound message to the orchestrator's receive queue
pub(crate) fn enqueue_received(
    shared: &Arc<ConnectionShared>,
    message: Message,
    delivery: DeliveryId,
) {
    let mut inner = shared.state.lock().unwrap();
    inner.inbound.push_back(ReceivedMessage { message, delivery });
}

/// Attempt to start sending the head of the outbound queue
///
/// Only one delivery may be unacknowledged at a time, so this is a no-op
/// while anything is parked for transmit or awaiting its disposition. The
/// dispatch watchdog returns the packet to the retry path if the handler
/// cannot produce a delivery in time (e.g. because no credit arrives).
fn dispatch_next(shared: &Arc<ConnectionShared>, inner: &mut ConnectionInner) {
    if !inner.ready_to_send || inner.pending_transmit.is_some() || !inner.in_flight.is_empty() {
        return;
    }
    let Some(packet) = inner.outbound.pop_front() else {
        return;
    };
    inner.ready_to_send = false;
    inner.transmit_epoch += 1;
    let epoch = inner.transmit_epoch;
    let (tx, rx) = oneshot::channel();
    inner.pending_transmit = Some(PendingTransmit {
        packet,
        epoch,
        transmitted: Some(tx),
    });
    inner.wake_engine();

    let wait = shared.config.dispatch_timeout;
    let shared = shared.clone();
    shared.runtime.clone().spawn(async move {
        if time::timeout(wait, rx).await.is_ok() {
            // Transmitted (or reclaimed by teardown) in time
            return;
        }
        let mut inner = shared.state.lock().unwrap();
        if inner
            .pending_transmit
            .as_ref()
            .map_or(true, |pt| pt.epoch != epoch)
        {
            return;
        }
        let pt = inner.pending_transmit.take().expect("checked above");
        warn!("dispatch watchdog expired before the message was sent");
        inner.ready_to_send = true;
        requeue_failed(&shared, &mut inner, pt.packet, SendError::DispatchTimedOut);
    });
}

/// Send a failed packet back through the retry path
///
/// The packet moves to the tail of the queue with fresh delivery plumbing,
/// so ordering is not preserved across retries. Once the configured attempt
/// budget is spent, the caller's settlement future resolves with the failure
/// instead.
fn requeue_failed(
    shared: &Arc<ConnectionShared>,
    inner: &mut ConnectionInner,
    mut packet: OutboundPacket,
    error: SendError,
) {
    packet.attempts += 1;
    if shared
        .config
        .retry
        .max_attempts
        .is_some_and(|max| packet.attempts >= max.get())
    {
        debug!(attempts = packet.attempts, error = %error, "retry budget exhausted");
        shared.completion.send_replace(Some(Err(error.clone())));
        packet.resolve(Err(error));
        return;
    }
    let delay = shared.config.retry.delay;
    if delay.is_zero() {
        inner.outbound.push_back(packet);
        dispatch_next(shared, inner);
    } else {
        // The packet stays out of every shared structure during the wait, so
        // a close in the meantime must be resolved here
        let shared = shared.clone();
        shared.runtime.clone().spawn(async move {
            time::sleep(delay).await;
            let mut inner = shared.state.lock().unwrap();
            if inner.stage == Stage::Open {
                inner.outbound.push_back(packet);
                dispatch_next(&shared, &mut inner);
            } else {
                packet.resolve(Err(SendError::ConnectionClosed));
            }
        });
    }
}

/// Close out the connection state, failing everything still outstanding
///
/// Idempotent; used by `close`, by failure cascades, and when the reactor
/// thread exits.
fn teardown(inner: &mut ConnectionInner, reason: SendError, connect_err: ConnectError) {
    inner.stage = Stage::Closed;
    if let Some(tx) = inner.on_ready.take() {
        let _ = tx.send(Err(connect_err));
    }
    if let Some(mut pt) = inner.pending_transmit.take() {
        pt.packet.resolve(Err(reason.clone()));
    }
    for (_, mut packet) in inner.in_flight.drain() {
        packet.resolve(Err(reason.clone()));
    }
    for mut packet in inner.outbound.drain(..) {
        packet.resolve(Err(reason.clone()));
    }
    inner.inbound.clear();
    inner.last_received = None;
    inner.pending_settlements.clear();
    inner.ready_to_send = false;
}
