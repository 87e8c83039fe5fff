//! Outward transport surface
//!
//! Buffers outbound messages, tracks their completion callbacks, and owns
//! the crash/rebuild policy: when the underlying connection dies, messages
//! that did not reach the service move back to the waiting queue, the
//! transport marks itself crashed, and the next send or receive attempt
//! builds a fresh connection rather than resuming a half-broken one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectError, Connection};
use crate::engine::EngineFactory;
use crate::message::{Message, MessageResult};

/// Lifecycle state of a [`Transport`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportState {
    /// Not connected; operations other than `open` fail
    Closed,
    /// Connected and usable
    Open,
    /// The connection died; the next send or receive attempt rebuilds it
    Crashed,
}

/// Terminal status reported to a message's completion callback
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompletionStatus {
    /// The service accepted the message
    Ok,
    /// The message expired before it could be sent
    Expired,
    /// The message failed and will not be retried further
    Error,
}

/// Completion callback attached to an outbound message
pub type SendCallback = Box<dyn FnOnce(CompletionStatus) + Send>;

/// Callback invoked for each received message; its return value is reported
/// back to the service
pub type MessageCallback = Box<dyn FnMut(Message) -> MessageResult + Send>;

/// Errors from [`Transport`] operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed
    #[error("transport is closed; call open() first")]
    Closed,
    /// The underlying connection was lost; affected messages were re-queued
    #[error("connection lost")]
    ConnectionLost,
    /// (Re)establishing the connection failed
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

struct WaitingMessage {
    message: Message,
    callback: SendCallback,
}

struct CallbackEntry {
    status: CompletionStatus,
    callback: SendCallback,
}

struct TransportInner {
    state: TransportState,
    waiting: VecDeque<WaitingMessage>,
    callbacks: VecDeque<CallbackEntry>,
    in_flight: usize,
    message_callback: Option<MessageCallback>,
    connection: Option<Connection>,
}

/// Message transport bound to one device
///
/// Buffers unsent messages until the service acknowledges them and invokes
/// each message's completion callback once its outcome is terminal. Received
/// messages are handed to the configured message callback, whose result is
/// reported back to the service. Cheaply cloneable.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Mutex<TransportInner>>,
    config: ClientConfig,
    factory: Arc<dyn EngineFactory>,
}

impl Transport {
    /// Create a closed transport for `config`
    pub fn new(config: ClientConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TransportInner {
                state: TransportState::Closed,
                waiting: VecDeque::new(),
                callbacks: VecDeque::new(),
                in_flight: 0,
                message_callback: None,
                connection: None,
            })),
            config,
            factory,
        }
    }

    /// Install the callback invoked for received messages
    ///
    /// Without one, received messages are discarded by
    /// [`handle_message`](Self::handle_message).
    pub fn set_message_callback(
        &self,
        callback: impl FnMut(Message) -> MessageResult + Send + 'static,
    ) {
        self.inner.lock().unwrap().message_callback = Some(Box::new(callback));
    }

    /// Establish the communication channel
    ///
    /// No-op when already open. A crashed transport is rebuilt from scratch.
    pub async fn open(&self) -> Result<(), TransportError> {
        if self.inner.lock().unwrap().state == TransportState::Open {
            return Ok(());
        }
        let connection = Connection::new(self.config.clone(), self.factory.clone());
        connection.open().await?;
        let mut inner = self.inner.lock().unwrap();
        inner.connection = Some(connection);
        inner.state = TransportState::Open;
        Ok(())
    }

    /// Close the transport
    ///
    /// Idempotent. Queued messages and pending callbacks are kept; a later
    /// [`open`](Self::open) may resume draining them.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == TransportState::Closed {
            return;
        }
        if let Some(connection) = inner.connection.take() {
            connection.close();
        }
        inner.state = TransportState::Closed;
    }

    /// Queue a message for sending
    ///
    /// `callback` fires from [`invoke_callbacks`](Self::invoke_callbacks)
    /// once the message's outcome is terminal.
    pub fn add_message(
        &self,
        message: Message,
        callback: impl FnOnce(CompletionStatus) + Send + 'static,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == TransportState::Closed {
            return Err(TransportError::Closed);
        }
        inner.waiting.push_back(WaitingMessage {
            message,
            callback: Box::new(callback),
        });
        Ok(())
    }

    /// Dispatch every waiting message, one at a time
    ///
    /// Rebuilds the connection first if the transport crashed. Messages with
    /// an empty body are skipped; expired messages complete immediately with
    /// [`CompletionStatus::Expired`]. Outcomes are collected asynchronously
    /// and surfaced through [`invoke_callbacks`](Self::invoke_callbacks).
    pub async fn send_messages(&self) -> Result<(), TransportError> {
        let connection = self.ensure_connection().await?;
        loop {
            let entry = match self.inner.lock().unwrap().waiting.pop_front() {
                Some(entry) => entry,
                None => return Ok(()),
            };
            if entry.message.body().is_empty() {
                debug!("skipping message with empty body");
                continue;
            }
            if entry.message.is_expired() {
                trace!("message expired before dispatch");
                self.inner.lock().unwrap().callbacks.push_back(CallbackEntry {
                    status: CompletionStatus::Expired,
                    callback: entry.callback,
                });
                continue;
            }
            let settlement = match connection.schedule_message(entry.message.clone()) {
                Ok(settlement) => settlement,
                Err(_) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.waiting.push_front(entry);
                    if inner.state == TransportState::Open {
                        inner.state = TransportState::Crashed;
                    }
                    return Err(TransportError::ConnectionLost);
                }
            };
            let shared = self.inner.clone();
            let WaitingMessage { message, callback } = entry;
            self.inner.lock().unwrap().in_flight += 1;
            tokio::spawn(async move {
                let result = settlement.await;
                let mut inner = shared.lock().unwrap();
                inner.in_flight -= 1;
                match result {
                    Ok(()) => inner.callbacks.push_back(CallbackEntry {
                        status: CompletionStatus::Ok,
                        callback,
                    }),
                    Err(e) if e.is_connection_fatal() => {
                        // Did not reach the service; buffer it for the next
                        // connection
                        warn!(error = %e, "message returned to the waiting queue");
                        inner.waiting.push_back(WaitingMessage { message, callback });
                        if inner.state == TransportState::Open {
                            inner.state = TransportState::Crashed;
                        }
                    }
                    Err(_) => inner.callbacks.push_back(CallbackEntry {
                        status: CompletionStatus::Error,
                        callback,
                    }),
                }
            });
        }
    }

    /// Invoke the callbacks for all completed messages, in completion order
    pub fn invoke_callbacks(&self) -> Result<(), TransportError> {
        let drained: Vec<CallbackEntry> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == TransportState::Closed {
                return Err(TransportError::Closed);
            }
            inner.callbacks.drain(..).collect()
        };
        for entry in drained {
            (entry.callback)(entry.status);
        }
        Ok(())
    }

    /// Process one received message through the message callback and report
    /// its result to the service
    ///
    /// Rebuilds the connection first if the transport crashed. Without a
    /// configured callback, pending received messages are discarded.
    pub async fn handle_message(&self) -> Result<(), TransportError> {
        let connection = self.ensure_connection().await?;
        let mut callback = match self.inner.lock().unwrap().message_callback.take() {
            Some(callback) => callback,
            None => {
                while let Ok(Some(_)) = connection.consume_message() {}
                return Ok(());
            }
        };
        let consumed = connection.consume_message();
        let result = match &consumed {
            Ok(Some(message)) => Some(callback(message.clone())),
            _ => None,
        };
        self.inner.lock().unwrap().message_callback = Some(callback);
        match consumed {
            Ok(_) => {}
            Err(_) => {
                self.mark_crashed();
                return Err(TransportError::ConnectionLost);
            }
        }
        if let Some(result) = result {
            if connection.send_message_result(result).is_err() {
                self.mark_crashed();
                return Err(TransportError::ConnectionLost);
            }
        }
        Ok(())
    }

    /// Whether no messages are waiting, in flight, or awaiting callbacks
    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.waiting.is_empty() && inner.in_flight == 0 && inner.callbacks.is_empty()
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransportState {
        self.inner.lock().unwrap().state
    }

    /// Get the live connection, rebuilding a fresh one after a crash
    async fn ensure_connection(&self) -> Result<Connection, TransportError> {
        {
            let inner = self.inner.lock().unwrap();
            match inner.state {
                TransportState::Closed => return Err(TransportError::Closed),
                TransportState::Open => {
                    return Ok(inner
                        .connection
                        .clone()
                        .expect("open transport has a connection"));
                }
                TransportState::Crashed => {}
            }
        }
        debug!("rebuilding connection after crash");
        let connection = Connection::new(self.config.clone(), self.factory.clone());
        connection.open().await?;
        let mut inner = self.inner.lock().unwrap();
        inner.connection = Some(connection.clone());
        inner.state = TransportState::Open;
        Ok(connection)
    }

    fn mark_crashed(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == TransportState::Open {
            inner.state = TransportState::Crashed;
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Transport")
            .field("device", &self.config.device_id())
            .field("state", &inner.state)
            .field("waiting", &inner.waiting.len())
            .field("in_flight", &inner.in_flight)
            .field("callbacks", &inner.callbacks.len())
            .finish_non_exhaustive()
    }
}
