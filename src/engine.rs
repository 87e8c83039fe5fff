//! Boundary to the external AMQP protocol engine
//!
//! The engine owns the socket, TLS, SASL negotiation mechanics, and all wire
//! encode/decode state. This crate never touches AMQP framing directly; it
//! drives the engine through [`EngineOps`] and reacts to the lifecycle
//! [`Event`]s the engine raises. The split mirrors how the protocol layers
//! are stacked everywhere else in this crate: orchestration up here, protocol
//! mechanics behind an opaque interface.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Opaque identifier for a session created on the engine's connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SessionId(pub u64);

/// Opaque identifier for a link attached to a session
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LinkId(pub u64);

/// Engine-assigned identifier for a single delivery
///
/// Not known until the delivery is created at transmit time; used afterwards
/// to correlate the remote disposition with the message that was sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DeliveryId(pub u64);

/// Direction of a link
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkRole {
    /// Carries messages from this client to the remote peer
    Sender,
    /// Carries messages from the remote peer to this client
    Receiver,
}

/// Terminal settlement state for a delivery
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Outcome {
    /// The peer took responsibility for the message
    Accepted,
    /// The peer released the message back to the sender
    Released,
    /// The peer rejected the message as unprocessable
    Rejected,
}

/// Error condition reported by the engine's transport or by the remote peer
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorCondition {
    /// Symbolic condition name, e.g. `amqp:connection:forced`
    pub condition: String,
    /// Optional human-readable description
    pub description: Option<String>,
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{}: {}", self.condition, d),
            None => f.write_str(&self.condition),
        }
    }
}

/// A single inbound transfer read off a receiver link
#[derive(Debug)]
pub struct IncomingTransfer {
    /// Delivery handle, retained so the message can be settled later
    pub delivery: DeliveryId,
    /// Raw message payload
    pub payload: Bytes,
    /// Whether more frames for this delivery are still outstanding
    pub partial: bool,
}

/// Lifecycle events raised by the engine's reactor
///
/// Each event is dispatched on the reactor thread, in the order the engine
/// observed it. The variants cover exactly the protocol surface this crate
/// orchestrates; anything finer-grained stays inside the engine.
#[derive(Debug)]
pub enum Event {
    /// The connection object exists locally; host, session and links may be set up
    ConnectionInit,
    /// The connection is bound to a transport; SASL and TLS may be configured
    ConnectionBound,
    /// The local open frame was emitted
    ConnectionLocalOpen,
    /// The remote peer closed the connection
    ConnectionRemoteClose {
        /// Error condition carried on the remote close frame, if any
        error: Option<ErrorCondition>,
    },
    /// A link was initialized locally and may be addressed
    LinkInit {
        /// The link being initialized
        link: LinkId,
    },
    /// The remote peer confirmed the link attach
    LinkRemoteOpen {
        /// The link that is now open end to end
        link: LinkId,
    },
    /// The remote peer granted transfer credit on a sender link
    LinkFlow {
        /// The link whose credit changed
        link: LinkId,
    },
    /// A link was closed locally
    LinkLocalClose {
        /// The link that closed
        link: LinkId,
    },
    /// The remote peer closed a link
    LinkRemoteClose {
        /// The link that closed
        link: LinkId,
        /// Error condition carried on the detach, if any
        error: Option<ErrorCondition>,
    },
    /// A transfer is readable on a receiver link
    Transfer {
        /// The link with pending inbound data
        link: LinkId,
    },
    /// The remote peer reported a terminal state for an outbound delivery
    Disposition {
        /// The delivery being settled
        delivery: DeliveryId,
        /// The remote terminal state
        outcome: Outcome,
    },
    /// The transport failed
    TransportError {
        /// The reported condition
        condition: ErrorCondition,
    },
    /// [`EngineWaker::wake`] was called; no protocol state changed
    Woken,
}

/// Error returned by [`EngineOps::encode`] when the message does not fit the
/// provided buffer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("encoded message exceeds buffer capacity")]
pub struct Overflow;

/// Error returned by [`EngineOps::decode`] for an unparseable payload
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("malformed message payload: {reason}")]
pub struct DecodeError {
    /// What the engine objected to
    pub reason: String,
}

/// Operations the event handler may issue against the engine
///
/// All methods are only ever called from within an event dispatch, i.e. on
/// the reactor thread, so implementations need no internal synchronization.
pub trait EngineOps {
    /// Configure SASL PLAIN authentication on the transport
    fn sasl_plain(&mut self, username: &str, password: &str);
    /// Enable TLS without validating the peer's certificate identity
    fn tls_anonymous_peer(&mut self);
    /// Tunnel the connection through a WebSocket upgrade
    fn websocket_upgrade(&mut self, host: &str, path: &str, subprotocol: &str);
    /// Set the hostname carried in the open frame
    fn set_hostname(&mut self, hostname: &str);
    /// Create a session on the connection
    fn begin_session(&mut self) -> SessionId;
    /// Create a named link on `session` with the given role and properties
    fn attach_link(
        &mut self,
        session: SessionId,
        name: &str,
        role: LinkRole,
        properties: &[(&str, &str)],
    ) -> LinkId;
    /// Set the target address of a sender link
    fn set_target_address(&mut self, link: LinkId, address: &str);
    /// Set the source address of a receiver link
    fn set_source_address(&mut self, link: LinkId, address: &str);
    /// Require remote acknowledgement before deliveries on `link` settle
    fn require_settlement(&mut self, link: LinkId);
    /// Open the connection
    fn open_connection(&mut self);
    /// Open a session
    fn open_session(&mut self, session: SessionId);
    /// Open a link
    fn open_link(&mut self, link: LinkId);
    /// Close a link
    fn close_link(&mut self, link: LinkId);
    /// Close a session
    fn close_session(&mut self, session: SessionId);
    /// Close the connection; the reactor terminates once teardown completes
    fn close_connection(&mut self);
    /// Remaining transfer credit on a sender link
    fn credit(&mut self, link: LinkId) -> u32;
    /// Encode `message` into `buf`, returning the encoded length
    fn encode(&mut self, message: &crate::WireMessage, buf: &mut [u8]) -> Result<usize, Overflow>;
    /// Create a delivery with the given tag on a sender link
    fn delivery(&mut self, link: LinkId, tag: &[u8]) -> DeliveryId;
    /// Transmit encoded payload bytes on a sender link
    fn send(&mut self, link: LinkId, payload: &[u8]);
    /// Advance the link past the current delivery
    fn advance(&mut self, link: LinkId);
    /// Read the pending transfer on a receiver link, if one is complete
    fn recv(&mut self, link: LinkId) -> Option<IncomingTransfer>;
    /// Decode a payload previously read with [`recv`](Self::recv)
    fn decode(&mut self, payload: &[u8]) -> Result<crate::WireMessage, DecodeError>;
    /// Report a terminal state for a delivery and settle it
    fn settle(&mut self, delivery: DeliveryId, outcome: Outcome);
}

/// Handle for interrupting the engine's event wait from another thread
///
/// Waking causes the engine to raise [`Event::Woken`] promptly so that work
/// parked in shared state gets serviced on the reactor thread. `wake` must
/// not block.
pub trait EngineWaker: Send + Sync + fmt::Debug + 'static {
    /// Interrupt the event wait
    fn wake(&self);
}

/// A connected protocol engine instance
///
/// One engine instance backs one connection attempt; a fresh instance is
/// created for every (re)open. The engine terminates its own run loop once
/// the connection is closed locally or remotely.
pub trait Engine: Send + fmt::Debug + 'static {
    /// Obtain a waker usable while [`run`](Self::run) is in progress
    fn waker(&self) -> Box<dyn EngineWaker>;
    /// Run the event loop to completion
    ///
    /// `dispatch` is invoked on the calling thread for every event, with
    /// exclusive access to the engine's operations for the duration of the
    /// callback.
    fn run(self: Box<Self>, dispatch: &mut dyn FnMut(&mut dyn EngineOps, Event));
}

/// Builds a fresh [`Engine`] for every connection attempt
pub trait EngineFactory: Send + Sync + 'static {
    /// Create an engine that will connect to `address` (`host:port`)
    fn create(&self, address: &str) -> Box<dyn Engine>;
}

impl<F> EngineFactory for F
where
    F: Fn(&str) -> Box<dyn Engine> + Send + Sync + 'static,
{
    fn create(&self, address: &str) -> Box<dyn Engine> {
        self(address)
    }
}
