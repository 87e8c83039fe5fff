//! Device-side cloud messaging over AMQP 1.0
//!
//! This crate moves telemetry messages and cloud-to-device commands between a
//! device and a hub's messaging endpoint. It implements the client-side
//! orchestration state machine (connection and link lifecycle, SASL
//! authentication setup, one-at-a-time send dispatch with acknowledgement
//! correlation, receive queuing with delayed acknowledgement, and
//! tear-down-and-rebuild failure recovery) on top of an external AMQP
//! protocol engine supplied through the [`engine`] traits. The engine owns
//! the socket, TLS, and the wire protocol; this crate owns everything above
//! it.
//!
//! The entry points are [`Connection`], the orchestrator for a single
//! device-to-hub link, and [`Transport`], the buffering surface consumed by
//! a higher-level device client.
//!
//! # Concurrency model
//!
//! Each open connection runs one dedicated reactor thread that pumps the
//! engine's events; all protocol state is touched exclusively from that
//! thread. Public methods may be called from any thread (or task): they park
//! work in shared state and wake the engine. `open` is the only suspension
//! point that waits on the network, and it is bounded by a watchdog. Exactly
//! one reactor may run per connection instance at a time; a second `open`
//! stalls until the previous reactor has fully terminated.
//!
//! # Ordering
//!
//! Outbound messages go on the wire in first-in first-out order with at most
//! one delivery awaiting acknowledgement at any instant. A message whose
//! delivery fails moves to the tail of the queue for retry, so ordering is
//! not preserved across retries.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod config;
mod connection;
pub mod engine;
mod handler;
mod message;
mod reactor;
mod transport;

pub use crate::config::{
    ClientConfig, ConfigError, RetryConfig, TokenSource, TransportProtocol, PORT_AMQP,
    PORT_WEBSOCKET,
};
pub use crate::connection::{
    ConnectError, Connection, SendError, Settlement, StateError,
};
pub use crate::message::{
    Message, MessageResult, ReservedProperty, WireMessage, RESERVED_PROPERTY_NAMES,
};
pub use crate::transport::{
    CompletionStatus, MessageCallback, SendCallback, Transport, TransportError, TransportState,
};

#[cfg(test)]
mod tests;
