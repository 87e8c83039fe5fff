//! Protocol event handler
//!
//! Bridges the engine's lifecycle events to the orchestrator's semantics.
//! Every method here runs on the reactor thread, which is the only thread
//! that ever touches the engine: work requested from caller threads (a
//! parked transmit, a settlement, a close) is pulled out of the shared state
//! and serviced at the end of each dispatch.

use std::mem;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::config::{WEBSOCKET_PATH, WEBSOCKET_SUBPROTOCOL};
use crate::connection::{self, ConnectionShared, PendingTransmit};
use crate::engine::{EngineOps, Event, LinkId, LinkRole, Outcome, Overflow};
use crate::message::{Message, WireMessage};
use crate::TransportProtocol;

pub(crate) const SEND_LINK_NAME: &str = "sender";
pub(crate) const RECEIVE_LINK_NAME: &str = "receiver";

/// Link property advertising the client software version
pub(crate) const CLIENT_VERSION_KEY: &str = "com.microsoft:client-version";
pub(crate) const CLIENT_VERSION: &str = concat!("hublink/", env!("CARGO_PKG_VERSION"));

/// Starting size of the encode buffer; doubled until the message fits
const ENCODE_BUF_INITIAL: usize = 1024;

pub(crate) struct EventHandler {
    shared: Arc<ConnectionShared>,
    /// `host:port`, also the hostname carried in the open frame
    address: String,
    /// Bare host for the WebSocket upgrade request
    hostname: String,
    username: String,
    token: String,
    websocket: bool,
    send_endpoint: String,
    receive_endpoint: String,
    session: Option<crate::engine::SessionId>,
    sender: Option<LinkId>,
    receiver: Option<LinkId>,
    credit: u32,
    link_flow: bool,
    next_tag: u64,
    closing: bool,
}

impl EventHandler {
    pub(crate) fn new(shared: Arc<ConnectionShared>, token: String) -> Self {
        let config = &shared.config;
        Self {
            address: config.address(),
            hostname: config.hostname.clone(),
            username: config.username(),
            token,
            websocket: config.protocol == TransportProtocol::AmqpWebSocket,
            send_endpoint: config.send_endpoint(),
            receive_endpoint: config.receive_endpoint(),
            session: None,
            sender: None,
            receiver: None,
            credit: 0,
            link_flow: false,
            next_tag: 0,
            closing: false,
            shared,
        }
    }

    /// Dispatch one engine event, then service any work parked by caller
    /// threads
    pub(crate) fn handle(&mut self, ops: &mut dyn EngineOps, event: Event) {
        trace!(?event, "engine event");
        match event {
            Event::ConnectionInit => self.on_connection_init(ops),
            Event::ConnectionBound => self.on_connection_bound(ops),
            Event::ConnectionLocalOpen => {}
            Event::ConnectionRemoteClose { error } => {
                if error.is_some() || !self.closing {
                    debug!(?error, "connection closed by remote peer");
                    connection::remote_closed(&self.shared, error);
                }
            }
            Event::LinkInit { link } => self.on_link_init(ops, link),
            Event::LinkRemoteOpen { link } => {
                if self.sender == Some(link) {
                    connection::ready(&self.shared);
                }
            }
            Event::LinkFlow { link } => self.on_link_flow(ops, link),
            Event::LinkLocalClose { link } => self.on_link_close(ops, link, None),
            Event::LinkRemoteClose { link, error } => self.on_link_close(ops, link, error),
            Event::Transfer { link } => self.on_transfer(ops, link),
            Event::Disposition { delivery, outcome } => {
                connection::acknowledge(&self.shared, delivery, outcome == Outcome::Accepted);
            }
            Event::TransportError { condition } => {
                error!(%condition, "transport error");
                connection::transport_failed(&self.shared, condition);
            }
            Event::Woken => {}
        }
        self.drive(ops);
    }

    fn on_connection_bound(&mut self, ops: &mut dyn EngineOps) {
        if self.websocket {
            ops.websocket_upgrade(&self.hostname, WEBSOCKET_PATH, WEBSOCKET_SUBPROTOCOL);
        }
        ops.sasl_plain(&self.username, &self.token);
        // The service endpoint presents a certificate we do not pin
        ops.tls_anonymous_peer();
    }

    fn on_connection_init(&mut self, ops: &mut dyn EngineOps) {
        ops.set_hostname(&self.address);
        let session = ops.begin_session();
        let properties = [(CLIENT_VERSION_KEY, CLIENT_VERSION)];
        let receiver = ops.attach_link(session, RECEIVE_LINK_NAME, LinkRole::Receiver, &properties);
        let sender = ops.attach_link(session, SEND_LINK_NAME, LinkRole::Sender, &properties);
        self.session = Some(session);
        self.receiver = Some(receiver);
        self.sender = Some(sender);
        ops.open_connection();
        ops.open_session(session);
        ops.open_link(receiver);
        ops.open_link(sender);
        debug!(address = %self.address, "connection negotiation started");
    }

    fn on_link_init(&mut self, ops: &mut dyn EngineOps, link: LinkId) {
        if self.sender == Some(link) {
            ops.set_target_address(link, &self.send_endpoint);
            ops.require_settlement(link);
        } else if self.receiver == Some(link) {
            ops.set_source_address(link, &self.receive_endpoint);
        }
    }

    fn on_link_flow(&mut self, ops: &mut dyn EngineOps, link: LinkId) {
        if self.sender != Some(link) {
            return;
        }
        self.credit = ops.credit(link);
        self.link_flow = true;
        trace!(credit = self.credit, "sender link flow");
        connection::link_ready(&self.shared);
    }

    fn on_transfer(&mut self, ops: &mut dyn EngineOps, link: LinkId) {
        if self.receiver != Some(link) {
            return;
        }
        let Some(transfer) = ops.recv(link) else {
            return;
        };
        if transfer.partial {
            return;
        }
        match ops.decode(&transfer.payload) {
            Ok(wire) => {
                trace!(delivery = ?transfer.delivery, "message received");
                let message = Message::from_wire(wire);
                connection::enqueue_received(&self.shared, message, transfer.delivery);
            }
            Err(e) => warn!(error = %e, "dropping undecodable message"),
        }
    }

    fn on_link_close(
        &mut self,
        ops: &mut dyn EngineOps,
        link: LinkId,
        error: Option<crate::engine::ErrorCondition>,
    ) {
        if self.closing {
            return;
        }
        warn!(?link, ?error, "link closed");
        connection::link_closed(&self.shared, error);
        // Cascade: a dead link takes the session and connection with it
        self.closing = true;
        if let Some(session) = self.session {
            ops.close_session(session);
        }
        ops.close_connection();
    }

    /// Service work parked in the shared state: settlements requested by the
    /// caller, a pending close, and the packet waiting to go on the wire
    fn drive(&mut self, ops: &mut dyn EngineOps) {
        let (settlements, close_requested, transmit) = {
            let mut inner = self.shared.state.lock().unwrap();
            let settlements = mem::take(&mut inner.pending_settlements);
            let close_requested = inner.close_requested && !self.closing;
            let transmit = if !close_requested && self.link_flow && self.credit > 0 {
                inner.pending_transmit.take()
            } else {
                None
            };
            (settlements, close_requested, transmit)
        };
        for (delivery, outcome) in settlements {
            trace!(?delivery, ?outcome, "settling received message");
            ops.settle(delivery, outcome);
        }
        if let Some(pending) = transmit {
            self.transmit(ops, pending);
        }
        if close_requested {
            self.shutdown(ops);
        }
    }

    /// Encode, tag, and transmit one packet, then move it into the delivery
    /// correlation map
    fn transmit(&mut self, ops: &mut dyn EngineOps, mut pending: PendingTransmit) {
        let Some(link) = self.sender else {
            // No sender link yet; leave the packet parked
            self.shared.state.lock().unwrap().pending_transmit = Some(pending);
            return;
        };
        let wire = WireMessage {
            to: Some(self.send_endpoint.clone()),
            message_id: pending.packet.message_id.clone(),
            application_properties: pending.packet.application_properties.clone(),
            body: pending.packet.body.clone(),
            ..Default::default()
        };
        let mut buf = vec![0; ENCODE_BUF_INITIAL];
        let len = loop {
            match ops.encode(&wire, &mut buf) {
                Ok(len) => break len,
                Err(Overflow) => {
                    let doubled = buf.len() * 2;
                    buf.resize(doubled, 0);
                }
            }
        };
        let tag = self.next_tag.to_string();
        self.next_tag += 1;
        let delivery = ops.delivery(link, tag.as_bytes());
        ops.send(link, &buf[..len]);
        ops.advance(link);
        self.credit = self.credit.saturating_sub(1);
        trace!(?delivery, len, tag = %tag, "transmitted");

        let mut inner = self.shared.state.lock().unwrap();
        if let Some(tx) = pending.transmitted.take() {
            let _ = tx.send(());
        }
        inner.in_flight.insert(delivery, pending.packet);
    }

    fn shutdown(&mut self, ops: &mut dyn EngineOps) {
        debug!("tearing the engine down");
        self.closing = true;
        self.link_flow = false;
        if let Some(link) = self.sender {
            ops.close_link(link);
        }
        if let Some(link) = self.receiver {
            ops.close_link(link);
        }
        if let Some(session) = self.session {
            ops.close_session(session);
        }
        ops.close_connection();
    }
}
