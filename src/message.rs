//! Conversion between the wire message representation and the SDK message type

use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;

/// Property names that may not be used as application properties
///
/// These either map to enumerated wire-level fields or are claimed by the
/// service for acknowledgement routing.
pub const RESERVED_PROPERTY_NAMES: &[&str] = &[
    "to",
    "messageId",
    "correlationId",
    "userId",
    "contentType",
    "absoluteExpiryTime",
    "iothub-ack",
];

/// How a received message should be reported back to the service
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageResult {
    /// The message was processed and may be removed from the queue
    Complete,
    /// The message could not be processed now and should be redelivered
    Abandon,
    /// The message is unprocessable and should be dead-lettered
    Reject,
}

/// Error returned when setting a property whose name is reserved
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("property name `{0}` is reserved")]
pub struct ReservedProperty(pub String);

/// An application-level message
///
/// Carries an opaque byte body plus named string properties. Outbound
/// messages may also carry an expiry deadline; expired messages are never
/// put on the wire.
#[derive(Debug, Clone)]
pub struct Message {
    body: Bytes,
    message_id: Option<String>,
    properties: Vec<(String, String)>,
    expires_at: Option<Instant>,
}

impl Message {
    /// Create a message with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            message_id: None,
            properties: Vec::new(),
            expires_at: None,
        }
    }

    /// The message body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The message identifier, if one was assigned
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Assign a message identifier
    pub fn set_message_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.message_id = Some(id.into());
        self
    }

    /// Look up a named property
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All named properties, in insertion order
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    /// Set a named property
    ///
    /// Fails if `name` is in [`RESERVED_PROPERTY_NAMES`]; reserved fields are
    /// set through their dedicated accessors instead.
    pub fn set_property(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, ReservedProperty> {
        let name = name.into();
        if RESERVED_PROPERTY_NAMES.contains(&name.as_str()) {
            return Err(ReservedProperty(name));
        }
        let value = value.into();
        match self.properties.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.properties.push((name, value)),
        }
        Ok(self)
    }

    /// Discard the message if it has not been sent by `deadline`
    pub fn set_expiry(&mut self, deadline: Instant) -> &mut Self {
        self.expires_at = Some(deadline);
        self
    }

    /// Convenience form of [`set_expiry`](Self::set_expiry) relative to now
    pub fn expire_after(&mut self, ttl: Duration) -> &mut Self {
        self.set_expiry(Instant::now() + ttl)
    }

    /// Whether the message's expiry deadline has passed
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }

    pub(crate) fn take_parts(self) -> (Bytes, Option<String>, Vec<(String, String)>) {
        (self.body, self.message_id, self.properties)
    }

    /// Adapt a decoded wire message into the application representation
    ///
    /// Enumerated protocol properties become string-valued named properties;
    /// application properties carry over unless their name is reserved.
    pub fn from_wire(wire: WireMessage) -> Self {
        let mut properties = Vec::new();
        for (name, value) in wire.protocol_properties() {
            properties.push((name.to_owned(), value.to_owned()));
        }
        for (name, value) in &wire.application_properties {
            if !RESERVED_PROPERTY_NAMES.contains(&name.as_str()) {
                properties.push((name.clone(), value.clone()));
            }
        }
        Self {
            message_id: wire.message_id.clone(),
            body: wire.body,
            properties,
            expires_at: None,
        }
    }
}

/// The wire-level message representation handed to and from the engine
///
/// Protocol properties are an enumerated, fixed set of fields; anything the
/// application defines travels in `application_properties`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMessage {
    /// Destination address, set on every outbound message
    pub to: Option<String>,
    /// Message identifier
    pub message_id: Option<String>,
    /// Correlation identifier
    pub correlation_id: Option<String>,
    /// Identity of the producing user
    pub user_id: Option<String>,
    /// MIME type of the body
    pub content_type: Option<String>,
    /// Application-defined properties
    pub application_properties: Vec<(String, String)>,
    /// Binary body, wrapped in a data section on the wire
    pub body: Bytes,
}

impl WireMessage {
    /// Build the outbound wire form of `message`, addressed to `to`
    pub fn from_message(message: &Message, to: &str) -> Self {
        let application_properties = message
            .properties()
            .iter()
            .filter(|(n, _)| !RESERVED_PROPERTY_NAMES.contains(&n.as_str()))
            .cloned()
            .collect();
        Self {
            to: Some(to.to_owned()),
            message_id: message.message_id().map(str::to_owned),
            correlation_id: None,
            user_id: None,
            content_type: None,
            application_properties,
            body: message.body.clone(),
        }
    }

    /// The enumerated protocol fields that surface as named properties on
    /// inbound adaptation, paired with their property names
    fn protocol_properties(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("to", self.to.as_deref()),
            ("messageId", self.message_id.as_deref()),
            ("correlationId", self.correlation_id.as_deref()),
            ("userId", self.user_id.as_deref()),
            ("contentType", self.content_type.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}
