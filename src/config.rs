//! Client configuration

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Port used for native TLS AMQP connections
pub const PORT_AMQP: u16 = 5671;
/// Port used for WebSocket-tunneled connections
pub const PORT_WEBSOCKET: u16 = 443;

pub(crate) const WEBSOCKET_PATH: &str = "/$iothub/websocket";
pub(crate) const WEBSOCKET_SUBPROTOCOL: &str = "AMQPWSB10";

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces the time-bounded credential used as the SASL password
///
/// A fresh token is requested for every connection attempt, so rotating
/// short-lived shared-access-signature tokens behave correctly across
/// reconnects. Token generation itself is up to the implementation; closures
/// returning a `String` implement this trait.
pub trait TokenSource: Send + Sync + 'static {
    /// Produce a credential valid for at least the next connection attempt
    fn token(&self) -> String;
}

impl<F> TokenSource for F
where
    F: Fn() -> String + Send + Sync + 'static,
{
    fn token(&self) -> String {
        self()
    }
}

/// Which transport variant to connect with
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum TransportProtocol {
    /// AMQP over TLS on port 5671
    #[default]
    Amqp,
    /// AMQP tunneled through a WebSocket on port 443
    AmqpWebSocket,
}

impl TransportProtocol {
    pub(crate) fn address(&self, hostname: &str) -> String {
        match self {
            Self::Amqp => format!("{hostname}:{PORT_AMQP}"),
            Self::AmqpWebSocket => format!("{hostname}:{PORT_WEBSOCKET}"),
        }
    }
}

/// Policy for re-dispatching messages that failed a send attempt
///
/// A failed attempt (rejection, dispatch timeout) moves the message to the
/// tail of the outbound queue and counts against `max_attempts`. The default
/// retries without bound and without delay; callers that prefer to bound the
/// work set an explicit budget.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RetryConfig {
    pub(crate) max_attempts: Option<NonZeroU32>,
    pub(crate) delay: Duration,
}

impl RetryConfig {
    /// Maximum number of send attempts per message, `None` for unbounded
    pub fn max_attempts(&mut self, value: Option<NonZeroU32>) -> &mut Self {
        self.max_attempts = value;
        self
    }

    /// Fixed delay before a failed message becomes eligible for re-dispatch
    pub fn delay(&mut self, value: Duration) -> &mut Self {
        self.delay = value;
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: Duration::ZERO,
        }
    }
}

/// Errors from [`ClientConfig`] validation
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// The hub hostname was empty
    #[error("hostname cannot be empty")]
    EmptyHostname,
    /// The hub name was empty
    #[error("hub name cannot be empty")]
    EmptyHubName,
    /// The device identifier was empty
    #[error("device id cannot be empty")]
    EmptyDeviceId,
}

/// Parameters identifying one device's connection to a hub
///
/// Validated on construction: the hostname, hub name and device id must be
/// non-empty. Timing and retry knobs have defaults matching the service's
/// expectations and can be adjusted with the chainable setters.
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) hostname: String,
    pub(crate) hub_name: String,
    pub(crate) device_id: String,
    pub(crate) token_source: Arc<dyn TokenSource>,
    pub(crate) protocol: TransportProtocol,
    pub(crate) open_timeout: Duration,
    pub(crate) dispatch_timeout: Duration,
    pub(crate) retry: RetryConfig,
}

impl ClientConfig {
    /// Create a configuration for `device_id` on the hub at `hostname`
    pub fn new(
        hostname: impl Into<String>,
        hub_name: impl Into<String>,
        device_id: impl Into<String>,
        token_source: impl TokenSource,
    ) -> Result<Self, ConfigError> {
        let hostname = hostname.into();
        if hostname.is_empty() {
            return Err(ConfigError::EmptyHostname);
        }
        let hub_name = hub_name.into();
        if hub_name.is_empty() {
            return Err(ConfigError::EmptyHubName);
        }
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(ConfigError::EmptyDeviceId);
        }
        Ok(Self {
            hostname,
            hub_name,
            device_id,
            token_source: Arc::new(token_source),
            protocol: TransportProtocol::default(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            retry: RetryConfig::default(),
        })
    }

    /// Select the transport variant
    pub fn protocol(&mut self, value: TransportProtocol) -> &mut Self {
        self.protocol = value;
        self
    }

    /// Bound on how long `open` waits for the connection to become ready
    pub fn open_timeout(&mut self, value: Duration) -> &mut Self {
        self.open_timeout = value;
        self
    }

    /// Bound on how long a dispatched message may wait for link credit
    pub fn dispatch_timeout(&mut self, value: Duration) -> &mut Self {
        self.dispatch_timeout = value;
        self
    }

    /// Access the retry policy
    pub fn retry(&mut self) -> &mut RetryConfig {
        &mut self.retry
    }

    /// The device identifier this configuration is bound to
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// SASL username, `{device_id}@sas.{hub_name}`
    pub(crate) fn username(&self) -> String {
        format!("{}@sas.{}", self.device_id, self.hub_name)
    }

    /// `host:port` dial target for the configured transport variant
    pub(crate) fn address(&self) -> String {
        self.protocol.address(&self.hostname)
    }

    /// Target address for device-to-cloud messages
    pub(crate) fn send_endpoint(&self) -> String {
        format!("/devices/{}/messages/events", self.device_id)
    }

    /// Source address for cloud-to-device messages
    pub(crate) fn receive_endpoint(&self) -> String {
        format!("/devices/{}/messages/devicebound", self.device_id)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("hostname", &self.hostname)
            .field("hub_name", &self.hub_name)
            .field("device_id", &self.device_id)
            .field("protocol", &self.protocol)
            .field("open_timeout", &self.open_timeout)
            .field("dispatch_timeout", &self.dispatch_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
