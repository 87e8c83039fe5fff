use std::collections::VecDeque;
use std::io;
use std::num::NonZeroU32;
use std::str;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing_subscriber::EnvFilter;

use crate::engine::{
    DecodeError, DeliveryId, Engine, EngineFactory, EngineOps, EngineWaker, ErrorCondition, Event,
    IncomingTransfer, LinkId, LinkRole, Outcome, Overflow, SessionId,
};
use crate::{
    ClientConfig, CompletionStatus, ConnectError, Connection, Message, MessageResult, SendError,
    StateError, Transport, TransportProtocol, TransportState, WireMessage,
};

#[tokio::test]
async fn open_becomes_ready() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());

    establish(&connection, &hub).await;

    hub.with(|state| {
        assert_eq!(state.address, "hub.example.net:5671");
        assert_eq!(state.hostname.as_deref(), Some("hub.example.net:5671"));
        assert_eq!(
            state.sasl.as_ref().unwrap(),
            &(
                "device-1@sas.contoso".to_owned(),
                "SharedAccessSignature sr=hub.example.net".to_owned()
            )
        );
        assert!(state.tls_anonymous);

        let sender = state.link(LinkRole::Sender).unwrap();
        let receiver = state.link(LinkRole::Receiver).unwrap();
        assert_eq!(
            state.targets.iter().find(|(l, _)| *l == sender).unwrap().1,
            "/devices/device-1/messages/events"
        );
        assert_eq!(
            state.sources.iter().find(|(l, _)| *l == receiver).unwrap().1,
            "/devices/device-1/messages/devicebound"
        );
        assert!(state.unsettled_links.contains(&sender));
        // Both links advertise the client version
        assert!(state
            .link_properties
            .iter()
            .all(|(_, props)| props.iter().any(|(k, _)| k == "com.microsoft:client-version")));
    });

    // Aggregate status is fulfilled after a clean open with nothing queued
    connection.completion().await.unwrap();
}

#[tokio::test]
async fn websocket_variant_tunnels_the_connection() {
    let _guard = subscribe();
    let mut config = config();
    config.protocol(TransportProtocol::AmqpWebSocket);
    let (connection, hub) = setup(config);

    establish(&connection, &hub).await;

    hub.with(|state| {
        assert_eq!(state.address, "hub.example.net:443");
        assert_eq!(
            state.websocket.as_ref().unwrap(),
            &(
                "hub.example.net".to_owned(),
                "/$iothub/websocket".to_owned(),
                "AMQPWSB10".to_owned()
            )
        );
    });
}

#[tokio::test]
async fn open_times_out_without_remote() {
    let _guard = subscribe();
    let mut config = config();
    config.open_timeout(Duration::from_millis(100));
    let (connection, _hub) = setup(config);

    let start = Instant::now();
    match connection.open().await {
        Err(ConnectError::TimedOut) => {}
        other => panic!("unexpected open result: {other:?}"),
    }
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(matches!(
        connection.schedule_send(&b"x"[..], None),
        Err(StateError::Closed)
    ));
}

#[tokio::test]
async fn send_completes_on_accept() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    let settlement = connection
        .schedule_send(&b"hello"[..], Some("m-1".to_owned()))
        .unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.with(|state| {
        let (_, wire) = &state.sent[0];
        assert_eq!(&wire.body[..], b"hello");
        assert_eq!(wire.to.as_deref(), Some("/devices/device-1/messages/events"));
        assert_eq!(wire.message_id.as_deref(), Some("m-1"));
    });

    hub.dispose(0, Outcome::Accepted);
    settlement.await.unwrap();
    connection.completion().await.unwrap();
}

#[tokio::test]
async fn sends_dispatch_in_fifo_order() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    let settlements: Vec<_> = (0..3)
        .map(|i| {
            connection
                .schedule_send(format!("msg-{i}").into_bytes(), None)
                .unwrap()
        })
        .collect();
    for i in 0..3 {
        hub.wait_until(|state| (state.sent.len() == i + 1).then_some(())).await;
        hub.dispose(i, Outcome::Accepted);
    }
    for settlement in settlements {
        settlement.await.unwrap();
    }
    hub.with(|state| {
        let bodies: Vec<_> = state.sent.iter().map(|(_, w)| w.body.clone()).collect();
        assert_eq!(bodies, vec!["msg-0", "msg-1", "msg-2"]);
        assert_eq!(state.max_unacked, 1);
    });
}

/// A rejected delivery moves its message to the tail of the queue: the wire
/// order becomes 1, 2, 1-retry, with never more than one delivery
/// unacknowledged
#[tokio::test]
async fn rejection_requeues_at_tail() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    let first = connection.schedule_send(&b"first"[..], None).unwrap();
    let second = connection.schedule_send(&b"second"[..], None).unwrap();

    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.dispose(0, Outcome::Rejected);

    hub.wait_until(|state| (state.sent.len() == 2).then_some(())).await;
    hub.with(|state| assert_eq!(&state.sent[1].1.body[..], b"second"));
    hub.dispose(1, Outcome::Accepted);
    second.await.unwrap();

    hub.wait_until(|state| (state.sent.len() == 3).then_some(())).await;
    hub.with(|state| assert_eq!(&state.sent[2].1.body[..], b"first"));
    hub.dispose(2, Outcome::Accepted);
    first.await.unwrap();

    hub.with(|state| assert_eq!(state.max_unacked, 1));
    connection.completion().await.unwrap();
}

#[tokio::test]
async fn retry_budget_exhausts() {
    let _guard = subscribe();
    let mut config = config();
    config.retry().max_attempts(NonZeroU32::new(2));
    let (connection, hub) = setup(config);
    establish(&connection, &hub).await;

    let settlement = connection.schedule_send(&b"stubborn"[..], None).unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.dispose(0, Outcome::Rejected);
    hub.wait_until(|state| (state.sent.len() == 2).then_some(())).await;
    hub.dispose(1, Outcome::Rejected);

    assert_eq!(settlement.await, Err(SendError::Rejected));
    tokio::time::sleep(Duration::from_millis(50)).await;
    hub.with(|state| assert_eq!(state.sent.len(), 2));
}

/// A configured retry delay holds the failed message back before it becomes
/// eligible for re-dispatch
#[tokio::test]
async fn retry_delay_defers_redispatch() {
    let _guard = subscribe();
    let mut config = config();
    config.retry().delay(Duration::from_millis(150));
    let (connection, hub) = setup(config);
    establish(&connection, &hub).await;

    let settlement = connection.schedule_send(&b"later"[..], None).unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.dispose(0, Outcome::Rejected);

    tokio::time::sleep(Duration::from_millis(50)).await;
    hub.with(|state| assert_eq!(state.sent.len(), 1));

    hub.wait_until(|state| (state.sent.len() == 2).then_some(())).await;
    hub.dispose(1, Outcome::Accepted);
    settlement.await.unwrap();
}

/// With credit never granted, the dispatch watchdog returns the packet to the
/// retry path; a budget of one attempt makes that failure terminal
#[tokio::test]
async fn dispatch_watchdog_requeues() {
    let _guard = subscribe();
    let mut config = config();
    config.dispatch_timeout(Duration::from_millis(50));
    config.retry().max_attempts(NonZeroU32::new(1));
    let (connection, hub) = setup(config);
    establish_with_credit(&connection, &hub, 0).await;

    let settlement = connection.schedule_send(&b"parked"[..], None).unwrap();
    assert_eq!(settlement.await, Err(SendError::DispatchTimedOut));
    hub.with(|state| assert!(state.sent.is_empty()));
}

#[tokio::test]
async fn close_is_idempotent_and_open_rebuilds() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    connection.close();
    connection.close();
    assert!(matches!(
        connection.schedule_send(&b"x"[..], None),
        Err(StateError::Closed)
    ));

    // Reopening builds a fresh engine and handler
    establish(&connection, &hub).await;
    assert_eq!(hub.engines(), 2);

    let settlement = connection.schedule_send(&b"again"[..], None).unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.dispose(0, Outcome::Accepted);
    settlement.await.unwrap();
}

#[tokio::test]
async fn schedule_on_closed_connection_fails() {
    let _guard = subscribe();
    let (connection, _hub) = setup(config());
    assert!(matches!(
        connection.schedule_send(&b"hello"[..], None),
        Err(StateError::Closed)
    ));
}

#[tokio::test]
async fn receive_and_acknowledge() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    let wire = WireMessage {
        to: Some("/devices/device-1/messages/devicebound".to_owned()),
        message_id: Some("c2d-1".to_owned()),
        application_properties: vec![
            ("iothub-ack".to_owned(), "full".to_owned()),
            ("severity".to_owned(), "low".to_owned()),
        ],
        body: Bytes::from_static(b"reboot"),
        ..Default::default()
    };
    let delivery = hub.deliver(wire);

    let message = wait_for_message(&connection).await;
    assert_eq!(message.body(), b"reboot");
    assert_eq!(message.property("messageId"), Some("c2d-1"));
    assert_eq!(message.property("severity"), Some("low"));
    assert_eq!(message.property("iothub-ack"), None);

    connection.send_message_result(MessageResult::Complete).unwrap();
    hub.wait_until(|state| {
        state
            .settled
            .iter()
            .any(|(d, o)| *d == delivery && *o == Outcome::Accepted)
            .then_some(())
    })
    .await;
}

#[tokio::test]
async fn message_result_requires_prior_receive() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    assert_eq!(
        connection.send_message_result(MessageResult::Complete),
        Err(StateError::NoMessageReceived)
    );

    let delivery = hub.deliver(WireMessage {
        body: Bytes::from_static(b"one"),
        ..Default::default()
    });
    wait_for_message(&connection).await;
    connection.send_message_result(MessageResult::Reject).unwrap();
    hub.wait_until(|state| {
        state
            .settled
            .iter()
            .any(|(d, o)| *d == delivery && *o == Outcome::Rejected)
            .then_some(())
    })
    .await;

    // The retained message was spent by the first result
    assert_eq!(
        connection.send_message_result(MessageResult::Complete),
        Err(StateError::NoMessageReceived)
    );
}

/// Messages large enough to overflow the initial encode buffer still go out;
/// the handler doubles the buffer until the engine accepts it
#[tokio::test]
async fn oversized_message_grows_encode_buffer() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    let big = vec![0x42u8; 16 * 1024];
    let settlement = connection.schedule_send(big.clone(), None).unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.with(|state| assert_eq!(state.sent[0].1.body.len(), big.len()));
    hub.dispose(0, Outcome::Accepted);
    settlement.await.unwrap();
}

#[tokio::test]
async fn link_close_fails_in_flight_send() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    let settlement = connection.schedule_send(&b"doomed"[..], None).unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;

    let sender = hub.with(|state| state.link(LinkRole::Sender).unwrap());
    hub.push(Event::LinkRemoteClose {
        link: sender,
        error: None,
    });

    assert_eq!(settlement.await, Err(SendError::LinkClosed));
    assert_eq!(connection.completion().await, Err(SendError::LinkClosed));
    assert!(matches!(
        connection.schedule_send(&b"x"[..], None),
        Err(StateError::Closed)
    ));
}

#[tokio::test]
async fn transport_error_fails_aggregate_status() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    let condition = ErrorCondition {
        condition: "amqp:connection:forced".to_owned(),
        description: Some("maintenance".to_owned()),
    };
    hub.push(Event::TransportError {
        condition: condition.clone(),
    });

    assert_eq!(
        connection.completion().await,
        Err(SendError::Transport(condition))
    );
}

#[tokio::test]
async fn reactor_gate_survives_engine_panic() {
    let _guard = subscribe();
    let (connection, hub) = setup(config());
    establish(&connection, &hub).await;

    hub.with(|state| state.panic_next = true);
    hub.push(Event::Woken);

    // The gate guard closes the connection out even though the engine
    // panicked
    wait_until(|| {
        matches!(
            connection.schedule_send(&b"x"[..], None),
            Err(StateError::Closed)
        )
    })
    .await;

    // And a fresh reactor can be started afterwards
    establish(&connection, &hub).await;
    assert_eq!(hub.engines(), 2);
    let settlement = connection.schedule_send(&b"recovered"[..], None).unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.dispose(0, Outcome::Accepted);
    settlement.await.unwrap();
}

#[tokio::test]
async fn transport_send_and_callbacks() {
    let _guard = subscribe();
    let hub = MockHub::new();
    let transport = Transport::new(config(), Arc::new(hub.clone()));
    open_transport(&transport, &hub).await;

    let status = Arc::new(Mutex::new(None));
    let recorded = status.clone();
    let mut message = Message::new(&b"telemetry"[..]);
    message.set_message_id("t-1");
    transport
        .add_message(message, move |s| *recorded.lock().unwrap() = Some(s))
        .unwrap();
    transport.send_messages().await.unwrap();

    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.dispose(0, Outcome::Accepted);

    wait_until(|| {
        transport.invoke_callbacks().unwrap();
        status.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(*status.lock().unwrap(), Some(CompletionStatus::Ok));
    assert!(transport.is_empty());
}

#[tokio::test]
async fn transport_expires_stale_messages() {
    let _guard = subscribe();
    let hub = MockHub::new();
    let transport = Transport::new(config(), Arc::new(hub.clone()));
    open_transport(&transport, &hub).await;

    let status = Arc::new(Mutex::new(None));
    let recorded = status.clone();
    let mut message = Message::new(&b"stale"[..]);
    message.set_expiry(Instant::now() - Duration::from_secs(1));
    transport
        .add_message(message, move |s| *recorded.lock().unwrap() = Some(s))
        .unwrap();
    transport.send_messages().await.unwrap();
    transport.invoke_callbacks().unwrap();

    assert_eq!(*status.lock().unwrap(), Some(CompletionStatus::Expired));
    hub.with(|state| assert!(state.sent.is_empty()));
    assert!(transport.is_empty());
}

#[tokio::test]
async fn transport_rebuilds_after_connection_loss() {
    let _guard = subscribe();
    let hub = MockHub::new();
    let transport = Transport::new(config(), Arc::new(hub.clone()));
    open_transport(&transport, &hub).await;

    let status = Arc::new(Mutex::new(None));
    let recorded = status.clone();
    transport
        .add_message(Message::new(&b"persistent"[..]), move |s| {
            *recorded.lock().unwrap() = Some(s)
        })
        .unwrap();
    transport.send_messages().await.unwrap();
    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;

    // Kill the link mid-flight: the message goes back to the waiting queue
    let sender = hub.with(|state| state.link(LinkRole::Sender).unwrap());
    hub.push(Event::LinkRemoteClose {
        link: sender,
        error: None,
    });
    wait_until(|| transport.state() == TransportState::Crashed).await;
    assert!(!transport.is_empty());

    // The next send attempt builds a fresh connection and drains the queue
    let generation = hub.engines() + 1;
    let resend = transport.send_messages();
    let reestablish = async {
        wait_until(|| hub.engines() >= generation).await;
        hub.wait_until(|state| (state.links.len() == 2).then_some(())).await;
        hub.ready(100);
    };
    let (resent, ()) = tokio::join!(resend, reestablish);
    resent.unwrap();
    assert_eq!(hub.engines(), 2);

    hub.wait_until(|state| (state.sent.len() == 1).then_some(())).await;
    hub.dispose(0, Outcome::Accepted);
    wait_until(|| {
        transport.invoke_callbacks().unwrap();
        status.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(*status.lock().unwrap(), Some(CompletionStatus::Ok));
}

#[tokio::test]
async fn transport_handles_received_messages() {
    let _guard = subscribe();
    let hub = MockHub::new();
    let transport = Transport::new(config(), Arc::new(hub.clone()));
    let received = Arc::new(Mutex::new(None));
    let sink = received.clone();
    transport.set_message_callback(move |message| {
        *sink.lock().unwrap() = Some(message);
        MessageResult::Complete
    });
    open_transport(&transport, &hub).await;

    let delivery = hub.deliver(WireMessage {
        message_id: Some("c2d-9".to_owned()),
        body: Bytes::from_static(b"ping"),
        ..Default::default()
    });

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            transport.handle_message().await.unwrap();
            if received.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let message = received.lock().unwrap().take().unwrap();
    assert_eq!(message.body(), b"ping");
    assert_eq!(message.property("messageId"), Some("c2d-9"));
    hub.wait_until(|state| {
        state
            .settled
            .iter()
            .any(|(d, o)| *d == delivery && *o == Outcome::Accepted)
            .then_some(())
    })
    .await;
}

#[tokio::test]
async fn transport_rejects_messages_while_closed() {
    let _guard = subscribe();
    let hub = MockHub::new();
    let transport = Transport::new(config(), Arc::new(hub.clone()));
    assert!(transport
        .add_message(Message::new(&b"x"[..]), |_| {})
        .is_err());
}

fn config() -> ClientConfig {
    let mut config = ClientConfig::new("hub.example.net", "contoso", "device-1", || {
        "SharedAccessSignature sr=hub.example.net".to_owned()
    })
    .unwrap();
    config
        .open_timeout(Duration::from_secs(2))
        .dispatch_timeout(Duration::from_millis(500));
    config
}

fn setup(config: ClientConfig) -> (Connection, MockHub) {
    let hub = MockHub::new();
    let connection = Connection::new(config, Arc::new(hub.clone()));
    (connection, hub)
}

/// Drive `open` to completion while playing the remote side of the handshake
async fn establish(connection: &Connection, hub: &MockHub) {
    establish_with_credit(connection, hub, 100).await;
}

async fn establish_with_credit(connection: &Connection, hub: &MockHub, credit: u32) {
    // A reopen builds a fresh engine; make sure we play the remote on the
    // new one rather than the one that is winding down
    let generation = hub.engines() + 1;
    let opening = connection.open();
    let remote = async {
        wait_until(|| hub.engines() >= generation).await;
        hub.wait_until(|state| (state.links.len() == 2).then_some(())).await;
        hub.ready(credit);
    };
    let (result, ()) = tokio::join!(opening, remote);
    result.expect("open failed");
}

async fn open_transport(transport: &Transport, hub: &MockHub) {
    let generation = hub.engines() + 1;
    let opening = transport.open();
    let remote = async {
        wait_until(|| hub.engines() >= generation).await;
        hub.wait_until(|state| (state.links.len() == 2).then_some(())).await;
        hub.ready(100);
    };
    let (result, ()) = tokio::join!(opening, remote);
    result.expect("transport open failed");
}

async fn wait_for_message(connection: &Connection) -> Message {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(message) = connection.consume_message().unwrap() {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no message arrived in time")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut io::stdout())
    }
}

/// Scripted stand-in for the protocol engine
///
/// Records every operation the handler issues and lets the test play the
/// remote peer by pushing events into the reactor's queue.
#[derive(Default)]
struct MockState {
    address: String,
    hostname: Option<String>,
    sasl: Option<(String, String)>,
    tls_anonymous: bool,
    websocket: Option<(String, String, String)>,
    links: Vec<(LinkId, String, LinkRole)>,
    link_properties: Vec<(LinkId, Vec<(String, String)>)>,
    targets: Vec<(LinkId, String)>,
    sources: Vec<(LinkId, String)>,
    unsettled_links: Vec<LinkId>,
    credit: u32,
    last_encoded: Option<WireMessage>,
    current_delivery: Option<DeliveryId>,
    sent: Vec<(DeliveryId, WireMessage)>,
    unacked: usize,
    max_unacked: usize,
    settled: Vec<(DeliveryId, Outcome)>,
    transfers: VecDeque<(LinkId, DeliveryId, bool)>,
    inbound: VecDeque<WireMessage>,
    next_id: u64,
    connection_open: bool,
    closed: bool,
    panic_next: bool,
}

impl MockState {
    fn link(&self, role: LinkRole) -> Option<LinkId> {
        self.links
            .iter()
            .find(|(_, _, r)| *r == role)
            .map(|(id, _, _)| *id)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct MockOps {
    state: Arc<Mutex<MockState>>,
    events: Sender<Event>,
}

impl EngineOps for MockOps {
    fn sasl_plain(&mut self, username: &str, password: &str) {
        self.state.lock().unwrap().sasl = Some((username.to_owned(), password.to_owned()));
    }

    fn tls_anonymous_peer(&mut self) {
        self.state.lock().unwrap().tls_anonymous = true;
    }

    fn websocket_upgrade(&mut self, host: &str, path: &str, subprotocol: &str) {
        self.state.lock().unwrap().websocket =
            Some((host.to_owned(), path.to_owned(), subprotocol.to_owned()));
    }

    fn set_hostname(&mut self, hostname: &str) {
        self.state.lock().unwrap().hostname = Some(hostname.to_owned());
    }

    fn begin_session(&mut self) -> SessionId {
        SessionId(self.state.lock().unwrap().next_id())
    }

    fn attach_link(
        &mut self,
        _session: SessionId,
        name: &str,
        role: LinkRole,
        properties: &[(&str, &str)],
    ) -> LinkId {
        let link = {
            let mut state = self.state.lock().unwrap();
            let link = LinkId(state.next_id());
            state.links.push((link, name.to_owned(), role));
            state.link_properties.push((
                link,
                properties
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
            ));
            link
        };
        let _ = self.events.send(Event::LinkInit { link });
        link
    }

    fn set_target_address(&mut self, link: LinkId, address: &str) {
        self.state.lock().unwrap().targets.push((link, address.to_owned()));
    }

    fn set_source_address(&mut self, link: LinkId, address: &str) {
        self.state.lock().unwrap().sources.push((link, address.to_owned()));
    }

    fn require_settlement(&mut self, link: LinkId) {
        self.state.lock().unwrap().unsettled_links.push(link);
    }

    fn open_connection(&mut self) {
        self.state.lock().unwrap().connection_open = true;
    }

    fn open_session(&mut self, _session: SessionId) {}

    fn open_link(&mut self, _link: LinkId) {}

    fn close_link(&mut self, _link: LinkId) {}

    fn close_session(&mut self, _session: SessionId) {}

    fn close_connection(&mut self) {
        self.state.lock().unwrap().closed = true;
    }

    fn credit(&mut self, _link: LinkId) -> u32 {
        self.state.lock().unwrap().credit
    }

    fn encode(&mut self, message: &WireMessage, buf: &mut [u8]) -> Result<usize, Overflow> {
        let required = message.body.len() + 32;
        if buf.len() < required {
            return Err(Overflow);
        }
        self.state.lock().unwrap().last_encoded = Some(message.clone());
        Ok(required)
    }

    fn delivery(&mut self, _link: LinkId, _tag: &[u8]) -> DeliveryId {
        let mut state = self.state.lock().unwrap();
        let delivery = DeliveryId(state.next_id());
        state.current_delivery = Some(delivery);
        delivery
    }

    fn send(&mut self, _link: LinkId, _payload: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let delivery = state.current_delivery.take().expect("send without delivery");
        let wire = state.last_encoded.clone().expect("send without encode");
        state.sent.push((delivery, wire));
        state.unacked += 1;
        state.max_unacked = state.max_unacked.max(state.unacked);
        state.credit = state.credit.saturating_sub(1);
    }

    fn advance(&mut self, _link: LinkId) {}

    fn recv(&mut self, link: LinkId) -> Option<IncomingTransfer> {
        let mut state = self.state.lock().unwrap();
        let (transfer_link, delivery, partial) = state.transfers.pop_front()?;
        assert_eq!(transfer_link, link);
        Some(IncomingTransfer {
            delivery,
            payload: Bytes::new(),
            partial,
        })
    }

    fn decode(&mut self, _payload: &[u8]) -> Result<WireMessage, DecodeError> {
        self.state
            .lock()
            .unwrap()
            .inbound
            .pop_front()
            .ok_or_else(|| DecodeError {
                reason: "no inbound message scripted".to_owned(),
            })
    }

    fn settle(&mut self, delivery: DeliveryId, outcome: Outcome) {
        self.state.lock().unwrap().settled.push((delivery, outcome));
    }
}

struct MockEngine {
    state: Arc<Mutex<MockState>>,
    events_rx: Receiver<Event>,
    events_tx: Sender<Event>,
}

impl std::fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEngine").finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct MockWaker(Sender<Event>);

impl EngineWaker for MockWaker {
    fn wake(&self) {
        // The run loop may already be gone
        let _ = self.0.send(Event::Woken);
    }
}

impl Engine for MockEngine {
    fn waker(&self) -> Box<dyn EngineWaker> {
        Box::new(MockWaker(self.events_tx.clone()))
    }

    fn run(self: Box<Self>, dispatch: &mut dyn FnMut(&mut dyn EngineOps, Event)) {
        let mut ops = MockOps {
            state: self.state.clone(),
            events: self.events_tx.clone(),
        };
        dispatch(&mut ops, Event::ConnectionInit);
        if self.state.lock().unwrap().connection_open {
            dispatch(&mut ops, Event::ConnectionBound);
            dispatch(&mut ops, Event::ConnectionLocalOpen);
        }
        loop {
            if self.state.lock().unwrap().closed {
                break;
            }
            let Ok(event) = self.events_rx.recv() else {
                break;
            };
            if self.state.lock().unwrap().panic_next {
                panic!("injected engine failure");
            }
            dispatch(&mut ops, event);
        }
    }
}

/// The remote side of the conversation, plus the engine factory
#[derive(Clone)]
struct MockHub {
    current: Arc<Mutex<Option<EngineHandle>>>,
    engines: Arc<AtomicUsize>,
}

struct EngineHandle {
    state: Arc<Mutex<MockState>>,
    events: Sender<Event>,
}

impl MockHub {
    fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            engines: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of engine instances created so far
    fn engines(&self) -> usize {
        self.engines.load(Ordering::SeqCst)
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let current = self.current.lock().unwrap();
        let handle = current.as_ref().expect("no engine created yet");
        let mut state = handle.state.lock().unwrap();
        f(&mut state)
    }

    fn try_with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> Option<T> {
        let current = self.current.lock().unwrap();
        let handle = current.as_ref()?;
        let mut state = handle.state.lock().unwrap();
        Some(f(&mut state))
    }

    fn push(&self, event: Event) {
        let current = self.current.lock().unwrap();
        let handle = current.as_ref().expect("no engine created yet");
        let _ = handle.events.send(event);
    }

    async fn wait_until<T>(&self, mut f: impl FnMut(&mut MockState) -> Option<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(value) = self.try_with(&mut f).flatten() {
                    return value;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("engine state condition not reached in time")
    }

    /// Confirm both link attaches and grant sender credit
    fn ready(&self, credit: u32) {
        let (sender, receiver) = self.with(|state| {
            state.credit = credit;
            (
                state.link(LinkRole::Sender).unwrap(),
                state.link(LinkRole::Receiver).unwrap(),
            )
        });
        self.push(Event::LinkRemoteOpen { link: receiver });
        self.push(Event::LinkRemoteOpen { link: sender });
        self.push(Event::LinkFlow { link: sender });
    }

    /// Settle the `index`-th sent message with `outcome`
    fn dispose(&self, index: usize, outcome: Outcome) {
        let delivery = self.with(|state| {
            state.unacked -= 1;
            state.sent[index].0
        });
        self.push(Event::Disposition { delivery, outcome });
    }

    /// Queue an inbound message and raise the transfer event
    fn deliver(&self, wire: WireMessage) -> DeliveryId {
        let (link, delivery) = self.with(|state| {
            let link = state.link(LinkRole::Receiver).expect("no receiver link");
            let delivery = DeliveryId(state.next_id());
            state.inbound.push_back(wire);
            state.transfers.push_back((link, delivery, false));
            (link, delivery)
        });
        self.push(Event::Transfer { link });
        delivery
    }
}

impl EngineFactory for MockHub {
    fn create(&self, address: &str) -> Box<dyn Engine> {
        let state = Arc::new(Mutex::new(MockState {
            address: address.to_owned(),
            ..MockState::default()
        }));
        let (events_tx, events_rx) = channel();
        *self.current.lock().unwrap() = Some(EngineHandle {
            state: state.clone(),
            events: events_tx.clone(),
        });
        self.engines.fetch_add(1, Ordering::SeqCst);
        Box::new(MockEngine {
            state,
            events_rx,
            events_tx,
        })
    }
}
