//! A single broker session and its event loop
//!
//! A session is created `Configured` (client built, nothing dialled yet) and
//! becomes `Running` once its rumqttc event loop is spawned. The loop owns
//! all connection-state transitions of the snapshot while it runs:
//!
//! ```text
//! Connecting ──ConnAck──► Connected ──error/close──► Reconnecting ─┐
//!     ▲                                                            │
//!     └──────────────────── backoff delay ◄────────────────────────┘
//!                           (retries exhausted ──► Failed)
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter, Transport,
};
use statum::{machine, state};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::config::{MqttConfig, ReconnectPolicy};
use super::error::MqttError;
use super::message_manager::InboundMessage;
use super::payload::PayloadSchema;
use super::state::StatePublisher;
use super::transport::{BrokerTarget, TransportKind};

/// Capacity of the rumqttc request queue
const REQUEST_CAPACITY: usize = 16;
/// How long a connected session gets to flush its DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);
const SUBSCRIBE_QOS: QoS = QoS::AtMostOnce;

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Configured,
    Running,
}

#[machine]
#[derive(Debug)]
pub struct MqttSession<S: SessionState> {
    target: BrokerTarget,
    client: AsyncClient,
    // Topics survive reconnects and are re-issued on every ConnAck
    topics: Arc<RwLock<BTreeSet<String>>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    active_loops: Arc<AtomicUsize>,
}

impl<S: SessionState> MqttSession<S> {
    pub fn target(&self) -> &BrokerTarget {
        &self.target
    }
}

impl MqttSession<Configured> {
    /// Builds the rumqttc client for `target`. Nothing is dialled until [`start`](Self::start).
    pub fn create(
        target: BrokerTarget,
        config: &MqttConfig,
        active_loops: Arc<AtomicUsize>,
    ) -> (Self, EventLoop) {
        let client_id = format!("{}-{}", config.client_id_prefix, Uuid::new_v4().simple());
        debug!("Creating MQTT session {} for {}", client_id, target);

        let mut options = MqttOptions::new(client_id, target.broker_addr(), target.port);
        options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(true);

        if let Some(username) = &target.username {
            options.set_credentials(
                username.clone(),
                target.password.clone().unwrap_or_default(),
            );
        }

        match target.transport {
            TransportKind::Plain => {}
            TransportKind::Secured => {
                options.set_transport(Transport::tls_with_default_config());
            }
            TransportKind::Socket => {
                options.set_transport(Transport::Ws);
            }
            TransportKind::SecuredSocket => {
                options.set_transport(Transport::wss_with_default_config());
            }
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let session = Self::new(
            target,
            client,
            Arc::new(RwLock::new(BTreeSet::new())),
            CancellationToken::new(),
            None,
            active_loops,
        );
        (session, eventloop)
    }

    /// Spawns the event loop and transitions to `Running`.
    pub fn start(
        mut self,
        eventloop: EventLoop,
        publisher: StatePublisher,
        schema: PayloadSchema,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> MqttSession<Running> {
        publisher.connecting(&self.target);

        let driver = SessionDriver {
            client: self.client.clone(),
            topics: self.topics.clone(),
            cancel: self.cancel.clone(),
            publisher,
            schema,
            policy,
            connect_timeout,
            attempt: 0,
        };

        self.active_loops.fetch_add(1, Ordering::SeqCst);
        let active_loops = self.active_loops.clone();
        let target = self.target.to_string();
        self.worker = Some(tokio::spawn(async move {
            driver.run(eventloop).await;
            active_loops.fetch_sub(1, Ordering::SeqCst);
            info!("Event loop for {} stopped", target);
        }));

        info!("MQTT session started for {}", self.target);
        self.transition()
    }
}

impl MqttSession<Running> {
    pub async fn subscribe(&self, topic: &str, publisher: &StatePublisher) -> Result<(), MqttError> {
        track_subscription(&self.topics, &self.client, publisher, topic).await
    }

    pub async fn unsubscribe(&self, topic: &str, publisher: &StatePublisher) -> Result<(), MqttError> {
        let mut topics = self.topics.write().await;
        if !topics.remove(topic) {
            warn!("Not subscribed to {}, ignoring unsubscribe", topic);
            return Ok(());
        }

        if publisher.is_connected() {
            self.client.try_unsubscribe(topic)?;
        }
        info!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Closes the connection and waits for the event loop to finish.
    pub async fn shutdown(mut self, connected: bool) {
        info!("Shutting down MQTT session for {}", self.target);

        let Some(mut worker) = self.worker.take() else {
            return;
        };

        if connected {
            match self.client.try_disconnect() {
                Ok(()) => {
                    if tokio::time::timeout(DISCONNECT_GRACE, &mut worker)
                        .await
                        .is_ok()
                    {
                        debug!("Session closed gracefully");
                        return;
                    }
                    debug!("Disconnect not flushed in time, cancelling event loop");
                }
                Err(e) => warn!("Failed to queue disconnect: {}", e),
            }
        }

        self.cancel.cancel();
        if let Err(e) = worker.await {
            error!("Event loop task ended abnormally: {}", e);
        }
    }
}

/// Records `topic` and sends the SUBSCRIBE right away when connected.
///
/// The connected flag is read under the write lock: the driver flips it
/// before taking the read lock in `resubscribe`, so a topic inserted while
/// offline is always picked up by the next ConnAck.
async fn track_subscription(
    topics: &RwLock<BTreeSet<String>>,
    client: &AsyncClient,
    publisher: &StatePublisher,
    topic: &str,
) -> Result<(), MqttError> {
    let mut topics = topics.write().await;
    if !topics.insert(topic.to_string()) {
        debug!("Already subscribed to {}", topic);
        return Ok(());
    }

    // Offline subscriptions go out with the next ConnAck
    if publisher.is_connected() {
        client.try_subscribe(topic, SUBSCRIBE_QOS)?;
    }
    info!("Subscribed to {}", topic);
    Ok(())
}

/// Outcome of handling one event-loop event
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// State owned by a running event loop.
pub(crate) struct SessionDriver {
    client: AsyncClient,
    topics: Arc<RwLock<BTreeSet<String>>>,
    cancel: CancellationToken,
    publisher: StatePublisher,
    schema: PayloadSchema,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    attempt: u32,
}

impl SessionDriver {
    async fn run(mut self, mut eventloop: EventLoop) {
        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                polled = self.poll(&mut eventloop) => polled,
            };

            match polled {
                Ok(event) => {
                    if self.handle_event(event).await == Flow::Stop {
                        break;
                    }
                }
                Err(reason) => {
                    self.attempt += 1;
                    error!("MQTT connection error (attempt {}): {}", self.attempt, reason);
                    self.publisher.record_error(reason);

                    let Some(delay) = self.policy.delay_for(self.attempt) else {
                        error!(
                            "Giving up after {} retries",
                            self.attempt.saturating_sub(1)
                        );
                        self.publisher.gave_up();
                        break;
                    };

                    self.publisher.reconnecting(self.attempt);
                    info!("Reconnecting in {} ms", delay.as_millis());
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn poll(&self, eventloop: &mut EventLoop) -> Result<Event, String> {
        if self.publisher.is_connected() {
            return eventloop.poll().await.map_err(|e| e.to_string());
        }

        match tokio::time::timeout(self.connect_timeout, eventloop.poll()).await {
            Ok(polled) => polled.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "connection attempt timed out after {} ms",
                self.connect_timeout.as_millis()
            )),
        }
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    warn!("Broker refused connection: {:?}", ack.code);
                    return Flow::Continue;
                }
                info!("Connected to MQTT broker");
                self.attempt = 0;
                self.publisher.connected();
                self.resubscribe().await;
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let message = InboundMessage::from_publish(&publish, Local::now());
                if self.publisher.is_connected() {
                    self.process(message);
                } else {
                    debug!("Dropping message received while disconnected: {}", message);
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker closed the connection");
                self.publisher.closed();
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                debug!("Disconnect sent");
                return Flow::Stop;
            }
            other => trace!("MQTT event: {:?}", other),
        }
        Flow::Continue
    }

    /// Re-issues every tracked topic as a single SUBSCRIBE request.
    async fn resubscribe(&self) {
        let topics = self.topics.read().await;
        if topics.is_empty() {
            return;
        }

        let filters = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), SUBSCRIBE_QOS));
        match self.client.try_subscribe_many(filters) {
            Ok(()) => debug!("Subscribe sent for {} topic(s)", topics.len()),
            Err(e) => warn!("Failed to resubscribe {} topic(s): {}", topics.len(), e),
        }
    }

    /// Classifies one message and merges accepted positions into the snapshot.
    fn process(&self, message: InboundMessage) {
        if !self.schema.is_position_topic(&message.topic) {
            debug!("Ignoring message on non-position topic: {}", message);
            return;
        }

        match self.schema.parse(&message.payload) {
            Ok(fix) => {
                debug!("GPS fix from {}: {:?}", message.topic, fix);
                self.publisher.apply_fix(
                    fix,
                    self.schema.fallback_device_id.as_deref(),
                    message.received_at,
                );
            }
            Err(e) => warn!("Dropping payload on {}: {} (raw: {})", message.topic, e, message.preview()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::state::ConnectionState;
    use rumqttc::{ConnAck, Publish};

    fn driver(publisher: StatePublisher) -> (SessionDriver, EventLoop) {
        driver_with(publisher, &["esp32/gps".to_string()], REQUEST_CAPACITY)
    }

    fn driver_with(
        publisher: StatePublisher,
        topics: &[String],
        capacity: usize,
    ) -> (SessionDriver, EventLoop) {
        let (client, eventloop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), capacity);
        let driver = SessionDriver {
            client,
            topics: Arc::new(RwLock::new(topics.iter().cloned().collect())),
            cancel: CancellationToken::new(),
            publisher,
            schema: PayloadSchema::default(),
            policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_millis(100),
            attempt: 3,
        };
        (driver, eventloop)
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)))
    }

    fn publish(topic: &str, payload: &str) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(topic, QoS::AtMostOnce, payload)))
    }

    #[tokio::test]
    async fn connack_marks_connected_and_resets_attempts() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver(publisher.clone());
        publisher.record_error("refused".to_string());

        assert_eq!(driver.handle_event(connack()).await, Flow::Continue);

        let snapshot = publisher.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.connection_error, None);
        assert_eq!(driver.attempt, 0);
    }

    #[tokio::test]
    async fn connack_resubscribes_every_topic_in_one_request() {
        let publisher = StatePublisher::new();
        let topics: Vec<String> = (0..20).map(|i| format!("fleet/{}/gps", i)).collect();
        let (mut driver, _eventloop) = driver_with(publisher, &topics, 2);

        driver.handle_event(connack()).await;

        // One slot taken by the batched SUBSCRIBE, one left
        let client = driver.client.clone();
        assert!(client.try_subscribe("extra", QoS::AtMostOnce).is_ok());
        assert!(client.try_subscribe("overflow", QoS::AtMostOnce).is_err());
    }

    #[tokio::test]
    async fn connack_without_topics_queues_nothing() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver_with(publisher, &[], 1);

        driver.handle_event(connack()).await;

        assert!(driver.client.try_subscribe("extra", QoS::AtMostOnce).is_ok());
    }

    #[tokio::test]
    async fn offline_subscription_is_sent_with_next_connack() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver_with(publisher.clone(), &[], 1);
        let topics = driver.topics.clone();
        let client = driver.client.clone();

        track_subscription(&topics, &client, &publisher, "esp32/gps")
            .await
            .unwrap();
        assert!(topics.read().await.contains("esp32/gps"));

        // Nothing queued while offline, the ConnAck fills the single slot
        driver.handle_event(connack()).await;
        assert!(client.try_subscribe("extra", QoS::AtMostOnce).is_err());
    }

    #[tokio::test]
    async fn online_subscription_is_sent_immediately() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver_with(publisher.clone(), &[], 1);
        driver.handle_event(connack()).await;
        let topics = driver.topics.clone();
        let client = driver.client.clone();

        track_subscription(&topics, &client, &publisher, "esp32/gps")
            .await
            .unwrap();

        assert!(client.try_subscribe("extra", QoS::AtMostOnce).is_err());
        // Re-subscribing a known topic sends nothing
        track_subscription(&topics, &client, &publisher, "esp32/gps")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gps_publish_updates_position() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver(publisher.clone());
        driver.handle_event(connack()).await;

        driver
            .handle_event(publish("esp32/gps", r#"{"lat":43.29,"lng":5.36}"#))
            .await;

        let snapshot = publisher.snapshot();
        let position = snapshot.last_position.unwrap();
        assert_eq!((position.latitude, position.longitude), (43.29, 5.36));
        assert_eq!(snapshot.device_id.as_deref(), Some("ESP32-NetBox"));
        assert!(snapshot.last_update.is_some());
    }

    #[tokio::test]
    async fn non_gps_topic_never_moves_position() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver(publisher.clone());
        driver.handle_event(connack()).await;

        driver
            .handle_event(publish("esp32/detection", r#"{"lat":1.0,"lng":2.0}"#))
            .await;

        assert_eq!(publisher.snapshot().last_position, None);
    }

    #[tokio::test]
    async fn malformed_payload_leaves_state_untouched() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver(publisher.clone());
        driver.handle_event(connack()).await;
        driver
            .handle_event(publish("esp32/gps", r#"{"lat":1.0,"lng":2.0,"speed":3}"#))
            .await;
        let before = publisher.snapshot();

        driver.handle_event(publish("esp32/gps", "{not json")).await;
        driver.handle_event(publish("esp32/gps", r#"{"foo":1}"#)).await;

        assert_eq!(publisher.snapshot(), before);
    }

    #[tokio::test]
    async fn messages_before_connack_are_ignored() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver(publisher.clone());

        driver
            .handle_event(publish("esp32/gps", r#"{"lat":1.0,"lng":2.0}"#))
            .await;

        assert_eq!(publisher.snapshot().last_position, None);
    }

    #[tokio::test]
    async fn broker_disconnect_clears_connected_flag_only() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver(publisher.clone());
        driver.handle_event(connack()).await;
        driver
            .handle_event(publish("esp32/gps", r#"{"lat":1.0,"lng":2.0}"#))
            .await;

        driver
            .handle_event(Event::Incoming(Packet::Disconnect))
            .await;

        let snapshot = publisher.snapshot();
        assert!(!snapshot.connected);
        assert!(snapshot.last_position.is_some());
    }

    #[tokio::test]
    async fn outgoing_disconnect_stops_the_loop() {
        let publisher = StatePublisher::new();
        let (mut driver, _eventloop) = driver(publisher);

        assert_eq!(
            driver.handle_event(Event::Outgoing(Outgoing::Disconnect)).await,
            Flow::Stop
        );
    }

    #[tokio::test]
    async fn unreachable_broker_gives_up_after_max_retries() {
        let publisher = StatePublisher::new();
        let target = BrokerTarget::resolve(
            "127.0.0.1:1",
            &Default::default(),
            TransportKind::Plain,
        )
        .unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let (session, eventloop) = MqttSession::create(target, &MqttConfig::default(), active.clone());

        let policy = ReconnectPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 20,
            multiplier: 2.0,
            max_retries: Some(2),
        };
        let running = session.start(
            eventloop,
            publisher.clone(),
            PayloadSchema::default(),
            policy,
            Duration::from_millis(500),
        );

        let mut rx = publisher.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|s| s.connection_state == ConnectionState::Failed),
        )
        .await
        .expect("session should give up")
        .unwrap();

        let snapshot = publisher.snapshot();
        assert!(!snapshot.connected);
        assert!(snapshot.connection_error.is_some());

        running.shutdown(false).await;
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn silent_broker_hits_the_connect_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold every socket without ever answering CONNECT
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let publisher = StatePublisher::new();
        let target = BrokerTarget::resolve(
            &format!("127.0.0.1:{}", port),
            &Default::default(),
            TransportKind::Plain,
        )
        .unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let (session, eventloop) = MqttSession::create(target, &MqttConfig::default(), active.clone());
        let policy = ReconnectPolicy {
            max_retries: Some(0),
            ..Default::default()
        };
        let running = session.start(
            eventloop,
            publisher.clone(),
            PayloadSchema::default(),
            policy,
            Duration::from_millis(200),
        );

        let mut rx = publisher.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|s| s.connection_state == ConnectionState::Failed),
        )
        .await
        .expect("connect attempt should time out")
        .unwrap();

        let error = publisher.snapshot().connection_error.unwrap();
        assert!(error.contains("timed out"), "unexpected error: {}", error);

        running.shutdown(false).await;
        silent.abort();
    }
}
