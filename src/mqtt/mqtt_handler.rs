//! Connection manager and its public handle
//!
//! The [`ConnectionManager`] owns at most one running [`MqttSession`] and is
//! driven by a single tokio task. Callers talk to it through [`MqttHandle`],
//! which validates requests, enqueues them and returns immediately:
//!
//! ```text
//! MqttHandle ─[ManagerCommand]→ ConnectionManager ─► MqttSession<Running> ─► rumqttc EventLoop
//!    ▲          (mpsc)                                        │
//!    └──────────── watch::Receiver<TelemetrySnapshot> ◄───────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::config::{ConnectOptions, MqttConfig, ReconnectPolicy};
use super::error::MqttError;
use super::session::{MqttSession, Running};
use super::state::{StatePublisher, TelemetrySnapshot};
use super::transport::BrokerTarget;

#[derive(Debug)]
pub enum ManagerCommand {
    Connect {
        target: BrokerTarget,
        reconnect: Option<ReconnectPolicy>,
    },
    Disconnect,
    Subscribe(String),
    Unsubscribe(String),
}

/// Single owner of the live broker session.
pub struct ConnectionManager {
    config: MqttConfig,
    publisher: StatePublisher,
    session: Option<MqttSession<Running>>,
    active_loops: Arc<AtomicUsize>,
}

impl ConnectionManager {
    pub fn new(config: MqttConfig, publisher: StatePublisher) -> Self {
        Self {
            config,
            publisher,
            session: None,
            active_loops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publisher(&self) -> &StatePublisher {
        &self.publisher
    }

    /// Number of event loops currently alive
    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    pub async fn handle_command(&mut self, command: ManagerCommand) {
        debug!("Handling manager command: {:?}", command);
        match command {
            ManagerCommand::Connect { target, reconnect } => self.connect(target, reconnect).await,
            ManagerCommand::Disconnect => self.disconnect().await,
            ManagerCommand::Subscribe(topic) => self.subscribe(&topic).await,
            ManagerCommand::Unsubscribe(topic) => self.unsubscribe(&topic).await,
        }
    }

    /// Replaces any live session with a new one for `target`.
    pub async fn connect(&mut self, target: BrokerTarget, reconnect: Option<ReconnectPolicy>) {
        if self.teardown().await {
            info!("Closed previous connection before connecting to {}", target);
        }

        info!("Connecting to MQTT broker {}", target);
        let (session, eventloop) =
            MqttSession::create(target, &self.config, self.active_loops.clone());
        let session = session.start(
            eventloop,
            self.publisher.clone(),
            self.config.payload.clone(),
            reconnect.unwrap_or_else(|| self.config.reconnect.clone()),
            self.config.connect_timeout(),
        );
        self.session = Some(session);
    }

    /// Closes the live session, if any, and clears connection state.
    pub async fn disconnect(&mut self) {
        if self.teardown().await {
            info!("Disconnected from MQTT broker");
        } else {
            debug!("Disconnect requested without an active connection");
        }
        self.publisher.reset_connection();
    }

    pub async fn subscribe(&mut self, topic: &str) {
        let Some(session) = &self.session else {
            warn!("Cannot subscribe to {}: no active MQTT connection", topic);
            return;
        };
        if let Err(e) = session.subscribe(topic, &self.publisher).await {
            error!("Error subscribing to {}: {}", topic, e);
        }
    }

    pub async fn unsubscribe(&mut self, topic: &str) {
        let Some(session) = &self.session else {
            warn!("Cannot unsubscribe from {}: no active MQTT connection", topic);
            return;
        };
        if let Err(e) = session.unsubscribe(topic, &self.publisher).await {
            error!("Error unsubscribing from {}: {}", topic, e);
        }
    }

    async fn teardown(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        debug!("Tearing down session for {}", session.target());
        session.shutdown(self.publisher.is_connected()).await;
        true
    }

    async fn run(mut self, mut commands: mpsc::Receiver<ManagerCommand>) {
        info!("MQTT connection manager started");
        while let Some(command) = commands.recv().await {
            self.handle_command(command).await;
        }

        info!("All MQTT handles dropped, shutting down connection manager");
        self.disconnect().await;
    }
}

/// Cheap, cloneable front end of the connection manager.
///
/// Every operation returns as soon as the request is queued; results show up
/// in the snapshot returned by [`watch_state`](Self::watch_state).
#[derive(Clone, Debug)]
pub struct MqttHandle {
    commands: mpsc::Sender<ManagerCommand>,
    state: watch::Receiver<TelemetrySnapshot>,
    config: Arc<MqttConfig>,
}

impl MqttHandle {
    /// Spawns the manager task. Must be called inside a tokio runtime.
    pub fn spawn(config: MqttConfig) -> Self {
        let publisher = StatePublisher::new();
        let state = publisher.subscribe();
        let (commands, receiver) = mpsc::channel(config.command_buffer.max(1));

        let manager = ConnectionManager::new(config.clone(), publisher);
        tokio::spawn(manager.run(receiver));

        Self {
            commands,
            state,
            config: Arc::new(config),
        }
    }

    pub fn connect(&self, address: &str, options: ConnectOptions) -> Result<(), MqttError> {
        let target = BrokerTarget::resolve(address, &options, self.config.default_transport)?;
        debug!("Resolved {} to {:?}", address, target);
        self.send(ManagerCommand::Connect {
            target,
            reconnect: options.reconnect,
        })
    }

    pub fn disconnect(&self) -> Result<(), MqttError> {
        self.send(ManagerCommand::Disconnect)
    }

    pub fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.send(ManagerCommand::Subscribe(validate_topic(topic)?))
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.send(ManagerCommand::Unsubscribe(validate_topic(topic)?))
    }

    pub fn watch_state(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state.borrow().clone()
    }

    fn send(&self, command: ManagerCommand) -> Result<(), MqttError> {
        self.commands
            .try_send(command)
            .map_err(|e| MqttError::ChannelError(e.to_string()))
    }
}

fn validate_topic(topic: &str) -> Result<String, MqttError> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(MqttError::InvalidTopic("topic is empty".to_string()));
    }
    Ok(topic.to_string())
}
