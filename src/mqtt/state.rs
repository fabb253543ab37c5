//! Shared telemetry state
//!
//! The connection manager is the only writer. Everything else holds a
//! `watch::Receiver<TelemetrySnapshot>` and re-reads on `changed()`.

use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::watch;
use tracing::debug;

use super::payload::PositionFix;
use super::transport::BrokerTarget;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

/// Most recent accepted position.
#[derive(Clone, Debug, PartialEq)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub device_id: Option<String>,
    pub captured_at: DateTime<Local>,
}

/// Date and time strings reported by the GPS receiver itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixTime {
    pub date: Option<String>,
    pub time: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetrySnapshot {
    /// True between a ConnAck and the next close/error
    pub connected: bool,
    pub connection_state: ConnectionState,
    /// Consecutive failed attempts of the current session
    pub reconnect_attempt: u32,
    /// Display form of the live broker target
    pub target: Option<String>,
    pub last_position: Option<PositionSample>,
    pub speed: Option<f64>,
    pub device_id: Option<String>,
    pub fix_time: Option<FixTime>,
    pub last_update: Option<DateTime<Local>>,
    pub connection_error: Option<String>,
}

/// Write side of the telemetry watch channel.
#[derive(Clone, Debug)]
pub struct StatePublisher {
    sender: Arc<watch::Sender<TelemetrySnapshot>>,
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatePublisher {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(TelemetrySnapshot::default());
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.sender.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.sender.borrow().connected
    }

    pub fn connecting(&self, target: &BrokerTarget) {
        self.sender.send_modify(|state| {
            state.connected = false;
            state.connection_state = ConnectionState::Connecting;
            state.reconnect_attempt = 0;
            state.target = Some(target.to_string());
            state.connection_error = None;
        });
    }

    pub fn connected(&self) {
        self.sender.send_modify(|state| {
            state.connected = true;
            state.connection_state = ConnectionState::Connected;
            state.reconnect_attempt = 0;
            state.connection_error = None;
        });
    }

    /// Handshake or transport failure. Position data is kept.
    pub fn record_error(&self, error: String) {
        self.sender.send_modify(|state| {
            state.connected = false;
            state.connection_error = Some(error);
        });
    }

    /// Connection closed without an error, the session will dial again.
    pub fn closed(&self) {
        self.sender.send_modify(|state| {
            state.connected = false;
            state.connection_state = ConnectionState::Connecting;
        });
    }

    pub fn reconnecting(&self, attempt: u32) {
        self.sender.send_modify(|state| {
            state.connected = false;
            state.connection_state = ConnectionState::Reconnecting;
            state.reconnect_attempt = attempt;
        });
    }

    pub fn gave_up(&self) {
        self.sender.send_modify(|state| {
            state.connected = false;
            state.connection_state = ConnectionState::Failed;
        });
    }

    /// Connection torn down on request. Clears connection fields only.
    pub fn reset_connection(&self) {
        self.sender.send_modify(|state| {
            state.connected = false;
            state.connection_state = ConnectionState::Disconnected;
            state.reconnect_attempt = 0;
            state.target = None;
            state.connection_error = None;
        });
    }

    /// Merges a parsed fix into the snapshot. Optional fields are sticky.
    pub fn apply_fix(
        &self,
        fix: PositionFix,
        fallback_device_id: Option<&str>,
        now: DateTime<Local>,
    ) {
        self.sender.send_modify(|state| {
            if fix.speed.is_some() {
                state.speed = fix.speed;
            }
            if let Some(device_id) = fix.device_id {
                state.device_id = Some(device_id);
            } else if state.device_id.is_none() {
                state.device_id = fallback_device_id.map(str::to_string);
            }
            if fix.date.is_some() || fix.time.is_some() {
                let fix_time = state.fix_time.get_or_insert_with(FixTime::default);
                if fix.date.is_some() {
                    fix_time.date = fix.date;
                }
                if fix.time.is_some() {
                    fix_time.time = fix.time;
                }
            }

            let position = PositionSample {
                latitude: fix.latitude,
                longitude: fix.longitude,
                speed: state.speed,
                device_id: state.device_id.clone(),
                captured_at: now,
            };
            debug!("Position updated: {:?}", position);
            state.last_position = Some(position);
            state.last_update = Some(now);
        });
    }
}
