use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::payload::PayloadSchema;
use super::transport::TransportKind;

/// Manager-wide MQTT settings.
///
/// Loaded from the `[mqtt]` table of the configuration file. Everything here
/// applies to every session the manager opens; per-connection overrides go
/// through [`ConnectOptions`].
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// Prefix of the generated client id, a random suffix is appended
    pub client_id_prefix: String,
    /// MQTT keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Upper bound for a single connection attempt
    pub connect_timeout_ms: u64,
    /// Transport used when neither the options nor the address name one
    pub default_transport: TransportKind,
    /// Capacity of the handle -> manager command queue
    pub command_buffer: usize,
    /// Default reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Field mapping for GPS payloads
    pub payload: PayloadSchema,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "navwatch".to_string(),
            keep_alive_secs: 60,
            connect_timeout_ms: 5000,
            default_transport: TransportKind::Plain,
            command_buffer: 32,
            reconnect: ReconnectPolicy::default(),
            payload: PayloadSchema::default(),
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Capped exponential backoff between reconnection attempts.
///
/// `attempt` counts consecutive failures starting at 1. The delay grows by
/// `multiplier` per failure until it reaches `max_delay_ms`. With
/// `max_retries` set the session gives up once that many retries were spent.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 3000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt`, `None` once the session should give up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if attempt > max {
                return None;
            }
        }

        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);

        Some(Duration::from_millis(delay_ms as u64))
    }
}

/// Per-connection options passed to `connect`.
///
/// Every field overrides whatever the address string or the manager
/// defaults would otherwise select.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectOptions {
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: Option<TransportKind>,
    pub reconnect: Option<ReconnectPolicy>,
}
