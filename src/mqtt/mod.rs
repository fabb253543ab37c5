//! # MQTT Ingestion Module
//!
//! Keeps navwatch attached to the ship's telemetry broker and turns raw GPS
//! publishes into a shared, read-only telemetry snapshot.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Manager settings, reconnect policy, connect options
//! ├── transport.rs        - Address parsing and transport/port resolution
//! ├── payload.rs          - GPS topic classification and field-mapping schema
//! ├── message_manager.rs  - Inbound message representation
//! ├── state.rs            - Telemetry snapshot and its single writer
//! ├── session.rs          - One broker session and its event loop
//! └── mqtt_handler.rs     - Connection manager task and public handle
//! ```
//!
//! ## Guarantees
//!
//! - At most one live broker connection; a new `connect` tears the old one
//!   down first and waits for its event loop to stop.
//! - `connected` is only true between a ConnAck and the next close or error.
//! - Unparseable payloads are logged and dropped, they never touch state.
//! - Reconnects use capped exponential backoff with an optional retry limit.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use navwatch::mqtt::{ConnectOptions, MqttConfig, MqttHandle};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let handle = MqttHandle::spawn(MqttConfig::default());
//! let mut state = handle.watch_state();
//!
//! handle.connect("ws://localhost:9001", ConnectOptions::default())?;
//! handle.subscribe("esp32/gps")?;
//!
//! while state.changed().await.is_ok() {
//!     if let Some(position) = &state.borrow().last_position {
//!         println!("{:.5} {:.5}", position.latitude, position.longitude);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod payload;
pub mod session;
pub mod state;
pub mod transport;

pub use config::{ConnectOptions, MqttConfig, ReconnectPolicy};
pub use error::MqttError;
pub use mqtt_handler::{ConnectionManager, MqttHandle};
pub use payload::{PayloadError, PayloadSchema, PositionFix, PositionShape};
pub use state::{ConnectionState, FixTime, PositionSample, StatePublisher, TelemetrySnapshot};
pub use transport::{BrokerTarget, TransportKind};
