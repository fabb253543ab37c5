//! Broker address resolution
//!
//! Turns a user supplied broker address (`host`, `host:port`,
//! `wss://host:port/path`, ...) plus the structured [`ConnectOptions`] into a
//! fully resolved [`BrokerTarget`].
//!
//! Precedence for every attribute is: explicit option, then whatever the
//! address string embeds, then the manager default.

use std::fmt;

use serde::{Deserialize, Serialize};
use percent_encoding::percent_decode_str;
use url::{Host, Url};

use super::config::ConnectOptions;
use super::error::MqttError;

const DEFAULT_WS_PATH: &str = "/mqtt";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// MQTT over plain TCP
    #[default]
    Plain,
    /// MQTT over TLS
    Secured,
    /// MQTT framed over WebSocket
    Socket,
    /// MQTT framed over WebSocket with TLS
    SecuredSocket,
}

impl TransportKind {
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Plain => 1883,
            TransportKind::Secured => 8883,
            TransportKind::Socket => 8083,
            TransportKind::SecuredSocket => 8084,
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::Plain => "mqtt",
            TransportKind::Secured => "mqtts",
            TransportKind::Socket => "ws",
            TransportKind::SecuredSocket => "wss",
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, TransportKind::Socket | TransportKind::SecuredSocket)
    }

    pub fn from_scheme(scheme: &str) -> Result<Self, MqttError> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(TransportKind::Plain),
            "mqtts" | "ssl" | "tls" => Ok(TransportKind::Secured),
            "ws" => Ok(TransportKind::Socket),
            "wss" => Ok(TransportKind::SecuredSocket),
            other => Err(MqttError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Fully resolved connection target.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    /// Request path, only meaningful for websocket transports
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerTarget {
    pub fn resolve(
        address: &str,
        options: &ConnectOptions,
        default_transport: TransportKind,
    ) -> Result<Self, MqttError> {
        let invalid = |reason: &str| MqttError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(invalid("address is empty"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, trimmed),
        };
        let scheme_transport = scheme.map(TransportKind::from_scheme).transpose()?;
        let transport = options
            .transport
            .or(scheme_transport)
            .unwrap_or(default_transport);

        // A neutral non-special scheme keeps `url` from eliding ports it
        // considers default for ws/wss.
        let parsed =
            Url::parse(&format!("mqtt://{rest}")).map_err(|e| invalid(&e.to_string()))?;

        let host = match parsed.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("missing host")),
        };

        let port = options
            .port
            .or(parsed.port())
            .unwrap_or_else(|| transport.default_port());
        if port == 0 {
            return Err(invalid("port 0 is not a valid broker port"));
        }

        let path = match parsed.path() {
            "" | "/" => DEFAULT_WS_PATH.to_string(),
            path => path.trim_end_matches('/').to_string(),
        };

        let decode = |raw: &str| {
            percent_decode_str(raw)
                .decode_utf8()
                .map(|decoded| decoded.into_owned())
                .map_err(|_| invalid("credentials are not valid UTF-8"))
        };
        let embedded_user = match parsed.username() {
            "" => None,
            user => Some(decode(user)?),
        };
        let embedded_password = parsed.password().map(decode).transpose()?;
        let username = options.username.clone().or(embedded_user);
        let password = options.password.clone().or(embedded_password);

        Ok(Self {
            transport,
            host,
            port,
            path,
            username,
            password,
        })
    }

    fn host_for_url(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Address handed to rumqttc: the bare host for TCP/TLS, the full URL for websockets.
    pub fn broker_addr(&self) -> String {
        if self.transport.is_websocket() {
            format!(
                "{}://{}:{}{}",
                self.transport.scheme(),
                self.host_for_url(),
                self.port,
                self.path
            )
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}",
            self.transport.scheme(),
            self.host_for_url(),
            self.port
        )?;
        if self.transport.is_websocket() {
            write!(f, "{}", self.path)?;
        }
        Ok(())
    }
}

// Credentials stay out of logs.
impl fmt::Debug for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BrokerTarget")
            .field("transport", &self.transport)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}
