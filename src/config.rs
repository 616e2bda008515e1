//! Session configuration.

use crate::auth::AuthCredential;
use crate::error::{ControlError, Result};
use crate::events::EventType;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default control port of a local daemon.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Settings for one controller session.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The address to connect to.
    pub address: ConnectionAddress,
    /// Authentication credentials.
    pub auth: AuthCredential,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Events subscribed during startup. `STREAM` is added once
    /// bootstrap completes.
    pub events: Vec<EventType>,
    /// Capacity of the command and notification channels.
    pub channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            address: ConnectionAddress::default(),
            auth: AuthCredential::None,
            connect_timeout: Duration::from_secs(30),
            events: vec![
                EventType::StatusClient,
                EventType::Notice,
                EventType::Warn,
                EventType::Error,
            ],
            channel_capacity: 64,
        }
    }
}

impl ControllerConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection address.
    pub fn address(mut self, address: ConnectionAddress) -> Self {
        self.address = address;
        self
    }

    /// Connect to a TCP address.
    pub fn tcp(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.address = ConnectionAddress::Tcp(addr.into());
        self
    }

    /// Connect to a Unix socket.
    pub fn unix(mut self, path: impl Into<PathBuf>) -> Self {
        self.address = ConnectionAddress::Unix(path.into());
        self
    }

    /// Set authentication credentials.
    pub fn auth(mut self, auth: AuthCredential) -> Self {
        self.auth = auth;
        self
    }

    /// Set password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthCredential::Password(password.into());
        self
    }

    /// Set cookie file authentication.
    pub fn cookie_file(mut self, path: impl Into<String>) -> Self {
        self.auth = AuthCredential::CookieFile(path.into());
        self
    }

    /// Set safe cookie authentication.
    pub fn safe_cookie(mut self, cookie_path: impl Into<String>) -> Self {
        self.auth = AuthCredential::safe_cookie(cookie_path);
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replace the startup event list.
    pub fn events(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    /// Set the channel capacity (at least 1).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Event list used once bootstrap is complete.
    pub fn ready_events(&self) -> Vec<EventType> {
        let mut events = self.events.clone();
        if !events.contains(&EventType::Stream) {
            events.push(EventType::Stream);
        }
        events
    }
}

/// The address to connect to for the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAddress {
    /// TCP socket address.
    Tcp(SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Default for ConnectionAddress {
    fn default() -> Self {
        ConnectionAddress::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_CONTROL_PORT)))
    }
}

impl ConnectionAddress {
    /// Parse an address string.
    ///
    /// Supports:
    /// - `host:port` for TCP
    /// - `unix:/path/to/socket` for Unix sockets
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ControlError::ConfigurationError(
                    "Empty unix socket path".to_string(),
                ));
            }
            Ok(ConnectionAddress::Unix(PathBuf::from(path)))
        } else {
            s.parse::<SocketAddr>()
                .map(ConnectionAddress::Tcp)
                .map_err(|e| ControlError::ConfigurationError(format!("Invalid address '{}': {}", s, e)))
        }
    }
}

impl FromStr for ConnectionAddress {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        ConnectionAddress::parse(s)
    }
}

impl std::fmt::Display for ConnectionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionAddress::Tcp(addr) => write!(f, "{}", addr),
            ConnectionAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.address.to_string(), "127.0.0.1:9051");
        assert!(matches!(config.auth, AuthCredential::None));
        assert!(!config.events.contains(&EventType::Stream));
    }

    #[test]
    fn test_config_builder() {
        let config = ControllerConfig::new()
            .tcp(SocketAddr::from(([127, 0, 0, 1], 9151)))
            .password("mypassword")
            .connect_timeout(Duration::from_secs(10))
            .channel_capacity(0);

        assert_eq!(config.address.to_string(), "127.0.0.1:9151");
        assert!(matches!(config.auth, AuthCredential::Password(_)));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.channel_capacity, 1);
    }

    #[test]
    fn test_ready_events_add_stream_once() {
        let config = ControllerConfig::new().events([EventType::StatusClient]);
        assert_eq!(
            config.ready_events(),
            vec![EventType::StatusClient, EventType::Stream]
        );

        let config = config.events([EventType::Stream]);
        assert_eq!(config.ready_events(), vec![EventType::Stream]);
    }

    #[test]
    fn test_address_parsing() {
        let tcp: ConnectionAddress = "127.0.0.1:9051".parse().unwrap();
        assert!(matches!(tcp, ConnectionAddress::Tcp(_)));

        let unix = ConnectionAddress::parse("unix:/var/run/tor/control").unwrap();
        assert_eq!(unix.to_string(), "unix:/var/run/tor/control");

        assert!(ConnectionAddress::parse("unix:").is_err());
        assert!(ConnectionAddress::parse("localhost").is_err());
    }
}
