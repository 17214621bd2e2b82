use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 8765;

/// Listener settings. Fixed once the server loop has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub bind_port: u16,
    /// Upper bound for a single frame payload and for a reassembled message.
    pub max_message_size: usize,
    /// Connections still in the opening handshake after this long are dropped.
    pub handshake_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub backlog: i32,
    /// Slots in the ring buffer used by `DeliveryQueue`.
    pub delivery_capacity: usize,
    /// Core the I/O thread is pinned to, if any.
    pub io_core: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_PORT,
            max_message_size: 16 * 1024 * 1024,
            handshake_timeout: Some(Duration::from_secs(10)),
            read_buffer_size: 4096,
            backlog: 128,
            delivery_capacity: 4096,
            io_core: None,
        }
    }
}

impl ServerConfig {
    /// Builds a config from the two scalar fields the add-on UI exposes.
    pub fn new(bind_address: &str, bind_port: u16) -> Result<Self, ConfigError> {
        let bind_address = bind_address
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::InvalidAddress(bind_address.to_string()))?;
        let bind_port = check_port(bind_port)?;
        Ok(Self {
            bind_address,
            bind_port,
            ..Self::default()
        })
    }

    /// Reads `WS_*` variables from the process environment, falling back to
    /// defaults for anything unset. Call `dotenv::dotenv()` first to pick up
    /// a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("WS_BIND_ADDRESS") {
            config.bind_address = addr
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(addr.clone()))?;
        }
        if let Some(port) = lookup("WS_BIND_PORT") {
            let parsed = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
            config.bind_port = check_port(parsed)?;
        }
        if let Some(size) = lookup("WS_MAX_MESSAGE_SIZE") {
            config.max_message_size = parse_number("WS_MAX_MESSAGE_SIZE", &size)?;
        }
        if let Some(secs) = lookup("WS_HANDSHAKE_TIMEOUT_SECS") {
            let secs: u64 = parse_number("WS_HANDSHAKE_TIMEOUT_SECS", &secs)?;
            config.handshake_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(core) = lookup("WS_IO_CORE") {
            config.io_core = Some(parse_number("WS_IO_CORE", &core)?);
        }

        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }
}

fn check_port(port: u16) -> Result<u16, ConfigError> {
    // 0 lets the OS pick; otherwise stay out of the privileged range.
    if port == 0 || port >= 1024 {
        Ok(port)
    } else {
        Err(ConfigError::InvalidPort(port.to_string()))
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_string(),
    })
}
