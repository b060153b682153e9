//! Proxy configuration, loaded from a YAML file.

use std::net::{SocketAddr, ToSocketAddrs};

use serde::Deserialize;

fn default_autoreconnect() -> bool {
    true
}

fn default_max_clients() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the proxy listens on for game clients.
    pub bind_address: String,
    /// The real login server.
    pub server_address: String,

    pub username: String,
    pub password: String,
    #[serde(default)]
    pub server_index: u16,
    #[serde(default)]
    pub character_index: u32,

    /// Rebuild the upstream session transparently after a link drop.
    #[serde(default = "default_autoreconnect")]
    pub autoreconnect: bool,
    /// Keep the session running with no clients attached.
    #[serde(default)]
    pub background: bool,
    /// Attached clients per session.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// env_logger filter string, e.g. "info" or "moongate=debug".
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn bind_addr(&self) -> std::io::Result<SocketAddr> {
        resolve(&self.bind_address)
    }

    pub fn server_addr(&self) -> std::io::Result<SocketAddr> {
        resolve(&self.server_address)
    }
}

fn resolve(address: &str) -> std::io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Address lookup for {address} returned nothing"),
        )
    })
}

pub fn load_config(path: &str) -> std::io::Result<Config> {
    let config_str = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not read config file {path}: {e}"),
            ));
        }
    };

    let config = match serde_yaml::from_str::<Config>(&config_str) {
        Ok(c) => c,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse config file {path} as config YAML: {e}"),
            ));
        }
    };

    if config.username.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "username must not be empty",
        ));
    }
    if config.max_clients == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "max_clients must be at least 1",
        ));
    }

    Ok(config)
}
