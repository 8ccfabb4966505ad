use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Default port of the HTTP facade.
pub const DEFAULT_PORT: u16 = 7341;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Serve the `DELETE` endpoints.
    pub allow_flush: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_body_bytes: 4 * 1024 * 1024,
            allow_flush: true,
        }
    }
}
