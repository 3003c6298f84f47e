//! Shared configuration of the utility binaries.

use serde_derive::{Deserialize, Serialize};
use uastack::channel::ConnectionConfig;
use uastack::tcp::TcpConfig;

/// Configuration of the demo echo server, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    pub tcp: TcpConfig,
    pub channel: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: uabase::DEFAULT_PORT,
            tcp: TcpConfig::default(),
            channel: ConnectionConfig::default(),
        }
    }
}
