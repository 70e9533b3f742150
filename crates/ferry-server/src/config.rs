//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the ferry backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the public listener (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8080`; `0` auto-assigns).
    pub port: u16,
    /// Filesystem path of the Unix socket receiving descriptor handoffs.
    pub socket_path: PathBuf,
    /// Group granted write access to the handoff socket (mode `0660`).
    /// `None` binds the socket owner-only (mode `0600`).
    pub socket_group: Option<String>,
    /// Seconds between outbound hello frames per connection.
    pub hello_interval_secs: u64,
}

impl ServerConfig {
    /// Outbound send period as a [`Duration`].
    pub fn hello_interval(&self) -> Duration {
        Duration::from_secs(self.hello_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            socket_path: PathBuf::from("/tmp/websocket.sock"),
            socket_group: Some("nobody".into()),
            hello_interval_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_host_and_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn default_socket_path() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/websocket.sock"));
    }

    #[test]
    fn default_socket_group_is_nobody() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.socket_group.as_deref(), Some("nobody"));
    }

    #[test]
    fn default_hello_interval() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.hello_interval(), Duration::from_secs(5));
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, cfg.host);
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.socket_path, cfg.socket_path);
        assert_eq!(back.socket_group, cfg.socket_group);
        assert_eq!(back.hello_interval_secs, cfg.hello_interval_secs);
    }

    #[test]
    fn deserialize_without_group() {
        let json = r#"{"host":"127.0.0.1","port":0,"socket_path":"/tmp/t.sock","socket_group":null,"hello_interval_secs":1}"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.socket_group, None);
        assert_eq!(cfg.hello_interval(), Duration::from_secs(1));
    }

    #[test]
    fn custom_values() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            socket_path: PathBuf::from("/run/ferry/handoff.sock"),
            socket_group: Some("www-data".into()),
            hello_interval_secs: 30,
        };
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.socket_group.as_deref(), Some("www-data"));
        assert_eq!(cfg.hello_interval(), Duration::from_secs(30));
    }
}
