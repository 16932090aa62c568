use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::server::ServerOptions;
use crate::store::DEFAULT_EVENT_CAPACITY;
use crate::transport::http::HttpTransportOptions;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSection {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSection {
    pub bind: String,
    pub path: String,
    pub sessions: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub event_buffer_capacity: usize,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            path: "/mcp".to_string(),
            sessions: true,
            allowed_origins: Vec::new(),
            allowed_hosts: Vec::new(),
            event_buffer_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Settings for the `mcp-server` binary. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerSection,
    pub http: HttpSection,
    /// How long a handler waits for the client to answer an elicitation or sampling request.
    pub client_request_timeout_ms: Option<u64>,
}

impl Config {
    pub fn load_config(path: &str) -> anyhow::Result<Config> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn server_options(&self) -> ServerOptions {
        let mut options = ServerOptions::new(&self.server.name, &self.server.version);
        if let Some(instructions) = &self.server.instructions {
            options = options.instructions(instructions.clone());
        }
        if let Some(ms) = self.client_request_timeout_ms {
            options = options.client_request_timeout(Duration::from_millis(ms));
        }
        options
    }

    pub fn http_options(&self) -> HttpTransportOptions {
        HttpTransportOptions {
            path: self.http.path.clone(),
            sessions: self.http.sessions,
            allowed_origins: self.http.allowed_origins.clone(),
            allowed_hosts: self.http.allowed_hosts.clone(),
            event_buffer_capacity: self.http.event_buffer_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_load_config() {
        let tmp_dir = tempdir().unwrap();
        let config_path = tmp_dir.path().join("config.json");
        let mut file = File::create(&config_path).unwrap();
        let json = r#"
        {
            "server": { "name": "notes", "version": "2.0.0" },
            "http": {
                "bind": "0.0.0.0:8080",
                "allowedOrigins": ["https://app.example"],
                "eventBufferCapacity": 16
            },
            "clientRequestTimeoutMs": 1500
        }
        "#;
        file.write_all(json.as_bytes()).unwrap();

        let config = Config::load_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.name, "notes");
        assert_eq!(config.http.bind, "0.0.0.0:8080");
        assert_eq!(config.http.path, "/mcp");
        assert!(config.http.sessions);
        assert_eq!(config.client_request_timeout_ms, Some(1500));

        let http = config.http_options();
        assert_eq!(http.allowed_origins, vec!["https://app.example".to_string()]);
        assert_eq!(http.event_buffer_capacity, 16);
        assert_eq!(config.server_options().info.name, "notes");
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.http.event_buffer_capacity, DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("absent.json");
        assert!(Config::load_config(path.to_str().unwrap()).is_err());
    }
}
