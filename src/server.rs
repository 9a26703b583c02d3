use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::ConfigManager;
use crate::node::NodeError;

/// Config key that supplies an api key to servers which do not set one.
pub const API_KEY_CONFIG: &str = "DEEPSTACK_API_KEY";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Connection details for a DeepStack server.
#[derive(Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub protocol: Protocol,
    pub hostname: String,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Request timeout in seconds. Requests never time out when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ServerConfig {
    fn default_port() -> u16 {
        80
    }

    pub fn new(protocol: Protocol, hostname: &str, port: u16) -> Self {
        Self {
            protocol,
            hostname: hostname.to_string(),
            port,
            api_key: None,
            timeout_secs: None,
        }
    }

    /// Build a server config from a base url such as `http://localhost:5000`.
    pub fn from_url(url: &Url) -> Result<Self, NodeError> {
        let protocol = match url.scheme() {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            other => {
                return Err(NodeError::InvalidConfig(format!(
                    "unsupported protocol `{other}`"
                )));
            }
        };
        let hostname = url
            .host_str()
            .ok_or_else(|| NodeError::InvalidConfig(format!("no host in `{url}`")))?;
        let port = url.port_or_known_default().unwrap_or(Self::default_port());
        Ok(Self::new(protocol, hostname, port))
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.hostname, self.port)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print the api key
        f.debug_struct("ServerConfig")
            .field("protocol", &self.protocol)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Named server configs, looked up by the `server` field of a node.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: DashMap<String, ServerConfig>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(servers: HashMap<String, ServerConfig>) -> Self {
        let registry = Self::new();
        for (name, server) in servers {
            registry.register(&name, server);
        }
        registry
    }

    pub fn register(&self, name: &str, server: ServerConfig) {
        self.servers.insert(name.to_string(), server);
    }

    pub fn resolve(&self, name: &str) -> Result<ServerConfig, NodeError> {
        self.servers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NodeError::ServerNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Fill in `api_key` from [`API_KEY_CONFIG`] for every server that lacks one.
    pub async fn apply_config(&self, config: &ConfigManager) {
        let Some(api_key) = config.0.get(API_KEY_CONFIG).await else {
            return;
        };
        for mut entry in self.servers.iter_mut() {
            if entry.api_key.is_none() {
                entry.api_key = Some(api_key.clone());
            }
        }
    }
}
