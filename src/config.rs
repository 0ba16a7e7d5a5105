use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use std::{fs, path::Path};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::operation_registry::GenerateFlags;
use crate::query_builder::{BuildOptions, IgnoredFields};
use crate::subscription_multiplexer::ReconnectPolicy;

/// Client settings, usually read from a YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// GraphQL endpoint for queries and mutations.
    pub url: String,
    /// Channel endpoint for subscriptions; derived from `url` when absent.
    #[serde(default)]
    pub socket_url: Option<String>,
    #[serde(default)]
    pub generate: GenerateConfig,
    /// Fields left out of generated selections, per type name.
    #[serde(default)]
    pub ignore: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: Option<u64>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GenerateConfig {
    pub queries: bool,
    pub mutations: bool,
    pub subscriptions: bool,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        GenerateConfig {
            queries: true,
            mutations: true,
            subscriptions: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub delay_ms: u64,
    pub max_attempts: Option<u32>,
    pub resubscribe: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            delay_ms: 1000,
            max_attempts: None,
            resubscribe: true,
        }
    }
}

fn default_heartbeat_ms() -> Option<u64> {
    Some(30_000)
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            socket_url: None,
            generate: GenerateConfig::default(),
            ignore: HashMap::new(),
            max_depth: None,
            request_timeout_ms: None,
            heartbeat_ms: default_heartbeat_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading client configuration");
        let content = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content)?;
        if config.url.trim().is_empty() {
            return Err(ClientError::Config("`url` must not be empty".to_string()));
        }
        Ok(config)
    }

    pub fn generate_flags(&self) -> GenerateFlags {
        GenerateFlags {
            queries: self.generate.queries,
            mutations: self.generate.mutations,
            subscriptions: self.generate.subscriptions,
        }
    }

    pub fn ignored_fields(&self) -> IgnoredFields {
        IgnoredFields::from(self.ignore.clone())
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            max_depth: self.max_depth,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_ms.map(Duration::from_millis)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect.delay_ms),
            max_attempts: self.reconnect.max_attempts,
            resubscribe: self.reconnect.resubscribe,
        }
    }

    /// The subscription endpoint, falling back to the `ws`/`wss` form of `url`.
    pub fn channel_url(&self) -> String {
        match &self.socket_url {
            Some(url) => url.clone(),
            None => http_to_ws_url(&self.url),
        }
    }
}

pub(crate) fn http_to_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}
