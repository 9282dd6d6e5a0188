use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration settings for a `meshbus` process.
///
/// Every section has defaults, so a process can start with no configuration
/// file at all; missing keys are filled from `Settings::default()`.
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub publisher: PublisherSettings,
    pub discovery: DiscoverySettings,
    pub logging: LoggingSettings,
}

/// Where the broker's WebSocket server binds.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Operational limits of the broker.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerSettings {
    pub max_connections: usize,
}

/// Client-side settings shared by the publisher and consumer.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PublisherSettings {
    /// WebSocket URL of the broker, e.g. `ws://messaging:8080`.
    pub broker_url: String,
    /// Name this process registers under.
    pub service_name: String,
    /// Delay before each reconnect attempt; the attempt count is the length.
    pub reconnect_delays_ms: Vec<u64>,
    pub invocation_timeout_ms: u64,
}

impl PublisherSettings {
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Base URL of the discovery authority. Paths such as `/discover/{name}`
    /// are resolved relative to it.
    pub base_url: String,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub registration: RegistrationSettings,
    /// Static topology used instead of, or in front of, the authority.
    pub predefined: Vec<PredefinedService>,
}

impl DiscoverySettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// How this process announces itself to the discovery authority.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RegistrationSettings {
    pub auto_register: bool,
    pub service_name: String,
    pub version: String,
    pub base_url: String,
    pub environment: String,
    pub weight: u32,
    pub tags: HashMap<String, String>,
    pub enable_health_check: bool,
    pub health_check_path: String,
    pub health_check_interval_secs: u64,
}

/// An operator-defined endpoint that never expires from the cache.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PredefinedService {
    pub service_name: String,
    pub base_url: String,
    #[serde(default = "default_version")]
    pub version: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

fn default_version() -> String {
    "v1".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            broker_url: "ws://127.0.0.1:8080".to_string(),
            service_name: "unnamed-service".to_string(),
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            invocation_timeout_ms: 30_000,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5100".to_string(),
            cache_ttl_secs: 300,
            request_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            registration: RegistrationSettings::default(),
            predefined: Vec::new(),
        }
    }
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            auto_register: false,
            service_name: String::new(),
            version: default_version(),
            base_url: String::new(),
            environment: "Development".to_string(),
            weight: 100,
            tags: HashMap::new(),
            enable_health_check: true,
            health_check_path: "/health".to_string(),
            health_check_interval_secs: 30,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
