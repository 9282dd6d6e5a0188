//! Records exchanged with the discovery authority. All JSON is camelCase.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{PredefinedService, RegistrationSettings};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default = "Utc::now")]
    pub last_checked: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked: Utc::now(),
            message: None,
        }
    }
}

/// A resolved service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    pub id: String,
    pub service_name: String,
    pub base_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub health: ServiceHealth,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl ServiceEndpoint {
    /// Endpoint for an operator-defined service: production, healthy, and
    /// identified by its name.
    pub fn predefined(service: &PredefinedService) -> Self {
        let now = Utc::now();
        Self {
            id: service.service_name.clone(),
            service_name: service.service_name.clone(),
            base_url: service.base_url.trim_end_matches('/').to_string(),
            version: service.version.clone(),
            environment: "Production".to_string(),
            weight: 100,
            tags: HashMap::new(),
            health: ServiceHealth {
                status: HealthStatus::Healthy,
                last_checked: now,
                message: None,
            },
            registered_at: now,
            last_updated: now,
        }
    }
}

/// Body of `POST /register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub service_name: String,
    pub version: String,
    pub base_url: String,
    pub environment: String,
    pub weight: u32,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub enable_health_check: bool,
    pub health_check_path: String,
    pub health_check_interval_seconds: u64,
}

impl From<&RegistrationSettings> for ServiceRegistration {
    fn from(settings: &RegistrationSettings) -> Self {
        Self {
            service_name: settings.service_name.clone(),
            version: settings.version.clone(),
            base_url: settings.base_url.clone(),
            environment: settings.environment.clone(),
            weight: settings.weight,
            tags: settings.tags.clone(),
            enable_health_check: settings.enable_health_check,
            health_check_path: settings.health_check_path.clone(),
            health_check_interval_seconds: settings.health_check_interval_secs,
        }
    }
}

/// Body of `POST /discover`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceQuery {
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default = "default_only_healthy")]
    pub only_healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
}

fn default_only_healthy() -> bool {
    true
}

impl ServiceQuery {
    /// Any instance of `service_name`, healthy or not.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            version: None,
            environment: None,
            only_healthy: false,
            tags: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn only_healthy(mut self) -> Self {
        self.only_healthy = true;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Whether a cached entry for the bare name might not satisfy this query.
    pub fn has_constraints(&self) -> bool {
        self.version.is_some()
            || self.environment.is_some()
            || self.only_healthy
            || self.tags.as_ref().is_some_and(|tags| !tags.is_empty())
    }

    /// Version and environment match, ignoring case. Unset fields match all.
    pub fn matches(&self, endpoint: &ServiceEndpoint) -> bool {
        let same = |wanted: &Option<String>, actual: &str| {
            wanted
                .as_deref()
                .is_none_or(|wanted| wanted.eq_ignore_ascii_case(actual))
        };
        same(&self.version, &endpoint.version) && same(&self.environment, &endpoint.environment)
    }
}
