//! HTTP client for the discovery authority.
//!
//! Lookups go through the [`ServiceCache`] first. When the authority cannot
//! answer (transport error or non-success status) the last known endpoint is
//! returned instead, with a warning. None of the public methods return an
//! error; failures are logged and reported as `None`, `false` or `[]`.

use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::config::DiscoverySettings;
use crate::discovery::cache::ServiceCache;
use crate::discovery::models::{ServiceEndpoint, ServiceQuery, ServiceRegistration};
use crate::utils::error::DiscoveryError;

const REGISTER_PATH: &str = "register";
const DISCOVER_PATH: &str = "discover";

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: Client,
    base_url: Url,
    cache: Arc<ServiceCache>,
}

impl DiscoveryClient {
    /// Build a client and seed the cache with the predefined services.
    pub fn new(settings: &DiscoverySettings) -> Result<Self, DiscoveryError> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        let client = Self::with_cache(
            &settings.base_url,
            http,
            Arc::new(ServiceCache::new(settings.cache_ttl())),
        )?;

        let seeded = client
            .cache
            .seed_permanent(settings.predefined.iter().map(ServiceEndpoint::predefined));
        if seeded > 0 {
            info!(services = seeded, "seeded predefined services");
        }
        Ok(client)
    }

    pub fn with_cache(
        base_url: &str,
        http: Client,
        cache: Arc<ServiceCache>,
    ) -> Result<Self, DiscoveryError> {
        let base_url =
            Url::parse(base_url).map_err(|e| DiscoveryError::Url(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(DiscoveryError::Url(format!("{base_url}: not a base URL")));
        }
        Ok(Self {
            http,
            base_url,
            cache,
        })
    }

    pub fn cache(&self) -> &Arc<ServiceCache> {
        &self.cache
    }

    /// `POST /register`. No retry.
    pub async fn register(&self, registration: &ServiceRegistration) -> Option<ServiceEndpoint> {
        let request = self.http.post(self.url(&[REGISTER_PATH])).json(registration);
        match fetch::<ServiceEndpoint>(request).await {
            Ok(endpoint) => {
                info!(
                    service = %registration.service_name,
                    service_id = %endpoint.id,
                    "service registered"
                );
                Some(endpoint)
            }
            Err(e) => {
                error!(service = %registration.service_name, error = %e, "failed to register service");
                None
            }
        }
    }

    /// `DELETE /{serviceId}`.
    pub async fn deregister(&self, service_id: &str) -> bool {
        let request = self.http.delete(self.url(&[service_id]));
        match send(request).await {
            Ok(()) => {
                info!(service_id, "service deregistered");
                true
            }
            Err(e) => {
                error!(service_id, error = %e, "failed to deregister service");
                false
            }
        }
    }

    /// Resolve `service_name`: fresh cache, then the authority, then the
    /// stale cache entry.
    pub async fn discover(&self, service_name: &str) -> Option<ServiceEndpoint> {
        if let Some(endpoint) = self.cache.get(service_name) {
            debug!(service = service_name, "cache hit");
            return Some(endpoint);
        }

        let request = self.http.get(self.url(&[DISCOVER_PATH, service_name]));
        match fetch::<ServiceEndpoint>(request).await {
            Ok(endpoint) => {
                debug!(service = service_name, base_url = %endpoint.base_url, "service discovered");
                self.cache.set(service_name, endpoint.clone());
                Some(endpoint)
            }
            Err(e) => {
                warn!(service = service_name, error = %e, "failed to discover service");
                self.stale(service_name, None)
            }
        }
    }

    /// `POST /discover` with a selection query. Queries with constraints skip
    /// the fresh cache; the result is cached under the query's service name.
    pub async fn discover_with(&self, query: &ServiceQuery) -> Option<ServiceEndpoint> {
        if !query.has_constraints() {
            return self.discover(&query.service_name).await;
        }

        let request = self.http.post(self.url(&[DISCOVER_PATH])).json(query);
        match fetch::<ServiceEndpoint>(request).await {
            Ok(endpoint) => {
                self.cache.set(&query.service_name, endpoint.clone());
                Some(endpoint)
            }
            Err(e) => {
                warn!(service = %query.service_name, error = %e, "failed to discover service with query");
                self.stale(&query.service_name, Some(query))
            }
        }
    }

    /// Every instance the authority knows for `service_name`. Never cached.
    pub async fn get_all_instances(&self, service_name: &str) -> Vec<ServiceEndpoint> {
        let request = self
            .http
            .get(self.url(&[DISCOVER_PATH, service_name, "instances"]));
        match fetch::<Vec<ServiceEndpoint>>(request).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(service = service_name, error = %e, "failed to get all instances");
                Vec::new()
            }
        }
    }

    /// `POST /{serviceId}/heartbeat`. Failures are expected while the
    /// authority is down and only logged at debug level.
    pub async fn send_heartbeat(&self, service_id: &str) -> bool {
        let request = self.http.post(self.url(&[service_id, "heartbeat"]));
        match send(request).await {
            Ok(()) => true,
            Err(e) => {
                debug!(service_id, error = %e, "heartbeat failed");
                false
            }
        }
    }

    /// Drop every cached endpoint, predefined ones included.
    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("discovery cache cleared");
    }

    fn stale(&self, service_name: &str, query: Option<&ServiceQuery>) -> Option<ServiceEndpoint> {
        let endpoint = self
            .cache
            .get_stale(service_name)
            .filter(|endpoint| query.is_none_or(|query| query.matches(endpoint)))?;
        let stale_for_ms = self
            .cache
            .expired_since(service_name)
            .map_or(0, |age| age.as_millis() as u64);
        warn!(
            service = service_name,
            base_url = %endpoint.base_url,
            stale_for_ms,
            "using stale cache entry"
        );
        Some(endpoint)
    }

    /// Append `segments` to the base URL, percent-encoding each one so a
    /// name containing `/`, `?` or `#` stays a single path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // checked in `with_cache`
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

async fn send(request: RequestBuilder) -> Result<(), DiscoveryError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::Status(status));
    }
    Ok(())
}

async fn fetch<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, DiscoveryError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::Status(status));
    }
    Ok(response.json::<T>().await?)
}
