//! Service cache
//!
//! Maps a service name to its last resolved endpoint. Fresh reads honour the
//! TTL; the stale read returns the most recent endpoint regardless of age and
//! is only meant as a fallback when live resolution fails.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::discovery::models::ServiceEndpoint;

#[derive(Debug, Clone)]
struct CacheEntry {
    endpoint: ServiceEndpoint,
    // `None` never expires
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }

    fn expired_since(&self, now: Instant) -> Option<Duration> {
        self.expires_at
            .filter(|expires_at| now >= *expires_at)
            .map(|expires_at| now.duration_since(expires_at))
    }
}

#[derive(Debug)]
pub struct ServiceCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ServiceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a fresh endpoint. Returns the endpoint it replaced.
    pub fn set(&self, service_name: &str, endpoint: ServiceEndpoint) -> Option<ServiceEndpoint> {
        self.insert(service_name, endpoint, Instant::now().checked_add(self.ttl))
    }

    /// Store an endpoint that never expires.
    pub fn set_permanent(&self, service_name: &str, endpoint: ServiceEndpoint) -> Option<ServiceEndpoint> {
        self.insert(service_name, endpoint, None)
    }

    pub fn seed_permanent(&self, endpoints: impl IntoIterator<Item = ServiceEndpoint>) -> usize {
        let mut seeded = 0;
        for endpoint in endpoints {
            let service_name = endpoint.service_name.clone();
            self.set_permanent(&service_name, endpoint);
            seeded += 1;
        }
        seeded
    }

    /// The endpoint for `service_name` if it has not expired.
    pub fn get(&self, service_name: &str) -> Option<ServiceEndpoint> {
        let now = Instant::now();
        self.entries
            .get(service_name)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.endpoint.clone())
    }

    /// The most recent endpoint for `service_name`, expired or not.
    pub fn get_stale(&self, service_name: &str) -> Option<ServiceEndpoint> {
        self.entries
            .get(service_name)
            .map(|entry| entry.endpoint.clone())
    }

    /// How long ago the entry for `service_name` expired. `None` while it is
    /// fresh, permanent or absent.
    pub fn expired_since(&self, service_name: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(service_name)
            .and_then(|entry| entry.expired_since(now))
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(
        &self,
        service_name: &str,
        endpoint: ServiceEndpoint,
        expires_at: Option<Instant>,
    ) -> Option<ServiceEndpoint> {
        self.entries
            .insert(
                service_name.to_string(),
                CacheEntry {
                    endpoint,
                    expires_at,
                },
            )
            .map(|previous| previous.endpoint)
    }
}
