//! Registers this process with the discovery authority, keeps the
//! registration alive with heartbeats and removes it on shutdown.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::config::DiscoverySettings;
use crate::discovery::client::DiscoveryClient;
use crate::discovery::models::ServiceRegistration;

pub struct RegistrationAgent {
    client: DiscoveryClient,
    registration: ServiceRegistration,
    enabled: bool,
    heartbeat_interval: Duration,
    service_id: Mutex<Option<String>>,
}

impl RegistrationAgent {
    pub fn new(client: DiscoveryClient, settings: &DiscoverySettings) -> Self {
        Self {
            client,
            registration: ServiceRegistration::from(&settings.registration),
            enabled: settings.registration.auto_register,
            heartbeat_interval: settings.heartbeat_interval(),
            service_id: Mutex::new(None),
        }
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Id assigned by the authority, once registered.
    pub fn service_id(&self) -> Option<String> {
        self.service_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register once. Returns whether this process is now registered.
    pub async fn start(&self) -> bool {
        if !self.enabled {
            info!("auto-registration disabled");
            return false;
        }

        match self.client.register(&self.registration).await {
            Some(endpoint) => {
                info!(service_id = %endpoint.id, "service auto-registered");
                *self.service_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.id);
                true
            }
            None => {
                error!(service = %self.registration.service_name, "failed to auto-register service");
                false
            }
        }
    }

    /// Send heartbeats until `cancel` fires. Returns at once when not
    /// registered.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(service_id) = self.service_id() else {
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
            }

            if self.client.send_heartbeat(&service_id).await {
                trace!(service_id, "heartbeat sent");
            } else {
                warn!(service_id, "heartbeat not acknowledged");
            }
        }
    }

    /// Deregister if registered.
    pub async fn stop(&self) -> bool {
        let service_id = self
            .service_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match service_id {
            Some(service_id) => self.client.deregister(&service_id).await,
            None => false,
        }
    }
}
