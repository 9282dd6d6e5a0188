//! Service discovery: a TTL cache of resolved endpoints, the HTTP client for
//! the discovery authority, and the agent that registers this process.

pub mod cache;
pub mod client;
pub mod models;
pub mod registration;

pub use cache::ServiceCache;
pub use client::DiscoveryClient;
pub use models::{HealthStatus, ServiceEndpoint, ServiceHealth, ServiceQuery, ServiceRegistration};
pub use registration::RegistrationAgent;
