//! Uniform service registration and discovery over Consul, etcd and
//! ZooKeeper.
//!
//! A process initializes one registry at startup, registers itself with
//! health-check metadata, resolves peers by name at runtime, and
//! deregisters cleanly on shutdown:
//!
//! ```no_run
//! use service_registry::{init_and_register_service, ServiceRegistryConfig};
//!
//! # async fn run() -> Result<(), service_registry::RegistryError> {
//! let mut config = ServiceRegistryConfig::default();
//! config.registry.kind = "etcd".to_string();
//! config.service.name = "payments".to_string();
//! config.service.port = "8443".to_string();
//! config.setup_graceful_shutdown = true;
//!
//! let service_id = init_and_register_service(config).await?;
//! let url = service_registry::get_service_url("orders").await?;
//! # let _ = (service_id, url);
//! # Ok(())
//! # }
//! ```

pub mod duration;
pub mod error;
pub mod registry;
pub mod wrapper;

pub use error::RegistryError;
pub use registry::provider::get_registry;
pub use registry::{
    new_registry, Config, OptionValue, RegistryKind, ServiceInfo, ServiceRegistry,
};
pub use wrapper::{
    close_service_registry, deregister_service, generate_service_id, get_service_url,
    init_and_register_service, init_service_registry, register_service, setup_graceful_shutdown,
    HealthCheckSettings, RegistrySettings, ServiceRegistryConfig, ServiceSettings,
};
