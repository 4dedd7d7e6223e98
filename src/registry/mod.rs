pub mod consul;
pub mod etcd;
pub mod provider;
pub mod zookeeper;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RegistryError;

pub const DEFAULT_CONSUL_ADDRESS: &str = "localhost:8500";
pub const DEFAULT_ZOOKEEPER_ADDRESS: &str = "localhost:2181";
pub const DEFAULT_ETCD_ADDRESS: &str = "localhost:2379";

/// The kind of external coordination system backing the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    Consul,
    Zookeeper,
    Etcd,
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistryKind::Consul => "consul",
            RegistryKind::Zookeeper => "zookeeper",
            RegistryKind::Etcd => "etcd",
        };
        f.write_str(s)
    }
}

impl FromStr for RegistryKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consul" => Ok(RegistryKind::Consul),
            "zookeeper" => Ok(RegistryKind::Zookeeper),
            "etcd" => Ok(RegistryKind::Etcd),
            other => Err(RegistryError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// A value in the backend-specific option bag. Unknown keys are ignored by
/// every backend; recognized keys are documented on the backend modules.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    String(String),
    Bool(bool),
    List(Vec<String>),
}

impl OptionValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            OptionValue::List(list) => Some(list),
            _ => None,
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::String(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::String(s)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(list: Vec<String>) -> Self {
        OptionValue::List(list)
    }
}

/// Construction-time registry configuration. Immutable once a registry has
/// been created from it.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Address of the registry service, e.g. "localhost:8500" for Consul.
    pub address: String,

    /// Credentials; empty means unset.
    pub token: String,
    pub username: String,
    pub password: String,

    /// Backend-specific options.
    pub options: HashMap<String, OptionValue>,
}

impl Config {
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(OptionValue::as_str)
    }

    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(OptionValue::as_bool)
    }

    pub fn opt_list(&self, key: &str) -> Option<&[String]> {
        self.options.get(key).and_then(OptionValue::as_list)
    }
}

/// One registered service instance.
///
/// Serialized as JSON for the etcd and ZooKeeper backends; field names keep
/// the capitalized wire form so records written by older deployments decode
/// unchanged, and unknown fields are tolerated on read.
///
/// `check_url` drives an active HTTP health check and is only meaningful for
/// Consul; etcd and ZooKeeper ignore it and derive liveness from `check_ttl`
/// (lease expiry and session-bound ephemeral nodes respectively).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Meta")]
    pub meta: HashMap<String, String>,
    #[serde(rename = "CheckURL")]
    pub check_url: String,
    #[serde(rename = "CheckTTL")]
    pub check_ttl: String,
    #[serde(rename = "CheckInterval")]
    pub check_interval: String,
}

impl ServiceInfo {
    /// The instance URL, `<scheme>://<address>:<port>`, where the scheme is
    /// `meta["scheme"]` when present and non-empty, else "http".
    pub fn url(&self) -> String {
        let scheme = match self.meta.get("scheme") {
            Some(value) if !value.is_empty() => value.as_str(),
            _ => "http",
        };
        format!("{}://{}:{}", scheme, self.address, self.port)
    }

    pub(crate) fn validate(&self) -> Result<(), RegistryError> {
        if self.name.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service name cannot be empty".to_string(),
            ));
        }
        if self.id.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service id cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The registry contract shared by all backends.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Registers a service instance. Repeat registration of the same
    /// (name, id) pair is an upsert.
    async fn register(&self, service: ServiceInfo) -> Result<(), RegistryError>;

    /// Removes the instance identified by `service_id`.
    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError>;

    /// Returns the current instances of `service_name`. An empty list is a
    /// valid success; order is unspecified.
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError>;

    /// Returns the URL of the first instance of `service_name`. No selection
    /// policy beyond "first instance wins".
    async fn get_service_url(&self, service_name: &str) -> Result<String, RegistryError> {
        let instances = self.get_service(service_name).await?;
        match instances.first() {
            Some(instance) => {
                let url = instance.url();
                debug!(name = service_name, url = %url, "service url resolved");
                Ok(url)
            }
            None => {
                warn!(name = service_name, "no healthy instances found");
                Err(RegistryError::NoInstances(service_name.to_string()))
            }
        }
    }

    /// Releases backend resources. Idempotent.
    async fn close(&self) -> Result<(), RegistryError>;
}

/// Creates a registry of the given kind from `config`. The backend is probed
/// during construction; the returned registry is ready for use.
pub async fn new_registry(
    kind: RegistryKind,
    config: Config,
) -> Result<Arc<dyn ServiceRegistry>, RegistryError> {
    match kind {
        RegistryKind::Consul => Ok(Arc::new(consul::ConsulRegistry::new(config).await?)),
        RegistryKind::Zookeeper => Ok(Arc::new(zookeeper::ZookeeperRegistry::new(config).await?)),
        RegistryKind::Etcd => Ok(Arc::new(etcd::EtcdRegistry::new(config).await?)),
    }
}
