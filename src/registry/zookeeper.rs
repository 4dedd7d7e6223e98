//! ZooKeeper-backed registry.
//!
//! Znodes mirror the etcd key layout: `/services/<name>/<id>` holding JSON.
//! A non-empty `check_ttl` makes the instance znode ephemeral; its lifetime
//! is then bound to the client session, which is the closest ZooKeeper
//! equivalent to a TTL check. The TTL value itself is only validated.
//!
//! Recognized options: `servers` (string list).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zookeeper_client as zk;

use crate::duration::parse_duration;
use crate::error::RegistryError;
use crate::registry::{
    Config, RegistryKind, ServiceInfo, ServiceRegistry, DEFAULT_ZOOKEEPER_ADDRESS,
};

const KIND: RegistryKind = RegistryKind::Zookeeper;
const BASE_PATH: &str = "/services";

pub struct ZookeeperRegistry {
    // Dropped on close(); the session ends with the last clone, which also
    // removes any ephemeral instance znodes.
    client: Mutex<Option<zk::Client>>,
}

fn service_path(service_name: &str) -> String {
    format!("{BASE_PATH}/{service_name}")
}

fn service_key(service_name: &str, service_id: &str) -> String {
    format!("{BASE_PATH}/{service_name}/{service_id}")
}

async fn ensure_node(client: &zk::Client, path: &str) -> Result<(), zk::Error> {
    let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
    match client.create(path, &[], &options).await {
        Ok(_) | Err(zk::Error::NodeExists) => Ok(()),
        Err(e) => Err(e),
    }
}

impl ZookeeperRegistry {
    pub async fn new(config: Config) -> Result<Self, RegistryError> {
        let servers: Vec<String> = match config.opt_list("servers") {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => {
                let address = if config.address.is_empty() {
                    DEFAULT_ZOOKEEPER_ADDRESS
                } else {
                    &config.address
                };
                vec![address.to_string()]
            }
        };
        let cluster = servers.join(",");

        let client = zk::Client::connector()
            .session_timeout(Duration::from_secs(5))
            .connect(&cluster)
            .await
            .map_err(|e| RegistryError::backend(KIND, "connect", e))?;

        if let Err(e) = ensure_node(&client, BASE_PATH).await {
            // Give the session back before surfacing the failure.
            drop(client);
            return Err(RegistryError::backend(KIND, "create base path", e));
        }
        info!(servers = %cluster, "connected to zookeeper service registry");

        Ok(Self {
            client: Mutex::new(Some(client)),
        })
    }

    async fn client(&self) -> Result<zk::Client, RegistryError> {
        let guard = self.client.lock().await;
        guard
            .clone()
            .ok_or_else(|| RegistryError::backend(KIND, "session", "session already closed"))
    }
}

#[async_trait]
impl ServiceRegistry for ZookeeperRegistry {
    async fn register(&self, service: ServiceInfo) -> Result<(), RegistryError> {
        service.validate()?;
        let ephemeral = !service.check_ttl.is_empty();
        if ephemeral {
            parse_duration(&service.check_ttl).map_err(RegistryError::InvalidInput)?;
        }

        let client = self.client().await?;
        ensure_node(&client, &service_path(&service.name))
            .await
            .map_err(|e| RegistryError::backend(KIND, "create service path", e))?;

        let key = service_key(&service.name, &service.id);
        let data = serde_json::to_vec(&service)
            .map_err(|e| RegistryError::backend(KIND, "encode service", e))?;

        let stat = client
            .check_stat(&key)
            .await
            .map_err(|e| RegistryError::backend(KIND, "stat service", e))?;
        match stat {
            Some(stat) => {
                // Upsert: replace the existing record in place.
                client
                    .set_data(&key, &data, Some(stat.version))
                    .await
                    .map_err(|e| RegistryError::backend(KIND, "update service", e))?;
            }
            None => {
                let mode = if ephemeral {
                    zk::CreateMode::Ephemeral
                } else {
                    zk::CreateMode::Persistent
                };
                client
                    .create(&key, &data, &mode.with_acls(zk::Acls::anyone_all()))
                    .await
                    .map_err(|e| RegistryError::backend(KIND, "create service", e))?;
            }
        }
        info!(name = %service.name, id = %service.id, ephemeral, "service registered with zookeeper");
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        if service_id.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service id cannot be empty".to_string(),
            ));
        }
        let client = self.client().await?;
        let names = client
            .list_children(BASE_PATH)
            .await
            .map_err(|e| RegistryError::backend(KIND, "list services", e))?;

        for name in names {
            let Ok(instances) = client.list_children(&service_path(&name)).await else {
                continue;
            };
            if instances.iter().any(|instance| instance == service_id) {
                let key = service_key(&name, service_id);
                return match client.delete(&key, None).await {
                    // A concurrent removal is a benign race.
                    Ok(()) | Err(zk::Error::NoNode) => {
                        info!(id = service_id, "service deregistered from zookeeper");
                        Ok(())
                    }
                    Err(e) => Err(RegistryError::backend(KIND, "delete service", e)),
                };
            }
        }
        Err(RegistryError::NotFound(service_id.to_string()))
    }

    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError> {
        if service_name.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service name cannot be empty".to_string(),
            ));
        }
        let client = self.client().await?;
        let instances = match client.list_children(&service_path(service_name)).await {
            Ok(children) => children,
            Err(zk::Error::NoNode) => return Ok(Vec::new()),
            Err(e) => return Err(RegistryError::backend(KIND, "list instances", e)),
        };

        let mut services = Vec::new();
        for instance in instances {
            let key = service_key(service_name, &instance);
            let Ok((data, _)) = client.get_data(&key).await else {
                continue;
            };
            let Ok(service) = serde_json::from_slice::<ServiceInfo>(&data) else {
                continue;
            };
            services.push(service);
        }
        debug!(
            name = service_name,
            count = services.len(),
            "zookeeper instances found"
        );
        Ok(services)
    }

    async fn close(&self) -> Result<(), RegistryError> {
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            info!("closing zookeeper service registry");
        }
        Ok(())
    }
}
