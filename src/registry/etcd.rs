//! etcd-backed registry.
//!
//! Records live under `/services/<name>/<id>` as JSON. A non-empty
//! `check_ttl` binds the record to a lease of that many whole seconds and
//! starts a keep-alive task; the record vanishes when the lease expires.
//! Re-registering the same (name, id) with a TTL grants a fresh lease and
//! keep-alive task; the superseded lease keeps being refreshed (detached
//! from any key) until close() cancels its task.
//!
//! Recognized options: `endpoints` (string list), `username`, `password`.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::duration::parse_duration;
use crate::error::RegistryError;
use crate::registry::{Config, RegistryKind, ServiceInfo, ServiceRegistry, DEFAULT_ETCD_ADDRESS};

const KIND: RegistryKind = RegistryKind::Etcd;
const SERVICES_PREFIX: &str = "/services/";

pub struct EtcdRegistry {
    // Dropped on close(); the gRPC channel ends with the last clone.
    client: Mutex<Option<Client>>,
    // Cancelled by close(); scopes every keep-alive task.
    cancel: CancellationToken,
}

impl EtcdRegistry {
    pub async fn new(config: Config) -> Result<Self, RegistryError> {
        let endpoints: Vec<String> = match config.opt_list("endpoints") {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => {
                let address = if config.address.is_empty() {
                    DEFAULT_ETCD_ADDRESS
                } else {
                    &config.address
                };
                vec![address.to_string()]
            }
        };

        let mut options = ConnectOptions::new().with_connect_timeout(Duration::from_secs(5));
        if let Some(username) = config.opt_str("username") {
            let password = config.opt_str("password").unwrap_or_default();
            options = options.with_user(username, password);
        }

        let client = Client::connect(&endpoints, Some(options))
            .await
            .map_err(|e| RegistryError::backend(KIND, "connect", e))?;
        info!(endpoints = ?endpoints, "connected to etcd service registry");

        Ok(Self {
            client: Mutex::new(Some(client)),
            cancel: CancellationToken::new(),
        })
    }

    async fn client(&self) -> Result<Client, RegistryError> {
        let guard = self.client.lock().await;
        guard
            .clone()
            .ok_or_else(|| RegistryError::backend(KIND, "connection", "client already closed"))
    }

    fn service_key(service_name: &str, service_id: &str) -> String {
        format!("{SERVICES_PREFIX}{service_name}/{service_id}")
    }

    fn spawn_keep_alive(
        &self,
        mut keeper: LeaseKeeper,
        mut stream: LeaseKeepAliveStream,
        ttl_secs: i64,
    ) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs((ttl_secs / 3).max(1) as u64);
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if keeper.keep_alive().await.is_err() {
                            debug!(lease = keeper.id(), "lease keep-alive request failed");
                            break;
                        }
                    }
                    response = stream.message() => {
                        match response {
                            Ok(Some(_)) => {}
                            Ok(None) => {
                                debug!(lease = keeper.id(), "lease keep-alive stream closed");
                                break;
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ServiceRegistry for EtcdRegistry {
    async fn register(&self, service: ServiceInfo) -> Result<(), RegistryError> {
        service.validate()?;
        let client = self.client().await?;
        let key = Self::service_key(&service.name, &service.id);
        let value = serde_json::to_string(&service)
            .map_err(|e| RegistryError::backend(KIND, "encode service", e))?;

        let mut lease_id = None;
        if !service.check_ttl.is_empty() {
            let ttl = parse_duration(&service.check_ttl).map_err(RegistryError::InvalidInput)?;
            let ttl_secs = ttl.as_secs() as i64;

            let mut lease = client.lease_client();
            let granted = lease
                .grant(ttl_secs, None)
                .await
                .map_err(|e| RegistryError::backend(KIND, "lease grant", e))?;
            let (keeper, stream) = lease
                .keep_alive(granted.id())
                .await
                .map_err(|e| RegistryError::backend(KIND, "lease keep-alive", e))?;
            self.spawn_keep_alive(keeper, stream, ttl_secs);
            lease_id = Some(granted.id());
        }

        let put_options = lease_id.map(|id| PutOptions::new().with_lease(id));
        let mut kv = client.kv_client();
        kv.put(key, value, put_options)
            .await
            .map_err(|e| RegistryError::backend(KIND, "put", e))?;
        info!(name = %service.name, id = %service.id, lease = ?lease_id, "service registered with etcd");
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        if service_id.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service id cannot be empty".to_string(),
            ));
        }
        // The id does not carry the service name, so scan the whole prefix
        // for a record with a matching id. Corrupt siblings are skipped.
        let client = self.client().await?;
        let mut kv = client.kv_client();
        let response = kv
            .get(SERVICES_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| RegistryError::backend(KIND, "list services", e))?;

        for entry in response.kvs() {
            let Ok(service) = serde_json::from_slice::<ServiceInfo>(entry.value()) else {
                continue;
            };
            if service.id == service_id {
                kv.delete(entry.key().to_vec(), None)
                    .await
                    .map_err(|e| RegistryError::backend(KIND, "delete", e))?;
                info!(id = service_id, "service deregistered from etcd");
                return Ok(());
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
        let prefix = format!("{SERVICES_PREFIX}{service_name}/");
        let mut kv = client.kv_client();
        let response = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| RegistryError::backend(KIND, "get service", e))?;

        let instances: Vec<ServiceInfo> = response
            .kvs()
            .iter()
            .filter_map(|entry| serde_json::from_slice(entry.value()).ok())
            .collect();
        debug!(
            name = service_name,
            count = instances.len(),
            "etcd instances found"
        );
        Ok(instances)
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.cancel.cancel();
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            info!("closing etcd service registry");
        }
        Ok(())
    }
}
