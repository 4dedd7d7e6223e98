//! Consul-backed registry speaking the agent HTTP API.
//!
//! Recognized options: `timeout` (duration string), `tls_enabled` (bool) and,
//! when TLS is on, `ca_file`, `cert_file`, `key_file` (paths) and
//! `insecure_skip_verify` (bool).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::duration::{format_duration, parse_duration};
use crate::error::RegistryError;
use crate::registry::{
    Config, RegistryKind, ServiceInfo, ServiceRegistry, DEFAULT_CONSUL_ADDRESS,
};

const KIND: RegistryKind = RegistryKind::Consul;
const DEFAULT_CHECK_TIMEOUT: &str = "5s";

pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Serialize)]
struct AgentServiceCheck {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(rename = "Interval", skip_serializing_if = "Option::is_none")]
    interval: Option<String>,
    #[serde(rename = "Timeout", skip_serializing_if = "Option::is_none")]
    timeout: Option<String>,
    #[serde(rename = "TLSSkipVerify", skip_serializing_if = "std::ops::Not::not")]
    tls_skip_verify: bool,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
}

#[derive(Serialize)]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<AgentServiceCheck>,
}

#[derive(Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Option<Vec<String>>,
    #[serde(rename = "Meta")]
    meta: Option<HashMap<String, String>>,
}

impl ConsulRegistry {
    pub async fn new(config: Config) -> Result<Self, RegistryError> {
        let address = if config.address.is_empty() {
            DEFAULT_CONSUL_ADDRESS
        } else {
            &config.address
        };
        let tls_enabled = config.opt_bool("tls_enabled").unwrap_or(false);
        let scheme = if tls_enabled { "https" } else { "http" };
        let base_url = format!("{scheme}://{address}/v1");

        let mut timeout = Duration::from_secs(5);
        if let Some(value) = config.opt_str("timeout") {
            if let Ok(parsed) = parse_duration(value) {
                if parsed > Duration::ZERO {
                    timeout = parsed;
                }
            }
        }

        let mut builder = reqwest::Client::builder().timeout(timeout).no_proxy();
        if tls_enabled {
            builder = Self::apply_tls(builder, &config)?;
        }
        let client = builder
            .build()
            .map_err(|e| RegistryError::backend(KIND, "build client", e))?;

        // Token set by the wrapper lands in the option bag.
        let token = if config.token.is_empty() {
            config.opt_str("token").unwrap_or_default().to_string()
        } else {
            config.token.clone()
        };

        let registry = Self {
            client,
            base_url,
            token,
        };
        registry.probe_agent().await?;
        info!(address, "connected to consul service registry");
        Ok(registry)
    }

    fn apply_tls(
        mut builder: reqwest::ClientBuilder,
        config: &Config,
    ) -> Result<reqwest::ClientBuilder, RegistryError> {
        if let Some(ca_file) = config.opt_str("ca_file") {
            if !ca_file.is_empty() {
                let pem = std::fs::read(ca_file)
                    .map_err(|e| RegistryError::backend(KIND, "read ca file", e))?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| RegistryError::backend(KIND, "parse ca file", e))?;
                builder = builder.add_root_certificate(cert);
            }
        }
        let cert_file = config.opt_str("cert_file").unwrap_or_default();
        let key_file = config.opt_str("key_file").unwrap_or_default();
        if !cert_file.is_empty() && !key_file.is_empty() {
            let mut pem = std::fs::read(cert_file)
                .map_err(|e| RegistryError::backend(KIND, "read client cert", e))?;
            let key = std::fs::read(key_file)
                .map_err(|e| RegistryError::backend(KIND, "read client key", e))?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| RegistryError::backend(KIND, "parse client identity", e))?;
            builder = builder.identity(identity);
        }
        if config.opt_bool("insecure_skip_verify").unwrap_or(false) {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, self.api_url(path));
        if !self.token.is_empty() {
            request = request.header("X-Consul-Token", &self.token);
        }
        request
    }

    async fn probe_agent(&self) -> Result<(), RegistryError> {
        let response = self
            .request(reqwest::Method::GET, "agent/self")
            .send()
            .await
            .map_err(|e| RegistryError::backend(KIND, "agent self probe", e))?;
        expect_success(response, "agent self probe").await?;
        Ok(())
    }

    fn build_check(service: &ServiceInfo) -> Option<AgentServiceCheck> {
        if !service.check_url.is_empty() {
            // TLS verification of the check target is always off, matching
            // the registration records written by earlier deployments.
            Some(AgentServiceCheck {
                http: Some(service.check_url.clone()),
                interval: Some(service.check_interval.clone()),
                timeout: Some(check_timeout(&service.check_interval)),
                tls_skip_verify: true,
                ttl: None,
            })
        } else if !service.check_ttl.is_empty() {
            Some(AgentServiceCheck {
                http: None,
                interval: None,
                timeout: None,
                tls_skip_verify: false,
                ttl: Some(service.check_ttl.clone()),
            })
        } else {
            None
        }
    }
}

/// Check timeout: 5s unless half the interval exceeds one second, in which
/// case half the interval.
fn check_timeout(interval: &str) -> String {
    if let Ok(parsed) = parse_duration(interval) {
        let half = parsed / 2;
        if half > Duration::from_secs(1) {
            return format_duration(half);
        }
    }
    DEFAULT_CHECK_TIMEOUT.to_string()
}

async fn expect_success(
    response: reqwest::Response,
    op: &'static str,
) -> Result<reqwest::Response, RegistryError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::backend(
        KIND,
        op,
        format!("agent returned {status}: {body}"),
    ))
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn register(&self, service: ServiceInfo) -> Result<(), RegistryError> {
        service.validate()?;
        let registration = AgentServiceRegistration {
            id: service.id.clone(),
            name: service.name.clone(),
            address: service.address.clone(),
            port: service.port,
            tags: service.tags.clone(),
            meta: service.meta.clone(),
            check: Self::build_check(&service),
        };
        let response = self
            .request(reqwest::Method::PUT, "agent/service/register")
            .json(&registration)
            .send()
            .await
            .map_err(|e| RegistryError::backend(KIND, "register", e))?;
        expect_success(response, "register").await?;
        info!(name = %service.name, id = %service.id, "service registered with consul");
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        if service_id.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service id cannot be empty".to_string(),
            ));
        }
        // The agent treats a missing id as success; its answer is
        // authoritative here.
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("agent/service/deregister/{service_id}"),
            )
            .send()
            .await
            .map_err(|e| RegistryError::backend(KIND, "deregister", e))?;
        expect_success(response, "deregister").await?;
        info!(id = service_id, "service deregistered from consul");
        Ok(())
    }

    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError> {
        if service_name.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service name cannot be empty".to_string(),
            ));
        }
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("health/service/{service_name}"),
            )
            .query(&[("passing", "true")])
            .send()
            .await
            .map_err(|e| RegistryError::backend(KIND, "get service", e))?;
        let response = expect_success(response, "get service").await?;
        let entries: Vec<HealthServiceEntry> = response
            .json()
            .await
            .map_err(|e| RegistryError::backend(KIND, "decode health response", e))?;

        let instances: Vec<ServiceInfo> = entries
            .into_iter()
            .map(|entry| ServiceInfo {
                name: entry.service.service,
                id: entry.service.id,
                address: entry.service.address,
                port: entry.service.port,
                tags: entry.service.tags.unwrap_or_default(),
                meta: entry.service.meta.unwrap_or_default(),
                ..ServiceInfo::default()
            })
            .collect();
        debug!(
            name = service_name,
            count = instances.len(),
            "consul instances found"
        );
        Ok(instances)
    }

    async fn close(&self) -> Result<(), RegistryError> {
        info!("closing consul service registry");
        Ok(())
    }
}
