//! Lifecycle front door: turns string-form configuration into a registry
//! `Config` and a `ServiceInfo`, initializes the process-wide registry,
//! registers the service, and optionally deregisters it on SIGINT/SIGTERM.

use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::registry::{
    self, provider, Config, RegistryKind, ServiceInfo, DEFAULT_CONSUL_ADDRESS,
    DEFAULT_ETCD_ADDRESS, DEFAULT_ZOOKEEPER_ADDRESS,
};

/// Initializes the process-wide service registry from a string backend tag.
pub async fn init_service_registry(kind_tag: &str, config: Config) -> Result<(), RegistryError> {
    let kind: RegistryKind = kind_tag.parse()?;
    info!(kind = %kind, address = %config.address, "initializing service registry");

    let registry = match registry::new_registry(kind, config).await {
        Ok(registry) => registry,
        Err(e) => {
            error!(kind = %kind, error = %e, "failed to initialize service registry");
            return Err(e);
        }
    };
    provider::set_registry(registry);
    info!(kind = %kind, "service registry initialized");
    Ok(())
}

/// Registers a service with the active registry.
pub async fn register_service(service: ServiceInfo) -> Result<(), RegistryError> {
    let registry = provider::get_registry().ok_or(RegistryError::NotInitialized)?;
    info!(
        name = %service.name,
        id = %service.id,
        address = %service.address,
        port = service.port,
        "registering service"
    );
    let name = service.name.clone();
    let id = service.id.clone();
    if let Err(e) = registry.register(service).await {
        error!(name = %name, id = %id, error = %e, "failed to register service");
        return Err(e);
    }
    info!(name = %name, id = %id, "service registered");
    Ok(())
}

/// Deregisters a service from the active registry.
pub async fn deregister_service(service_id: &str) -> Result<(), RegistryError> {
    let registry = provider::get_registry().ok_or(RegistryError::NotInitialized)?;
    info!(id = service_id, "deregistering service");
    if let Err(e) = registry.deregister(service_id).await {
        error!(id = service_id, error = %e, "failed to deregister service");
        return Err(e);
    }
    info!(id = service_id, "service deregistered");
    Ok(())
}

/// Resolves the URL of the first healthy instance of `service_name`.
pub async fn get_service_url(service_name: &str) -> Result<String, RegistryError> {
    let registry = provider::get_registry().ok_or(RegistryError::NotInitialized)?;
    debug!(name = service_name, "getting service url");
    match registry.get_service_url(service_name).await {
        Ok(url) => {
            debug!(name = service_name, url = %url, "service url retrieved");
            Ok(url)
        }
        Err(e) => {
            error!(name = service_name, error = %e, "failed to get service url");
            Err(e)
        }
    }
}

/// Closes the active registry. A no-op when none was initialized.
pub async fn close_service_registry() -> Result<(), RegistryError> {
    let Some(registry) = provider::get_registry() else {
        return Ok(());
    };
    info!("closing service registry");
    if let Err(e) = registry.close().await {
        error!(error = %e, "failed to close service registry");
        return Err(e);
    }
    info!("service registry closed");
    Ok(())
}

/// Generates the instance id `<name>-<hostname>-<pid>`.
pub fn generate_service_id(service_name: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    service_id_for(service_name, &host, std::process::id())
}

fn service_id_for(service_name: &str, host: &str, pid: u32) -> String {
    format!("{service_name}-{host}-{pid}")
}

/// Everything needed to initialize the registry and register this process.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistryConfig {
    pub registry: RegistrySettings,
    pub service: ServiceSettings,
    /// Deregister and close on SIGINT/SIGTERM.
    pub setup_graceful_shutdown: bool,
}

/// Connection settings for the registry backend, all in string form.
#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    /// Backend tag: "consul", "zookeeper" or "etcd". Empty disables
    /// registration entirely.
    pub kind: String,
    pub address: String,
    pub token: String,
    pub username: String,
    pub password: String,
}

/// Settings describing the service being registered.
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub name: String,
    pub port: String,
    pub address: String,
    /// Comma-separated tags.
    pub tags: String,
    /// URL scheme advertised via meta ("http"/"https").
    pub scheme: String,
    pub health_check: HealthCheckSettings,
}

#[derive(Debug, Clone, Default)]
pub struct HealthCheckSettings {
    pub url: String,
    pub ttl: String,
    pub interval: String,
}

fn default_registry_address(kind_tag: &str) -> &'static str {
    match kind_tag {
        "zookeeper" => DEFAULT_ZOOKEEPER_ADDRESS,
        "etcd" => DEFAULT_ETCD_ADDRESS,
        _ => DEFAULT_CONSUL_ADDRESS,
    }
}

fn build_registry_config(settings: &RegistrySettings) -> Config {
    let mut address = settings.address.clone();
    if address.is_empty() {
        address = default_registry_address(&settings.kind).to_string();
        warn!(
            kind = %settings.kind,
            address = %address,
            "registry address not provided, using default"
        );
    }

    let mut config = Config {
        address,
        ..Config::default()
    };
    if !settings.token.is_empty() {
        config
            .options
            .insert("token".to_string(), settings.token.clone().into());
    }
    if !settings.username.is_empty() {
        config
            .options
            .insert("username".to_string(), settings.username.clone().into());
    }
    if !settings.password.is_empty() {
        config
            .options
            .insert("password".to_string(), settings.password.clone().into());
    }
    config
}

fn build_service_info(settings: &ServiceSettings) -> ServiceInfo {
    let mut port = 8080u16;
    if !settings.port.is_empty() {
        match settings.port.parse::<u16>() {
            Ok(parsed) if parsed > 0 => port = parsed,
            _ => warn!(
                port = %settings.port,
                "invalid port number, using default port 8080"
            ),
        }
    }

    let mut address = settings.address.clone();
    if address.is_empty() {
        address = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        warn!(address = %address, "service address not provided, using hostname");
    }

    let tags: Vec<String> = if settings.tags.is_empty() {
        Vec::new()
    } else {
        settings.tags.split(',').map(str::to_string).collect()
    };

    let mut name = settings.name.clone();
    if name.is_empty() {
        name = "service".to_string();
        warn!(name = %name, "service name not provided, using default name");
    }
    let id = generate_service_id(&name);

    let check_interval = if settings.health_check.interval.is_empty() {
        "10s".to_string()
    } else {
        settings.health_check.interval.clone()
    };

    let mut service = ServiceInfo {
        name,
        id,
        address,
        port,
        tags,
        check_url: settings.health_check.url.clone(),
        check_ttl: settings.health_check.ttl.clone(),
        check_interval,
        ..ServiceInfo::default()
    };
    if !settings.scheme.is_empty() {
        service
            .meta
            .insert("scheme".to_string(), settings.scheme.clone());
    }
    service
}

/// Initializes the registry and registers this process in one step, returning
/// the generated service id. An empty registry kind disables registration and
/// returns an empty id.
pub async fn init_and_register_service(
    config: ServiceRegistryConfig,
) -> Result<String, RegistryError> {
    if config.registry.kind.is_empty() {
        info!("service registry disabled, skipping initialization");
        return Ok(String::new());
    }

    let registry_config = build_registry_config(&config.registry);
    init_service_registry(&config.registry.kind, registry_config).await?;

    let service = build_service_info(&config.service);
    let service_id = service.id.clone();
    register_service(service).await?;

    if config.setup_graceful_shutdown {
        setup_graceful_shutdown(service_id.clone());
    }
    Ok(service_id)
}

/// Installs a one-shot handler: on the first SIGINT or SIGTERM the service is
/// deregistered, the registry is closed, and the process exits 0. Errors on
/// the way out are logged, never propagated.
pub fn setup_graceful_shutdown(service_id: String) {
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_service(&service_id).await;
        std::process::exit(0);
    });
}

/// Best-effort deregistration and registry close, run once a termination
/// signal arrived. Errors are logged and swallowed so shutdown proceeds.
pub(crate) async fn shutdown_service(service_id: &str) {
    info!(id = service_id, "shutting down service");
    if let Err(e) = deregister_service(service_id).await {
        error!(id = service_id, error = %e, "deregistration failed during shutdown");
    }
    if let Err(e) = close_service_registry().await {
        error!(error = %e, "registry close failed during shutdown");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C");
        }
        () = terminate => {
            info!("received SIGTERM");
        }
    }
}
