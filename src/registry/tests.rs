use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::*;
use crate::wrapper;

fn sample_service(name: &str, id: &str) -> ServiceInfo {
    ServiceInfo {
        name: name.to_string(),
        id: id.to_string(),
        address: "10.0.0.5".to_string(),
        port: 8443,
        tags: vec!["edge".to_string()],
        meta: HashMap::from([("scheme".to_string(), "https".to_string())]),
        ..ServiceInfo::default()
    }
}

#[test]
fn service_info_uses_wire_field_names() {
    let service = sample_service("payments", "payments-host1-100");
    let json = serde_json::to_value(&service).unwrap();
    assert_eq!(json["Name"], "payments");
    assert_eq!(json["ID"], "payments-host1-100");
    assert_eq!(json["Address"], "10.0.0.5");
    assert_eq!(json["Port"], 8443);
    assert_eq!(json["Tags"][0], "edge");
    assert_eq!(json["Meta"]["scheme"], "https");
    assert_eq!(json["CheckURL"], "");
}

#[test]
fn service_info_round_trips_through_json() {
    let service = sample_service("payments", "payments-host1-100");
    let encoded = serde_json::to_string(&service).unwrap();
    let decoded: ServiceInfo = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, service);
}

#[test]
fn service_info_tolerates_unknown_and_missing_fields() {
    let decoded: ServiceInfo = serde_json::from_str(
        r#"{"Name":"payments","ID":"p-1","Port":80,"Zone":"eu-1","Weights":{"Passing":1}}"#,
    )
    .unwrap();
    assert_eq!(decoded.name, "payments");
    assert_eq!(decoded.id, "p-1");
    assert_eq!(decoded.port, 80);
    assert!(decoded.address.is_empty());
    assert!(decoded.tags.is_empty());
    assert!(decoded.meta.is_empty());
}

#[test]
fn url_scheme_comes_from_meta_or_defaults_to_http() {
    let mut service = sample_service("payments", "p-1");
    assert_eq!(service.url(), "https://10.0.0.5:8443");

    service.meta.remove("scheme");
    assert_eq!(service.url(), "http://10.0.0.5:8443");

    service.meta.insert("scheme".to_string(), String::new());
    assert_eq!(service.url(), "http://10.0.0.5:8443");
}

#[test]
fn validate_rejects_empty_name_or_id() {
    let mut service = sample_service("", "p-1");
    assert!(matches!(
        service.validate(),
        Err(RegistryError::InvalidInput(_))
    ));

    service.name = "payments".to_string();
    service.id = String::new();
    assert!(matches!(
        service.validate(),
        Err(RegistryError::InvalidInput(_))
    ));

    service.id = "p-1".to_string();
    assert!(service.validate().is_ok());
}

#[test]
fn registry_kind_parses_known_tags() {
    assert_eq!("consul".parse::<RegistryKind>().unwrap(), RegistryKind::Consul);
    assert_eq!(
        "zookeeper".parse::<RegistryKind>().unwrap(),
        RegistryKind::Zookeeper
    );
    assert_eq!("etcd".parse::<RegistryKind>().unwrap(), RegistryKind::Etcd);
    assert_eq!(RegistryKind::Etcd.to_string(), "etcd");

    let err = "redis".parse::<RegistryKind>().unwrap_err();
    assert!(matches!(err, RegistryError::UnsupportedBackend(tag) if tag == "redis"));
}

#[test]
fn option_values_expose_their_variant_only() {
    let mut config = Config::default();
    config
        .options
        .insert("timeout".to_string(), OptionValue::from("5s"));
    config
        .options
        .insert("tls_enabled".to_string(), OptionValue::from(true));
    config.options.insert(
        "servers".to_string(),
        OptionValue::from(vec!["zk-1:2181".to_string()]),
    );

    assert_eq!(config.opt_str("timeout"), Some("5s"));
    assert_eq!(config.opt_bool("tls_enabled"), Some(true));
    assert_eq!(
        config.opt_list("servers"),
        Some(&["zk-1:2181".to_string()][..])
    );
    assert_eq!(config.opt_bool("timeout"), None);
    assert_eq!(config.opt_str("missing"), None);
}

/// In-memory registry used to exercise the provider and wrapper plumbing
/// without a live backend.
#[derive(Default)]
struct StubRegistry {
    instances: Mutex<Vec<ServiceInfo>>,
    closed: AtomicBool,
}

#[async_trait]
impl ServiceRegistry for StubRegistry {
    async fn register(&self, service: ServiceInfo) -> Result<(), RegistryError> {
        service.validate()?;
        let mut instances = self.instances.lock().await;
        instances.retain(|existing| !(existing.name == service.name && existing.id == service.id));
        instances.push(service);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let mut instances = self.instances.lock().await;
        let before = instances.len();
        instances.retain(|existing| existing.id != service_id);
        if instances.len() == before {
            return Err(RegistryError::NotFound(service_id.to_string()));
        }
        Ok(())
    }

    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInfo>, RegistryError> {
        if service_name.is_empty() {
            return Err(RegistryError::InvalidInput(
                "service name cannot be empty".to_string(),
            ));
        }
        let instances = self.instances.lock().await;
        Ok(instances
            .iter()
            .filter(|existing| existing.name == service_name)
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn stub_upsert_keeps_a_single_entry_per_id() {
    let registry = StubRegistry::default();
    registry
        .register(sample_service("payments", "p-1"))
        .await
        .unwrap();

    let mut updated = sample_service("payments", "p-1");
    updated.port = 9000;
    registry.register(updated).await.unwrap();

    let instances = registry.get_service("payments").await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].port, 9000);
}

#[tokio::test]
async fn default_url_resolution_picks_the_first_instance() {
    let registry = StubRegistry::default();
    registry
        .register(sample_service("payments", "p-1"))
        .await
        .unwrap();
    assert_eq!(
        registry.get_service_url("payments").await.unwrap(),
        "https://10.0.0.5:8443"
    );

    registry.deregister("p-1").await.unwrap();
    let err = registry.get_service_url("payments").await.unwrap_err();
    assert!(matches!(err, RegistryError::NoInstances(name) if name == "payments"));
}

// The provider is process-wide state, so everything that observes it lives
// in this single test to keep the assertions deterministic under the
// parallel test runner.
#[tokio::test]
async fn provider_lifecycle() {
    assert!(provider::get_registry().is_none());

    // An unsupported tag fails fast and leaves the provider untouched.
    let err = wrapper::init_service_registry("redis", Config::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnsupportedBackend(_)));
    assert!(provider::get_registry().is_none());

    // Operations before init report NotInitialized; close is a no-op.
    let err = wrapper::register_service(sample_service("payments", "p-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotInitialized));
    let err = wrapper::get_service_url("payments").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotInitialized));
    assert!(wrapper::close_service_registry().await.is_ok());

    let first = Arc::new(StubRegistry::default());
    let first_dyn: Arc<dyn ServiceRegistry> = first.clone();
    provider::set_registry(first_dyn.clone());
    let active = provider::get_registry().unwrap();
    assert!(Arc::ptr_eq(&active, &first_dyn));

    wrapper::register_service(sample_service("payments", "payments-host1-100"))
        .await
        .unwrap();
    assert_eq!(
        wrapper::get_service_url("payments").await.unwrap(),
        "https://10.0.0.5:8443"
    );
    wrapper::deregister_service("payments-host1-100")
        .await
        .unwrap();
    let err = wrapper::get_service_url("payments").await.unwrap_err();
    assert!(matches!(err, RegistryError::NoInstances(_)));

    // A second install replaces the first without closing it.
    let second = Arc::new(StubRegistry::default());
    let second_dyn: Arc<dyn ServiceRegistry> = second.clone();
    provider::set_registry(second_dyn.clone());
    let active = provider::get_registry().unwrap();
    assert!(Arc::ptr_eq(&active, &second_dyn));
    assert!(!first.closed.load(Ordering::SeqCst));

    wrapper::close_service_registry().await.unwrap();
    assert!(second.closed.load(Ordering::SeqCst));
    assert!(!first.closed.load(Ordering::SeqCst));

    // The post-signal shutdown body deregisters the generated id, closes
    // the registry, and swallows errors so the process can still exit.
    let third = Arc::new(StubRegistry::default());
    let third_dyn: Arc<dyn ServiceRegistry> = third.clone();
    provider::set_registry(third_dyn);
    wrapper::register_service(sample_service("tickets", "tickets-host1-9"))
        .await
        .unwrap();
    wrapper::shutdown_service("tickets-host1-9").await;
    assert!(third.get_service("tickets").await.unwrap().is_empty());
    assert!(third.closed.load(Ordering::SeqCst));

    // A second pass hits NotFound on deregister; it must not panic or stall.
    wrapper::shutdown_service("tickets-host1-9").await;
}

// Round trips against live backends. Run with a local registry and
// `cargo test -- --ignored`.

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .try_init();
}

#[tokio::test]
#[ignore = "requires etcd at localhost:2379"]
async fn etcd_round_trip() -> anyhow::Result<()> {
    init_test_logging();
    let registry = new_registry(RegistryKind::Etcd, Config::default()).await?;

    let service = sample_service("payments", "payments-host1-100");
    registry.register(service).await?;

    let instances = registry.get_service("payments").await?;
    assert!(instances.iter().any(|i| i.id == "payments-host1-100"));
    assert_eq!(
        registry.get_service_url("payments").await?,
        "https://10.0.0.5:8443"
    );

    registry.deregister("payments-host1-100").await?;
    assert!(registry.get_service("payments").await?.is_empty());
    let err = registry.get_service_url("payments").await.unwrap_err();
    assert!(matches!(err, RegistryError::NoInstances(_)));

    let err = registry.deregister("payments-host1-100").await.unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));

    registry.close().await?;

    // The connection is released on close; later operations must fail.
    let err = registry
        .register(sample_service("payments", "payments-host1-100"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Backend { .. }));
    let err = registry.get_service("payments").await.unwrap_err();
    assert!(matches!(err, RegistryError::Backend { .. }));
    Ok(())
}

#[tokio::test]
#[ignore = "requires etcd at localhost:2379"]
async fn etcd_lease_expires_without_keep_alive() -> anyhow::Result<()> {
    init_test_logging();
    let registry = new_registry(RegistryKind::Etcd, Config::default()).await?;

    let mut service = sample_service("billing", "billing-host1-1");
    service.check_ttl = "12s".to_string();
    registry.register(service).await?;

    // Closing cancels the keep-alive task; the lease then runs out.
    registry.close().await?;
    tokio::time::sleep(std::time::Duration::from_secs(15)).await;

    let fresh = new_registry(RegistryKind::Etcd, Config::default()).await?;
    assert!(fresh.get_service("billing").await?.is_empty());
    fresh.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires zookeeper at localhost:2181"]
async fn zookeeper_ephemeral_instance_vanishes_on_close() -> anyhow::Result<()> {
    init_test_logging();
    // Empty address exercises the localhost:2181 default and base path
    // creation (tolerated when /services already exists).
    let registry = new_registry(RegistryKind::Zookeeper, Config::default()).await?;

    let mut service = sample_service("tickets", "tickets-host1-1");
    service.check_ttl = "10s".to_string();
    registry.register(service).await?;

    let instances = registry.get_service("tickets").await?;
    assert!(instances.iter().any(|i| i.id == "tickets-host1-1"));

    registry.close().await?;
    tokio::time::sleep(std::time::Duration::from_secs(8)).await;

    let fresh = new_registry(RegistryKind::Zookeeper, Config::default()).await?;
    assert!(fresh.get_service("tickets").await?.is_empty());
    fresh.close().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a consul agent at localhost:8500"]
async fn consul_register_and_deregister() -> anyhow::Result<()> {
    init_test_logging();
    let registry = new_registry(RegistryKind::Consul, Config::default()).await?;

    let service = sample_service("orders", "orders-host1-1");
    registry.register(service).await?;
    registry.deregister("orders-host1-1").await?;
    registry.close().await?;
    Ok(())
}
