use crate::registry::RegistryKind;

/// Errors surfaced by the service registry layer.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported registry backend: {0}")]
    UnsupportedBackend(String),

    #[error("service registry not initialized")]
    NotInitialized,

    #[error("service with id {0} not found")]
    NotFound(String),

    #[error("no healthy instances found for service: {0}")]
    NoInstances(String),

    #[error("{backend} registry: {op} failed: {source}")]
    Backend {
        backend: RegistryKind,
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RegistryError {
    pub(crate) fn backend(
        backend: RegistryKind,
        op: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Backend {
            backend,
            op,
            source: source.into(),
        }
    }
}
