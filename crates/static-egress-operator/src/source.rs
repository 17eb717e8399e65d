//! Source of desired egress destinations

use async_trait::async_trait;
use static_egress_common::EgressConfig;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to list egress configuration: {0}")]
    List(#[from] kube::Error),

    #[error("Change stream was already taken")]
    StreamTaken,
}

/// Produces the egress configuration declared in the cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EgressConfigSource: Send + Sync {
    /// Lists every configuration object currently present.
    async fn list_configs(&self) -> Result<Vec<EgressConfig>, SourceError>;

    /// Hands out the stream of changes, one [`EgressConfig`] per add, update
    /// or delete. Only the first call returns a stream.
    fn take_changes(&self) -> Option<mpsc::Receiver<EgressConfig>>;
}
