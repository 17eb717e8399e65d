use async_trait::async_trait;
use static_egress_common::{aggregate_routes, DesiredState};
use tracing::info;

use super::{Provider, ProviderError};

pub const PROVIDER_NAME: &str = "noop";

/// Provider that only reports what it was asked to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvider;

impl NoopProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for NoopProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn ensure(&self, configs: &DesiredState) -> Result<(), ProviderError> {
        let routes: Vec<String> = aggregate_routes(configs)
            .iter()
            .map(ToString::to_string)
            .collect();
        info!(
            provider = PROVIDER_NAME,
            resources = configs.len(),
            routes = ?routes,
            "Ensure"
        );
        Ok(())
    }
}
