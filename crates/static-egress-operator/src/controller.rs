//! The egress control loop
//!
//! One task owns the desired-state cache. It is filled from a full listing
//! at startup, then kept current from the change stream; every change and
//! every resync tick hands the whole cache to the provider.

use std::sync::Arc;
use std::time::Duration;

use static_egress_common::{DesiredState, EgressConfig};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::HealthState;
use crate::metrics::ControllerMetrics;
use crate::provider::Provider;
use crate::source::{EgressConfigSource, SourceError};

/// Delay between attempts of the initial listing.
pub const BOOTSTRAP_RETRY_INTERVAL: Duration = Duration::from_secs(3);

pub struct EgressController {
    provider: Arc<dyn Provider>,
    source: Arc<dyn EgressConfigSource>,
    resync_interval: Duration,
    metrics: Arc<ControllerMetrics>,
    health: Option<Arc<HealthState>>,
    cache: DesiredState,
}

impl EgressController {
    pub fn new(
        provider: Arc<dyn Provider>,
        source: Arc<dyn EgressConfigSource>,
        resync_interval: Duration,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            provider,
            source,
            resync_interval,
            metrics,
            health: None,
            cache: DesiredState::new(),
        }
    }

    /// Reports readiness to `health` once the initial listing succeeded.
    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// Runs until `cancel` fires or the change stream ends.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SourceError> {
        let mut changes = self.source.take_changes().ok_or(SourceError::StreamTaken)?;

        info!(
            provider = self.provider.name(),
            resync_interval = ?self.resync_interval,
            "Starting egress controller"
        );

        let Some(configs) = self.bootstrap(&cancel).await else {
            info!("Egress controller cancelled during startup");
            return Ok(());
        };
        for config in configs {
            if !config.is_removal() {
                self.apply(config);
            }
        }
        if let Some(health) = &self.health {
            health.mark_synced();
        }
        self.ensure().await;

        let start = Instant::now() + self.resync_interval;
        let mut resync = interval_at(start, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Egress controller stopping");
                    break;
                }
                _ = resync.tick() => {
                    debug!("Periodic resync");
                    self.ensure().await;
                }
                change = changes.recv() => {
                    let Some(config) = change else {
                        warn!("Egress configuration stream closed, stopping controller");
                        break;
                    };
                    self.apply(config);
                    self.ensure().await;
                }
            }
        }

        Ok(())
    }

    /// Lists the configuration until it succeeds. `None` when cancelled.
    async fn bootstrap(&self, cancel: &CancellationToken) -> Option<Vec<EgressConfig>> {
        loop {
            match self.source.list_configs().await {
                Ok(configs) => {
                    info!(count = configs.len(), "Listed egress configuration");
                    return Some(configs);
                }
                Err(e) => {
                    error!(
                        error = %e,
                        retry_in = ?BOOTSTRAP_RETRY_INTERVAL,
                        "Failed to list egress configuration"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(BOOTSTRAP_RETRY_INTERVAL) => {}
            }
        }
    }

    fn apply(&mut self, config: EgressConfig) {
        if config.is_removal() {
            if self.cache.remove(&config.resource).is_some() {
                info!(resource = %config.resource, "Removed egress destinations");
            }
            return;
        }

        info!(
            resource = %config.resource,
            destinations = config.ip_addresses.len(),
            "Updated egress destinations"
        );
        self.cache.insert(config.resource, config.ip_addresses);
    }

    async fn ensure(&self) {
        match self.provider.ensure(&self.cache).await {
            Ok(()) => {
                self.metrics.record_sync();
                debug!(resources = self.cache.len(), "Egress infrastructure in sync");
            }
            Err(e) => {
                self.metrics.record_failure();
                error!(
                    provider = self.provider.name(),
                    error = %e,
                    "Failed to ensure egress infrastructure"
                );
            }
        }
    }
}
