//! ConfigMap backed egress configuration
//!
//! Every ConfigMap labelled `egress=static` declares destinations: each data
//! value is one CIDR, keys are free-form.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use parking_lot::Mutex;
use static_egress_common::{parse_destination, EgressConfig, Resource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::source::{EgressConfigSource, SourceError};

pub const EGRESS_LABEL_SELECTOR: &str = "egress=static";

/// Bound of the change channel; the watcher waits while the controller is busy.
const CHANGE_BUFFER: usize = 32;

pub struct ConfigMapWatcher {
    api: Api<ConfigMap>,
    sender: mpsc::Sender<EgressConfig>,
    receiver: Mutex<Option<mpsc::Receiver<EgressConfig>>>,
}

impl ConfigMapWatcher {
    /// Watches `namespace`, or all namespaces when `None`.
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let (sender, receiver) = mpsc::channel(CHANGE_BUFFER);

        Self {
            api,
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Starts forwarding ConfigMap changes until `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let api = self.api.clone();
        let sender = self.sender.clone();
        tokio::spawn(watch(api, sender, cancel))
    }
}

#[async_trait]
impl EgressConfigSource for ConfigMapWatcher {
    #[instrument(skip(self))]
    async fn list_configs(&self) -> Result<Vec<EgressConfig>, SourceError> {
        let list = self
            .api
            .list(&ListParams::default().labels(EGRESS_LABEL_SELECTOR))
            .await?;

        debug!(count = list.items.len(), "Listed egress ConfigMaps");
        Ok(list.items.iter().map(configmap_to_egress_config).collect())
    }

    fn take_changes(&self) -> Option<mpsc::Receiver<EgressConfig>> {
        self.receiver.lock().take()
    }
}

async fn watch(api: Api<ConfigMap>, sender: mpsc::Sender<EgressConfig>, cancel: CancellationToken) {
    let config = watcher::Config::default().labels(EGRESS_LABEL_SELECTOR);
    let mut stream = watcher::watcher(api, config).default_backoff().boxed();
    let mut tracker = ResourceTracker::default();

    info!(selector = EGRESS_LABEL_SELECTOR, "Starting ConfigMap watcher");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };

        let changes = match event {
            Some(Ok(Event::Apply(cm))) | Some(Ok(Event::InitApply(cm))) => {
                let config = configmap_to_egress_config(&cm);
                tracker.applied(&config.resource);
                vec![config]
            }
            Some(Ok(Event::Delete(cm))) => {
                let resource = configmap_resource(&cm);
                debug!(configmap = %resource, "ConfigMap deleted");
                tracker.deleted(&resource);
                vec![EgressConfig::removed(resource)]
            }
            Some(Ok(Event::Init)) => {
                tracker.init_started();
                vec![]
            }
            Some(Ok(Event::InitDone)) => tracker
                .init_done()
                .into_iter()
                .map(EgressConfig::removed)
                .collect(),
            Some(Err(e)) => {
                warn!(error = %e, "ConfigMap watch failed, retrying");
                vec![]
            }
            None => break,
        };

        for change in changes {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = sender.send(change) => {
                    if sent.is_err() {
                        debug!("Change channel closed, stopping ConfigMap watcher");
                        return;
                    }
                }
            }
        }
    }

    info!("ConfigMap watcher stopped");
}

/// Remembers which ConfigMaps were seen so that ones deleted while the watch
/// was disconnected are reported once it relists.
#[derive(Debug, Default)]
struct ResourceTracker {
    known: HashSet<Resource>,
    relisted: Option<HashSet<Resource>>,
}

impl ResourceTracker {
    fn applied(&mut self, resource: &Resource) {
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.insert(resource.clone());
        }
        self.known.insert(resource.clone());
    }

    fn deleted(&mut self, resource: &Resource) {
        self.known.remove(resource);
    }

    fn init_started(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    /// Returns the resources that disappeared during the relist.
    fn init_done(&mut self) -> Vec<Resource> {
        let Some(relisted) = self.relisted.take() else {
            return vec![];
        };
        let mut vanished: Vec<Resource> = self.known.difference(&relisted).cloned().collect();
        vanished.sort();
        self.known = relisted;
        vanished
    }
}

fn configmap_resource(cm: &ConfigMap) -> Resource {
    Resource::new(
        cm.metadata.name.clone().unwrap_or_default(),
        cm.metadata.namespace.clone().unwrap_or_default(),
    )
}

/// Parses the destinations declared by `cm`. Invalid values are skipped.
pub fn configmap_to_egress_config(cm: &ConfigMap) -> EgressConfig {
    let resource = configmap_resource(cm);

    let ip_addresses = cm
        .data
        .iter()
        .flatten()
        .filter_map(|(key, value)| match parse_destination(value) {
            Ok(net) => Some(net),
            Err(e) => {
                warn!(
                    configmap = %resource,
                    key = %key,
                    error = %e,
                    "Skipping invalid destination"
                );
                None
            }
        })
        .collect::<Vec<_>>();

    EgressConfig::new(resource, ip_addresses)
}
